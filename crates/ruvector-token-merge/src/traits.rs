//! Reducer trait.
//!
//! Every strategy implements [`TokenReducer`]: given a layer's merge metric
//! and plan parameters it produces a [`Merge`], and it declares how the
//! embedding stream is combined under that merge.

use tracing::debug;

use crate::error::Result;
use crate::merge::{Merge, ReduceMode};
use crate::schedule::{reduction_count, Amount, Strategy};
use crate::tensor::TokenTensor;

/// Per-layer inputs to a reducer.
#[derive(Clone, Copy, Debug)]
pub struct ReductionRequest<'a> {
    /// Tokens to remove, as a count or a keep ratio.
    pub amount: Amount,
    /// Isolation margin for this layer.
    pub margin: f32,
    /// Optional `[B, T]` attention weights of the current layer.
    pub attention: Option<&'a [f32]>,
}

impl<'a> ReductionRequest<'a> {
    /// Request without attention weights.
    pub fn new(amount: Amount, margin: f32) -> Self {
        Self {
            amount,
            margin,
            attention: None,
        }
    }

    /// Attach attention weights.
    pub fn with_attention(mut self, attention: Option<&'a [f32]>) -> Self {
        self.attention = attention;
        self
    }
}

/// Core trait that every token reduction strategy implements.
pub trait TokenReducer: Send + Sync {
    /// Plan the merge for one layer.
    ///
    /// `metric` is the `[B, T, C]` tensor whose similarity drives matching
    /// (usually the layer's embeddings or keys). It is normalised by the
    /// reducer; callers pass raw values.
    ///
    /// # Errors
    ///
    /// Returns [`ReductionError::ShapeMismatch`](crate::ReductionError::ShapeMismatch)
    /// when auxiliary inputs (attention) do not match the metric.
    fn plan(&self, metric: &TokenTensor, request: &ReductionRequest<'_>) -> Result<Merge>;

    /// Strategy implemented by this reducer.
    fn strategy(&self) -> Strategy;

    /// Mode applied to embeddings when the merge is not size-weighted.
    fn embedding_mode(&self) -> ReduceMode {
        ReduceMode::Mean
    }

    /// Embeddings are merged as a size-weighted average.
    fn size_weighted(&self) -> bool {
        false
    }
}

/// Resolve an amount to a reduction count, logging when it was clamped.
pub(crate) fn resolve_count(amount: Amount, tokens: usize, protected: usize, strategy: Strategy) -> usize {
    let requested = amount.requested(tokens);
    let r = reduction_count(amount, tokens, protected);
    if r < requested {
        debug!(
            strategy = %strategy,
            tokens,
            protected,
            requested,
            applied = r,
            "reduction count clamped"
        );
    }
    r
}

/// Pass-through reducer for layers that keep every token.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdentityReducer;

impl TokenReducer for IdentityReducer {
    fn plan(&self, metric: &TokenTensor, _request: &ReductionRequest<'_>) -> Result<Merge> {
        Ok(Merge::identity(metric.batch, metric.tokens))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Identity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_reducer() {
        let x = TokenTensor::zeros(2, 5, 3);
        let m = IdentityReducer
            .plan(&x, &ReductionRequest::new(Amount::Count(2), 0.9))
            .unwrap();
        assert!(m.is_identity());
        assert_eq!(m.tokens_out(), 5);
        assert_eq!(IdentityReducer.strategy(), Strategy::Identity);
    }

    #[test]
    fn test_resolve_count_clamps() {
        assert_eq!(resolve_count(Amount::Count(10), 5, 1, Strategy::Bipartite), 2);
        assert_eq!(resolve_count(Amount::Count(1), 5, 1, Strategy::Bipartite), 1);
    }
}
