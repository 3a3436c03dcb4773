//! Bipartite soft matching.
//!
//! Tokens are split by parity into `A` (even) and `B` (odd). Each `A`
//! token's best `B` partner is found by cosine similarity, the `r`
//! strongest edges are merged, and everything else is kept.
//!
//! The same matching backs two strategies:
//!
//! - [`Strategy::Bipartite`]: donors are averaged into their partner,
//!   weighted by size; output is `[aggregate] + unmerged A + B`.
//! - [`Strategy::Prune`]: donors are dropped; survivors keep their
//!   original order. Size and source still fold into the partner so the
//!   bookkeeping invariants hold.

use tracing::trace;

use crate::config::ReductionConfig;
use crate::error::Result;
use crate::merge::{Layout, Merge, ReduceMode};
use crate::partition::bipartite_split;
use crate::schedule::Strategy;
use crate::scoring::{bipartite_scores, normalize_metric};
use crate::tensor::TokenTensor;
use crate::traits::{resolve_count, ReductionRequest, TokenReducer};

/// Even/odd soft matching reducer.
#[derive(Clone, Debug)]
pub struct BipartiteReducer {
    class_token: bool,
    eps: f32,
    layout: Layout,
}

impl BipartiteReducer {
    /// Merging reducer (ToMe).
    pub fn new(config: &ReductionConfig) -> Self {
        Self {
            class_token: config.class_token,
            eps: config.eps,
            layout: Layout::Grouped,
        }
    }

    /// Pruning reducer: donors are discarded.
    pub fn pruning(config: &ReductionConfig) -> Self {
        Self {
            layout: Layout::Positional,
            ..Self::new(config)
        }
    }

    /// Plan a merge removing exactly `r` tokens; `r` must already be clamped.
    pub fn plan_count(&self, metric: &TokenTensor, r: usize) -> Result<Merge> {
        let (batch, tokens, _) = metric.shape();
        if r == 0 {
            return Ok(Merge::identity(batch, tokens));
        }

        let normed = normalize_metric(metric, self.eps);
        let scores = bipartite_scores(&normed, self.class_token);
        let splits = (0..batch)
            .map(|b| bipartite_split(&scores, b, r, self.class_token))
            .collect();

        trace!(batch, tokens, r, layout = ?self.layout, "bipartite plan");
        Merge::from_splits(batch, tokens, self.class_token, self.layout, splits)
    }
}

impl TokenReducer for BipartiteReducer {
    fn plan(&self, metric: &TokenTensor, request: &ReductionRequest<'_>) -> Result<Merge> {
        let r = resolve_count(
            request.amount,
            metric.tokens,
            usize::from(self.class_token),
            self.strategy(),
        );
        self.plan_count(metric, r)
    }

    fn strategy(&self) -> Strategy {
        match self.layout {
            Layout::Grouped => Strategy::Bipartite,
            Layout::Positional => Strategy::Prune,
        }
    }

    fn embedding_mode(&self) -> ReduceMode {
        match self.layout {
            Layout::Grouped => ReduceMode::Mean,
            Layout::Positional => ReduceMode::Prune,
        }
    }

    fn size_weighted(&self) -> bool {
        self.layout == Layout::Grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::Amount;

    fn tokens(rows: &[[f32; 2]]) -> TokenTensor {
        let data = rows.iter().flat_map(|r| r.iter().copied()).collect();
        TokenTensor::from_vec(data, 1, rows.len(), 2).unwrap()
    }

    #[test]
    fn test_merges_closest_pairs() {
        // 0~1 and 2~3 are near-duplicates, 4 and 5 are far apart.
        let x = tokens(&[[1.0, 0.0], [0.99, 0.1], [0.0, 1.0], [0.1, 0.99], [-1.0, 0.2], [0.3, -1.0]]);
        let cfg = ReductionConfig::vision().with_class_token(false);
        let m = BipartiteReducer::new(&cfg).plan_count(&x, 2).unwrap();

        assert_eq!(m.tokens_out(), 4);
        let split = &m.splits()[0];
        assert_eq!(split.src, vec![0, 2]);
        assert_eq!(split.dst, vec![1, 3]);
        assert_eq!(split.protected, vec![4]);
    }

    #[test]
    fn test_class_token_never_merged() {
        let x = tokens(&[[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [0.0, 1.0], [0.0, 1.0]]);
        let cfg = ReductionConfig::vision();
        let m = BipartiteReducer::new(&cfg)
            .plan(&x, &ReductionRequest::new(Amount::Count(5), 0.9))
            .unwrap();
        // clamp: (5 - 1) / 2 = 2
        assert_eq!(m.reduced(), 2);
        assert!(!m.splits()[0].src.contains(&0));
        assert_eq!(m.destination(0, 0), Some(0));
    }

    #[test]
    fn test_pruning_reducer_strategy() {
        let cfg = ReductionConfig::vision();
        let p = BipartiteReducer::pruning(&cfg);
        assert_eq!(p.strategy(), Strategy::Prune);
        assert_eq!(p.embedding_mode(), ReduceMode::Prune);
        assert!(!p.size_weighted());
        assert!(BipartiteReducer::new(&cfg).size_weighted());
    }
}
