//! Isolation-score clustering (PiToMe).
//!
//! Content tokens are ranked by an isolation score: the mean of their
//! margin-sharpened similarity to every other token, or the host's
//! attention weights. The `2r` best-ranked tokens become candidates; the
//! first half merges into its most similar partner in the second half.
//!
//! At margins of `margin_fallback` (0.45) and above the sharpened scores
//! stop separating redundant from distinct tokens, and planning routes to
//! plain bipartite matching with the same amount.

use tracing::debug;

use crate::bipartite::BipartiteReducer;
use crate::config::ReductionConfig;
use crate::error::Result;
use crate::merge::{Layout, Merge};
use crate::partition::isolation_split;
use crate::schedule::Strategy;
use crate::scoring::{isolation_scores, normalize_metric};
use crate::tensor::TokenTensor;
use crate::traits::{resolve_count, ReductionRequest, TokenReducer};

/// Margin-based isolation reducer.
#[derive(Clone, Debug)]
pub struct IsolationReducer {
    config: ReductionConfig,
    fallback: BipartiteReducer,
}

impl IsolationReducer {
    /// Reducer using the scoring and ranking settings of `config`.
    pub fn new(config: &ReductionConfig) -> Self {
        Self {
            config: config.clone(),
            fallback: BipartiteReducer::new(config),
        }
    }

    /// Whether `margin` routes to bipartite matching.
    #[inline]
    pub fn falls_back(&self, margin: f32) -> bool {
        margin >= self.config.margin_fallback
    }
}

impl TokenReducer for IsolationReducer {
    fn plan(&self, metric: &TokenTensor, request: &ReductionRequest<'_>) -> Result<Merge> {
        if self.falls_back(request.margin) {
            debug!(
                margin = request.margin,
                threshold = self.config.margin_fallback,
                "isolation margin above threshold, using bipartite matching"
            );
            return self.fallback.plan(metric, request);
        }

        let (batch, tokens, _) = metric.shape();
        let offset = self.config.protected_count().min(tokens);
        let content = tokens - offset;
        let r = resolve_count(request.amount, content, 0, Strategy::Isolation);
        if r == 0 {
            return Ok(Merge::identity(batch, tokens));
        }

        let normed = normalize_metric(metric, self.config.eps);
        let scores = isolation_scores(&normed, offset, request.margin, &self.config, request.attention)?;
        let order = self.config.rank_order(scores.signal);
        if scores.signal != self.config.scoring {
            debug!(?order, "no attention supplied, ranking isolation candidates by similarity");
        }
        let splits = (0..batch)
            .map(|b| isolation_split(&scores, b, r, offset, order))
            .collect();

        let merge = Merge::from_splits(batch, tokens, self.config.class_token, Layout::Grouped, splits)?;
        Ok(merge.with_isolation_scores(scores.score))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Isolation
    }

    fn size_weighted(&self) -> bool {
        true
    }
}
