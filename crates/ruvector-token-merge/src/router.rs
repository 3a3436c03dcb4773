//! Strategy router.
//!
//! The [`TokenMergeRouter`] owns one reducer per [`Strategy`] and picks the
//! one a [`LayerPlan`] names. It also decides how each strategy combines
//! the embedding stream and opens per-pass contexts.
//!
//! # Embedding merge per strategy
//!
//! | Strategy | Embeddings | Size | Source |
//! |----------|------------|------|--------|
//! | `Identity` | unchanged | unchanged | unchanged |
//! | `Bipartite` | size-weighted mean | sum | max |
//! | `Isolation` | size-weighted mean | sum | max |
//! | `Prune` | donors dropped | sum | max |
//! | `Spectral` | DCT truncation | sum | max |

use std::str::FromStr;

use tracing::debug;

use crate::bipartite::BipartiteReducer;
use crate::bookkeeping::{merge_size, merge_wavg};
use crate::config::ReductionConfig;
use crate::error::Result;
use crate::isolation::IsolationReducer;
use crate::merge::Merge;
use crate::pass::ReductionPass;
use crate::schedule::{Amount, LayerPlan, Schedule, Strategy};
use crate::spectral::SpectralReducer;
use crate::tensor::TokenTensor;
use crate::traits::{IdentityReducer, ReductionRequest, TokenReducer};

// ---------------------------------------------------------------------------
// Reduction
// ---------------------------------------------------------------------------

/// Result of a standalone reduction: merged embeddings plus the merge that
/// produced them, reusable on size, source and mask tensors.
#[derive(Clone, Debug, PartialEq)]
pub struct Reduction {
    /// `[B, T - r, C]` merged embeddings.
    pub tokens: TokenTensor,
    /// Merge function of this call.
    pub merge: Merge,
}

// ---------------------------------------------------------------------------
// TokenMergeRouter
// ---------------------------------------------------------------------------

/// Dispatches layer plans to reducers.
#[derive(Clone, Debug)]
pub struct TokenMergeRouter {
    config: ReductionConfig,
    bipartite: BipartiteReducer,
    prune: BipartiteReducer,
    isolation: IsolationReducer,
    spectral: SpectralReducer,
}

impl TokenMergeRouter {
    /// Build a router after validating `config`.
    pub fn new(config: ReductionConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            bipartite: BipartiteReducer::new(&config),
            prune: BipartiteReducer::pruning(&config),
            isolation: IsolationReducer::new(&config),
            spectral: SpectralReducer::new(&config),
            config,
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &ReductionConfig {
        &self.config
    }

    /// Reducer implementing `strategy`.
    pub fn reducer(&self, strategy: Strategy) -> &dyn TokenReducer {
        match strategy {
            Strategy::Identity => &IdentityReducer,
            Strategy::Bipartite => &self.bipartite,
            Strategy::Isolation => &self.isolation,
            Strategy::Spectral => &self.spectral,
            Strategy::Prune => &self.prune,
        }
    }

    /// Plan the merge for one layer, using `metric` for similarity.
    pub fn plan(&self, metric: &TokenTensor, plan: &LayerPlan, attention: Option<&[f32]>) -> Result<Merge> {
        plan.validate()?;
        if plan.is_identity() {
            return Ok(Merge::identity(metric.batch, metric.tokens));
        }
        let request = ReductionRequest::new(plan.amount, plan.margin).with_attention(attention);
        self.reducer(plan.strategy).plan(metric, &request)
    }

    /// Merge embeddings and size under `strategy`.
    ///
    /// Returns `(merged_embeddings, merged_size)`; a missing size counts as
    /// all ones.
    pub fn merge_embeddings(
        &self,
        strategy: Strategy,
        merge: &Merge,
        x: &TokenTensor,
        size: Option<&TokenTensor>,
    ) -> Result<(TokenTensor, TokenTensor)> {
        let reducer = self.reducer(strategy);
        if reducer.size_weighted() {
            return merge_wavg(merge, x, size);
        }
        let merged = merge.apply(x, reducer.embedding_mode())?;
        Ok((merged, merge_size(merge, size)?))
    }

    /// Reduce `x` once, outside of any pass.
    pub fn reduce(&self, x: &TokenTensor, plan: &LayerPlan, attention: Option<&[f32]>) -> Result<Reduction> {
        let merge = self.plan(x, plan, attention)?;
        let (tokens, _) = self.merge_embeddings(plan.strategy, &merge, x, None)?;
        debug!(
            strategy = %plan.strategy,
            tokens_in = merge.tokens_in(),
            tokens_out = merge.tokens_out(),
            "standalone reduction"
        );
        Ok(Reduction { tokens, merge })
    }

    /// [`reduce`](Self::reduce) with the strategy given by name
    /// (`"tome"`, `"pitome"`, `"dct"`, `"tofu"`, `"none"`, ...).
    pub fn reduce_named(
        &self,
        x: &TokenTensor,
        strategy: &str,
        amount: Amount,
        margin: f32,
        attention: Option<&[f32]>,
    ) -> Result<Reduction> {
        let plan = LayerPlan {
            strategy: Strategy::from_str(strategy)?,
            amount,
            margin,
        };
        self.reduce(x, &plan, attention)
    }

    /// Open a forward pass over `schedule` for a `layers`-deep model.
    ///
    /// Fails with [`ScheduleLength`](crate::ReductionError::ScheduleLength)
    /// when the schedule does not cover every layer.
    pub fn begin_pass<'a>(&'a self, schedule: &'a Schedule, layers: usize) -> Result<ReductionPass<'a>> {
        schedule.validate_for(layers)?;
        for plan in schedule.plans() {
            plan.validate()?;
        }
        debug!(layers, trace_source = self.config.trace_source, "reduction pass started");
        Ok(ReductionPass::new(self, schedule))
    }
}

impl Default for TokenMergeRouter {
    fn default() -> Self {
        let config = ReductionConfig::default();
        Self {
            bipartite: BipartiteReducer::new(&config),
            prune: BipartiteReducer::pruning(&config),
            isolation: IsolationReducer::new(&config),
            spectral: SpectralReducer::new(&config),
            config,
        }
    }
}
