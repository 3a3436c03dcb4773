//! Per-forward-pass reduction context.
//!
//! A [`ReductionPass`] is opened by
//! [`TokenMergeRouter::begin_pass`](crate::TokenMergeRouter::begin_pass) at
//! the start of a forward pass and owns everything that lives for exactly
//! that pass: the size and source tensors, the set of layers already
//! reduced, the last layer's merge and the running [`PassStats`]. Nothing
//! is shared between passes; dropping the pass discards its state.
//!
//! Layers are consumed exactly once each, in layer order.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bookkeeping::{merge_attention_mask, merge_source};
use crate::error::{ReductionError, Result};
use crate::merge::Merge;
use crate::router::TokenMergeRouter;
use crate::schedule::{Schedule, Strategy};
use crate::tensor::TokenTensor;

/// Estimated FLOPs of one transformer block on `tokens` tokens of width
/// `channels`, per batch element: attention projections, attention scores
/// and a 4x MLP (`4NC^2 + 2N^2C + 8NC^2`).
pub fn block_flops(tokens: usize, channels: usize) -> f64 {
    let n = tokens as f64;
    let c = channels as f64;
    4.0 * n * c * c + 2.0 * n * n * c + 8.0 * n * c * c
}

/// What happened at one layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Layer index.
    pub layer: usize,
    /// Scheduled strategy.
    pub strategy: Strategy,
    /// Tokens entering the layer.
    pub tokens_in: usize,
    /// Tokens leaving the layer.
    pub tokens_out: usize,
    /// Block FLOPs on the tokens entering the layer.
    pub flops: f64,
}

/// Per-pass reduction statistics.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PassStats {
    /// One record per reduced layer, in call order.
    pub layers: Vec<LayerStats>,
    /// Sum of [`LayerStats::flops`].
    pub total_flops: f64,
    /// FLOPs the same layers would cost without any reduction.
    pub baseline_flops: f64,
}

impl PassStats {
    fn record(&mut self, stats: LayerStats, original_tokens: usize, channels: usize) {
        self.total_flops += stats.flops;
        self.baseline_flops += block_flops(original_tokens, channels);
        self.layers.push(stats);
    }

    /// Tokens removed over the whole pass.
    pub fn tokens_removed(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.tokens_in.saturating_sub(l.tokens_out))
            .sum()
    }

    /// `total_flops / baseline_flops`, or 1.0 before any layer ran.
    pub fn flops_ratio(&self) -> f64 {
        if self.baseline_flops > 0.0 {
            self.total_flops / self.baseline_flops
        } else {
            1.0
        }
    }
}

/// Bookkeeping handed back to the host at the end of a pass.
#[derive(Clone, Debug, PartialEq)]
pub struct PassOutput {
    /// `[B, T_final, 1]` token sizes; `None` if no layer ran.
    pub size: Option<TokenTensor>,
    /// `[B, T_final, T_original]` provenance, when tracing is enabled.
    pub source: Option<TokenTensor>,
    /// Per-layer statistics.
    pub stats: PassStats,
}

/// Reduction state of one forward pass.
#[derive(Debug)]
pub struct ReductionPass<'a> {
    router: &'a TokenMergeRouter,
    schedule: &'a Schedule,
    next_layer: usize,
    original_tokens: Option<usize>,
    size: Option<TokenTensor>,
    source: Option<TokenTensor>,
    last_merge: Option<Merge>,
    stats: PassStats,
}

impl<'a> ReductionPass<'a> {
    pub(crate) fn new(router: &'a TokenMergeRouter, schedule: &'a Schedule) -> Self {
        Self {
            router,
            schedule,
            next_layer: 0,
            original_tokens: None,
            size: None,
            source: None,
            last_merge: None,
            stats: PassStats::default(),
        }
    }

    /// Reduce the embeddings of `layer`, using them as the merge metric.
    pub fn reduce_layer(
        &mut self,
        layer: usize,
        x: &TokenTensor,
        attention: Option<&[f32]>,
    ) -> Result<TokenTensor> {
        self.reduce_layer_with_metric(layer, x, x, attention)
    }

    /// Reduce the embeddings of `layer`, matching on a separate `metric`
    /// (for example the layer's keys) with the same `[B, T]` axes.
    pub fn reduce_layer_with_metric(
        &mut self,
        layer: usize,
        x: &TokenTensor,
        metric: &TokenTensor,
        attention: Option<&[f32]>,
    ) -> Result<TokenTensor> {
        let plan = *self.schedule.plan(layer)?;
        if layer < self.next_layer {
            return Err(ReductionError::LayerReplayed { layer });
        }
        if layer > self.next_layer {
            return Err(ReductionError::LayerOutOfOrder {
                layer,
                expected: self.next_layer,
            });
        }
        metric.expect_tokens(x.batch, x.tokens, "merge metric")?;

        let (batch, tokens, channels) = x.shape();
        let trace_source = self.router.config().trace_source;
        if self.size.is_none() {
            self.original_tokens = Some(tokens);
        }
        let original = self.original_tokens.unwrap_or(tokens);

        let ones;
        let size = match &self.size {
            Some(size) => {
                size.expect_tokens(batch, tokens, "pass size")?;
                size
            }
            None => {
                ones = TokenTensor::ones_size(batch, tokens);
                &ones
            }
        };

        let merge = self.router.plan(metric, &plan, attention)?;
        let (merged, merged_size) = self.router.merge_embeddings(plan.strategy, &merge, x, Some(size))?;

        if trace_source && !merge.is_identity() {
            self.source = Some(merge_source(&merge, self.source.as_ref())?);
        }

        self.next_layer += 1;
        self.size = Some(merged_size);
        self.stats.record(
            LayerStats {
                layer,
                strategy: plan.strategy,
                tokens_in: tokens,
                tokens_out: merge.tokens_out(),
                flops: block_flops(tokens, channels),
            },
            original,
            channels,
        );

        debug!(
            layer,
            strategy = %plan.strategy,
            tokens_in = tokens,
            tokens_out = merge.tokens_out(),
            r = merge.reduced(),
            "layer reduced"
        );

        self.last_merge = Some(merge);
        Ok(merged)
    }

    /// Apply the last layer's merge to an attention mask (`[B, T, 1]`).
    /// Before any layer ran the mask is returned unchanged.
    pub fn apply_to_mask(&self, mask: &TokenTensor) -> Result<TokenTensor> {
        match &self.last_merge {
            Some(merge) => merge_attention_mask(merge, mask),
            None => Ok(mask.clone()),
        }
    }

    /// Merge of the most recently reduced layer.
    pub fn last_merge(&self) -> Option<&Merge> {
        self.last_merge.as_ref()
    }

    /// Current size tensor.
    pub fn size(&self) -> Option<&TokenTensor> {
        self.size.as_ref()
    }

    /// Current source tensor (only when tracing is enabled).
    pub fn source(&self) -> Option<&TokenTensor> {
        self.source.as_ref()
    }

    /// Statistics so far.
    pub fn stats(&self) -> &PassStats {
        &self.stats
    }

    /// Whether `layer` was already reduced in this pass.
    pub fn is_visited(&self, layer: usize) -> bool {
        layer < self.next_layer
    }

    /// Next layer this pass will accept.
    pub fn next_layer(&self) -> usize {
        self.next_layer
    }

    /// Close the pass and hand back its bookkeeping.
    pub fn finish(self) -> PassOutput {
        if self.next_layer < self.schedule.len() {
            warn!(
                reduced = self.next_layer,
                layers = self.schedule.len(),
                "reduction pass finished before the last scheduled layer"
            );
        }
        debug!(
            layers = self.stats.layers.len(),
            removed = self.stats.tokens_removed(),
            flops_ratio = self.stats.flops_ratio(),
            "reduction pass finished"
        );
        PassOutput {
            size: self.size,
            source: self.source,
            stats: self.stats,
        }
    }
}
