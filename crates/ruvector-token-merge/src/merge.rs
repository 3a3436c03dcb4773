//! Merge executor.
//!
//! A [`Merge`] is the reusable "merge function" of one layer: it holds the
//! partition chosen for that layer and applies it to any tensor whose
//! leading axes are `[B, T_in]` (embeddings, size, source, attention mask).
//!
//! Internally every partition is lowered to a [`Grouping`]: each input
//! token is assigned to exactly one output row and each output row names
//! the input token it keeps (its anchor). All reduction modes are a fold
//! over that assignment in ascending input order, which keeps results
//! bit-identical across calls.

use crate::error::{ReductionError, Result};
use crate::partition::Split;
use crate::scoring::{isolation_weights, IsolationWeighting};
use crate::spectral;
use crate::tensor::TokenTensor;

/// How donor rows are combined with their receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReduceMode {
    /// Group mean, receiver included.
    Mean,
    /// Elementwise sum.
    Sum,
    /// Elementwise maximum (provenance, masks).
    Amax,
    /// Donors are dropped; receivers pass through unchanged.
    Prune,
}

/// Output row order of a partition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Layout {
    /// `[aggregate] + protected + receivers`.
    Grouped,
    /// Every surviving token in ascending original position.
    Positional,
}

const UNASSIGNED: usize = usize::MAX;

/// Token-to-row assignment for every batch element.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Grouping {
    tokens_in: usize,
    tokens_out: usize,
    /// `[B, tokens_in]` output row of each input token.
    assignment: Vec<usize>,
    /// `[B, tokens_out]` input token kept by each output row.
    anchors: Vec<usize>,
    /// `[B, tokens_out]` input tokens folded into each output row.
    counts: Vec<u32>,
}

impl Grouping {
    fn from_splits(tokens_in: usize, aggregate: bool, layout: Layout, splits: &[Split]) -> Result<Self> {
        let merged = splits.first().map_or(0, Split::merged);
        let tokens_out = tokens_in - merged.min(tokens_in);
        let covered = tokens_in.saturating_sub(usize::from(aggregate));

        let mut assignment = Vec::with_capacity(splits.len() * tokens_in);
        let mut anchors = Vec::with_capacity(splits.len() * tokens_out);

        for (b, split) in splits.iter().enumerate() {
            if split.merged() != merged || split.dst.len() != split.src.len() {
                return Err(ReductionError::ShapeMismatch(format!(
                    "batch element {b} merges {} tokens into {} receivers, expected {merged}",
                    split.src.len(),
                    split.dst.len()
                )));
            }
            if split.covered() != covered {
                return Err(ReductionError::ShapeMismatch(format!(
                    "batch element {b} partitions {} tokens, expected {covered}",
                    split.covered()
                )));
            }

            let rows: Vec<usize> = match layout {
                Layout::Grouped => aggregate
                    .then_some(0)
                    .into_iter()
                    .chain(split.protected.iter().copied())
                    .chain(split.receivers.iter().copied())
                    .collect(),
                Layout::Positional => {
                    let mut donor = vec![false; tokens_in];
                    for &s in &split.src {
                        if let Some(d) = donor.get_mut(s) {
                            *d = true;
                        }
                    }
                    (0..tokens_in).filter(|&t| !donor[t]).collect()
                }
            };

            let mut assign = vec![UNASSIGNED; tokens_in];
            for (o, &t) in rows.iter().enumerate() {
                match assign.get_mut(t) {
                    Some(slot) if *slot == UNASSIGNED => *slot = o,
                    _ => {
                        return Err(ReductionError::ShapeMismatch(format!(
                            "batch element {b}: token {t} is invalid or kept twice"
                        )))
                    }
                }
            }
            for (&s, &d) in split.src.iter().zip(&split.dst) {
                let target = assign.get(d).copied().unwrap_or(UNASSIGNED);
                if target == UNASSIGNED || s >= tokens_in || assign[s] != UNASSIGNED {
                    return Err(ReductionError::ShapeMismatch(format!(
                        "batch element {b}: donor {s} cannot merge into {d}"
                    )));
                }
                assign[s] = target;
            }
            if let Some(t) = assign.iter().position(|&o| o == UNASSIGNED) {
                return Err(ReductionError::ShapeMismatch(format!(
                    "batch element {b}: token {t} has no output row"
                )));
            }
            if rows.len() != tokens_out {
                return Err(ReductionError::ShapeMismatch(format!(
                    "batch element {b} keeps {} tokens, expected {tokens_out}",
                    rows.len()
                )));
            }

            assignment.extend(assign);
            anchors.extend(rows);
        }

        Ok(Self::with_counts(tokens_in, tokens_out, assignment, anchors))
    }

    /// Contiguous buckets: content token `j` goes to row `floor(j * keep / n)`.
    fn buckets(batch: usize, tokens_in: usize, aggregate: bool, keep: usize) -> Self {
        let offset = usize::from(aggregate);
        let n = tokens_in.saturating_sub(offset);
        let tokens_out = offset + keep;

        let mut assign = Vec::with_capacity(tokens_in);
        let mut rows = Vec::with_capacity(tokens_out);
        if aggregate {
            assign.push(0);
            rows.push(0);
        }
        for j in 0..n {
            let o = offset + j * keep / n;
            if rows.len() == o {
                rows.push(offset + j);
            }
            assign.push(o);
        }

        let assignment = assign.repeat(batch);
        let anchors = rows.repeat(batch);
        Self::with_counts(tokens_in, tokens_out, assignment, anchors)
    }

    fn with_counts(tokens_in: usize, tokens_out: usize, assignment: Vec<usize>, anchors: Vec<usize>) -> Self {
        let batch = if tokens_in == 0 { 0 } else { assignment.len() / tokens_in };
        let mut counts = vec![0u32; batch * tokens_out];
        for b in 0..batch {
            for &o in &assignment[b * tokens_in..(b + 1) * tokens_in] {
                counts[b * tokens_out + o] += 1;
            }
        }
        Self {
            tokens_in,
            tokens_out,
            assignment,
            anchors,
            counts,
        }
    }

    fn reduce(&self, x: &TokenTensor, mode: ReduceMode) -> TokenTensor {
        let (batch, _, channels) = x.shape();
        let mut out = TokenTensor::zeros(batch, self.tokens_out, channels);

        match mode {
            ReduceMode::Prune => {
                for b in 0..batch {
                    for o in 0..self.tokens_out {
                        let t = self.anchors[b * self.tokens_out + o];
                        out.row_mut(b, o).copy_from_slice(x.row(b, t));
                    }
                }
            }
            ReduceMode::Sum | ReduceMode::Mean => {
                for b in 0..batch {
                    for t in 0..self.tokens_in {
                        let o = self.assignment[b * self.tokens_in + t];
                        let src = x.row(b, t);
                        out.row_mut(b, o).iter_mut().zip(src).for_each(|(acc, v)| *acc += v);
                    }
                }
                if mode == ReduceMode::Mean {
                    for b in 0..batch {
                        for o in 0..self.tokens_out {
                            let n = self.counts[b * self.tokens_out + o].max(1) as f32;
                            if n > 1.0 {
                                out.row_mut(b, o).iter_mut().for_each(|v| *v /= n);
                            }
                        }
                    }
                }
            }
            ReduceMode::Amax => {
                out.data.fill(f32::NEG_INFINITY);
                for b in 0..batch {
                    for t in 0..self.tokens_in {
                        let o = self.assignment[b * self.tokens_in + t];
                        let src = x.row(b, t);
                        out.row_mut(b, o)
                            .iter_mut()
                            .zip(src)
                            .for_each(|(acc, &v)| *acc = acc.max(v));
                    }
                }
            }
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq)]
enum MergeKind {
    Identity,
    Partition(Grouping),
    Spectral { buckets: Grouping, aggregate: bool },
}

/// The merge function of one layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Merge {
    batch: usize,
    tokens_in: usize,
    tokens_out: usize,
    kind: MergeKind,
    splits: Vec<Split>,
    isolation_scores: Option<Vec<f32>>,
}

impl Merge {
    /// No-op merge: every tensor passes through untouched.
    pub fn identity(batch: usize, tokens: usize) -> Self {
        Self {
            batch,
            tokens_in: tokens,
            tokens_out: tokens,
            kind: MergeKind::Identity,
            splits: Vec::new(),
            isolation_scores: None,
        }
    }

    /// Merge over one [`Split`] per batch element.
    ///
    /// Fails with [`ReductionError::ShapeMismatch`] when the splits do not
    /// partition the tokens or disagree on the reduction count.
    pub fn from_splits(
        batch: usize,
        tokens: usize,
        aggregate: bool,
        layout: Layout,
        splits: Vec<Split>,
    ) -> Result<Self> {
        if splits.len() != batch {
            return Err(ReductionError::ShapeMismatch(format!(
                "{} splits for a batch of {batch}",
                splits.len()
            )));
        }
        let grouping = Grouping::from_splits(tokens, aggregate, layout, &splits)?;
        Ok(Self {
            batch,
            tokens_in: tokens,
            tokens_out: grouping.tokens_out,
            kind: MergeKind::Partition(grouping),
            splits,
            isolation_scores: None,
        })
    }

    /// Frequency-domain merge keeping `keep` content tokens.
    pub fn spectral(batch: usize, tokens: usize, aggregate: bool, keep: usize) -> Self {
        let buckets = Grouping::buckets(batch, tokens, aggregate, keep);
        Self {
            batch,
            tokens_in: tokens,
            tokens_out: buckets.tokens_out,
            kind: MergeKind::Spectral { buckets, aggregate },
            splits: Vec::new(),
            isolation_scores: None,
        }
    }

    pub(crate) fn with_isolation_scores(mut self, scores: Vec<f32>) -> Self {
        self.isolation_scores = Some(scores);
        self
    }

    /// True when this merge leaves every tensor unchanged.
    #[inline]
    pub fn is_identity(&self) -> bool {
        matches!(self.kind, MergeKind::Identity)
    }

    /// True for frequency-domain merges.
    #[inline]
    pub fn is_spectral(&self) -> bool {
        matches!(self.kind, MergeKind::Spectral { .. })
    }

    /// Batch elements this merge was planned for.
    #[inline]
    pub fn batch(&self) -> usize {
        self.batch
    }

    /// Tokens expected on input.
    #[inline]
    pub fn tokens_in(&self) -> usize {
        self.tokens_in
    }

    /// Tokens produced on output.
    #[inline]
    pub fn tokens_out(&self) -> usize {
        self.tokens_out
    }

    /// Tokens removed (`r`).
    #[inline]
    pub fn reduced(&self) -> usize {
        self.tokens_in - self.tokens_out
    }

    /// Per-batch partitions; empty for identity and spectral merges.
    pub fn splits(&self) -> &[Split] {
        &self.splits
    }

    /// `[B, T_content]` isolation scores behind an isolation-mode plan.
    pub fn isolation_scores(&self) -> Option<&[f32]> {
        self.isolation_scores.as_deref()
    }

    /// `[B, T_content]` per-token weights derived from the isolation scores.
    pub fn isolation_weights(&self, weighting: IsolationWeighting) -> Option<Vec<f32>> {
        let scores = self.isolation_scores.as_deref()?;
        let tokens = scores.len() / self.batch.max(1);
        Some(isolation_weights(scores, tokens, weighting))
    }

    /// Output row holding input token `t` of batch element `b`.
    pub fn destination(&self, b: usize, t: usize) -> Option<usize> {
        if b >= self.batch || t >= self.tokens_in {
            return None;
        }
        match &self.kind {
            MergeKind::Identity => Some(t),
            MergeKind::Partition(g) | MergeKind::Spectral { buckets: g, .. } => {
                g.assignment.get(b * g.tokens_in + t).copied()
            }
        }
    }

    /// Apply this merge to a tensor with leading axes `[B, T_in]`.
    ///
    /// Spectral merges transform the tensor in the frequency domain for
    /// `Mean` and `Prune`, and fold contiguous buckets for `Sum` and `Amax`.
    pub fn apply(&self, x: &TokenTensor, mode: ReduceMode) -> Result<TokenTensor> {
        x.expect_tokens(self.batch, self.tokens_in, "merged tensor")?;
        Ok(match &self.kind {
            MergeKind::Identity => x.clone(),
            MergeKind::Partition(grouping) => grouping.reduce(x, mode),
            MergeKind::Spectral { buckets, aggregate } => match mode {
                ReduceMode::Mean | ReduceMode::Prune => {
                    spectral::compress(x, *aggregate, self.tokens_out - usize::from(*aggregate))
                }
                ReduceMode::Sum | ReduceMode::Amax => buckets.reduce(x, mode),
            },
        })
    }
}
