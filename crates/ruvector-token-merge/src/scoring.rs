//! Similarity and isolation scoring over L2-normalised token embeddings.
//!
//! Two flavours feed the selector:
//!
//! | Mode | Output | Used by |
//! |------|--------|---------|
//! | Bipartite | per even-indexed token: best odd-indexed partner and its cosine | ToMe, prune |
//! | Isolation | per content token: mean margin-sharpened similarity (or attention) | PiToMe |
//!
//! All functions are pure; scores are computed per batch element with no
//! cross-batch interaction.

use tracing::{trace, warn};

use crate::config::{IsolationScoring, ReductionConfig};
use crate::error::{ReductionError, Result};
use crate::tensor::{dot, l2_normalize, TokenTensor};

/// L2-normalise a merge metric, warning about rows with (near) zero norm.
pub fn normalize_metric(metric: &TokenTensor, eps: f32) -> TokenTensor {
    let (normed, degenerate) = l2_normalize(metric, eps);
    if degenerate > 0 {
        warn!(
            degenerate,
            tokens = metric.batch * metric.tokens,
            eps,
            "zero-norm token rows in merge metric; normalisation clamped"
        );
    }
    normed
}

/// Best partner for every even-indexed (set `A`) token.
#[derive(Clone, Debug, PartialEq)]
pub struct BipartiteScores {
    /// Tokens in set `A` (even positions), `ceil(T / 2)`.
    pub a_len: usize,
    /// Tokens in set `B` (odd positions), `floor(T / 2)`.
    pub b_len: usize,
    /// `[B, a_len]` maximum cosine similarity to any `B` token.
    pub node_max: Vec<f32>,
    /// `[B, a_len]` index into `B` of that maximum (first maximum wins).
    pub node_idx: Vec<usize>,
}

impl BipartiteScores {
    /// Row maxima for batch element `b`.
    #[inline]
    pub fn node_max(&self, b: usize) -> &[f32] {
        &self.node_max[b * self.a_len..(b + 1) * self.a_len]
    }

    /// Argmax partners for batch element `b`.
    #[inline]
    pub fn node_idx(&self, b: usize) -> &[usize] {
        &self.node_idx[b * self.a_len..(b + 1) * self.a_len]
    }
}

/// Score the even/odd split `scores = A · Bᵀ` of normalised embeddings.
///
/// With `class_token`, row 0 of `A` (the aggregate token) is forced to
/// `-inf` so it always ranks last and is never a merge source. Odd `T`
/// leaves `A` one token larger than `B`.
pub fn bipartite_scores(normed: &TokenTensor, class_token: bool) -> BipartiteScores {
    let (batch, tokens, _) = normed.shape();
    let a_len = (tokens + 1) / 2;
    let b_len = tokens / 2;

    let mut node_max = vec![f32::NEG_INFINITY; batch * a_len];
    let mut node_idx = vec![0usize; batch * a_len];

    for b in 0..batch {
        for i in 0..a_len {
            let a_row = normed.row(b, 2 * i);
            let mut best = f32::NEG_INFINITY;
            let mut best_j = 0usize;
            for j in 0..b_len {
                let s = dot(a_row, normed.row(b, 2 * j + 1));
                if s > best {
                    best = s;
                    best_j = j;
                }
            }
            node_max[b * a_len + i] = best;
            node_idx[b * a_len + i] = best_j;
        }
        if class_token && a_len > 0 {
            node_max[b * a_len] = f32::NEG_INFINITY;
        }
    }

    trace!(batch, tokens, a_len, b_len, "bipartite scores computed");

    BipartiteScores {
        a_len,
        b_len,
        node_max,
        node_idx,
    }
}

/// Exponential linear unit.
#[inline]
pub fn elu(x: f32, alpha: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        alpha * (x.exp() - 1.0)
    }
}

/// Margin-sharpened similarity `elu((cos - margin) / temperature, alpha)`.
#[inline]
pub fn sharpen(cos: f32, margin: f32, temperature: f32, alpha: f32) -> f32 {
    elu((cos - margin) / temperature, alpha)
}

/// Isolation scores for the content tokens of every batch element.
#[derive(Clone, Debug, PartialEq)]
pub struct IsolationScores {
    /// Content tokens scored per batch element.
    pub tokens: usize,
    /// `[B, T, T]` sharpened pairwise similarity.
    pub sharpened: Vec<f32>,
    /// `[B, T]` ranking signal.
    pub score: Vec<f32>,
    /// Signal that produced `score`.
    pub signal: IsolationScoring,
}

impl IsolationScores {
    /// Sharpened similarity matrix of batch element `b`, `[T, T]`.
    #[inline]
    pub fn sharpened(&self, b: usize) -> &[f32] {
        let n = self.tokens * self.tokens;
        &self.sharpened[b * n..(b + 1) * n]
    }

    /// Ranking signal of batch element `b`.
    #[inline]
    pub fn score(&self, b: usize) -> &[f32] {
        &self.score[b * self.tokens..(b + 1) * self.tokens]
    }
}

/// Score content tokens `offset..T` of normalised embeddings.
///
/// The similarity signal is the row mean of the sharpened matrix, self
/// similarity included. When the config asks for attention scoring and
/// `attention` (`[B, T]`, full sequence) is supplied, the attention weight
/// of each content token replaces it; the sharpened matrix is still
/// returned for destination matching. [`IsolationScores::signal`] records
/// which of the two was used so the caller ranks with the matching order.
pub fn isolation_scores(
    normed: &TokenTensor,
    offset: usize,
    margin: f32,
    config: &ReductionConfig,
    attention: Option<&[f32]>,
) -> Result<IsolationScores> {
    let (batch, full, _) = normed.shape();
    let tokens = full.saturating_sub(offset);

    let attention = match (config.scoring, attention) {
        (IsolationScoring::Attention, Some(weights)) => {
            if weights.len() != batch * full {
                return Err(ReductionError::ShapeMismatch(format!(
                    "attention has {} weights, expected [{batch}, {full}]",
                    weights.len()
                )));
            }
            Some(weights)
        }
        _ => None,
    };

    let mut sharpened = vec![0.0f32; batch * tokens * tokens];
    let mut score = vec![0.0f32; batch * tokens];

    for b in 0..batch {
        let sim = &mut sharpened[b * tokens * tokens..(b + 1) * tokens * tokens];
        for i in 0..tokens {
            let row_i = normed.row(b, offset + i);
            for j in 0..tokens {
                let cos = dot(row_i, normed.row(b, offset + j));
                sim[i * tokens + j] = sharpen(cos, margin, config.temperature, config.elu_alpha);
            }
        }

        let out = &mut score[b * tokens..(b + 1) * tokens];
        match attention {
            Some(weights) => {
                out.copy_from_slice(&weights[b * full + offset..(b + 1) * full]);
            }
            None => {
                for i in 0..tokens {
                    let row = &sim[i * tokens..(i + 1) * tokens];
                    out[i] = row.iter().sum::<f32>() / tokens as f32;
                }
            }
        }
    }

    trace!(
        batch,
        tokens,
        margin,
        attention = attention.is_some(),
        "isolation scores computed"
    );

    Ok(IsolationScores {
        tokens,
        sharpened,
        score,
        signal: if attention.is_some() {
            IsolationScoring::Attention
        } else {
            IsolationScoring::Similarity
        },
    })
}

/// How raw isolation scores become per-token weights for the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IsolationWeighting {
    /// `1 - score / ||score||_2` over each batch row.
    Normalized,
    /// `1 - softmax(score)` over each batch row.
    Softmax,
}

/// Per-token weights derived from `[B, tokens]` isolation scores.
pub fn isolation_weights(score: &[f32], tokens: usize, weighting: IsolationWeighting) -> Vec<f32> {
    if tokens == 0 {
        return Vec::new();
    }
    let mut out = Vec::with_capacity(score.len());
    for row in score.chunks(tokens) {
        match weighting {
            IsolationWeighting::Normalized => {
                let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt().max(1e-12);
                out.extend(row.iter().map(|v| 1.0 - v / norm));
            }
            IsolationWeighting::Softmax => {
                let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                let exp: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
                let total: f32 = exp.iter().sum();
                out.extend(exp.iter().map(|e| 1.0 - e / total));
            }
        }
    }
    out
}
