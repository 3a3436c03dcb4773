//! Flat batched token tensors.
//!
//! Every tensor the engine touches is `[B, T, C]`, row-major, with the token
//! axis in the middle. Size tensors use `C = 1`; source (provenance) tensors
//! use `C = T_original`, so all of them reduce along the same axis.

use crate::error::{ReductionError, Result};

/// Batched token tensor `[batch, tokens, channels]`.
#[derive(Clone, Debug, PartialEq)]
pub struct TokenTensor {
    /// Row-major values, `batch * tokens * channels` long.
    pub data: Vec<f32>,
    /// Independent batch elements (B).
    pub batch: usize,
    /// Tokens per batch element (T).
    pub tokens: usize,
    /// Values per token (C).
    pub channels: usize,
}

impl TokenTensor {
    /// Zero-filled tensor.
    pub fn zeros(batch: usize, tokens: usize, channels: usize) -> Self {
        Self {
            data: vec![0.0; batch * tokens * channels],
            batch,
            tokens,
            channels,
        }
    }

    /// Wrap existing values, checking the length against the shape.
    pub fn from_vec(data: Vec<f32>, batch: usize, tokens: usize, channels: usize) -> Result<Self> {
        let expected = batch * tokens * channels;
        if data.len() != expected {
            return Err(ReductionError::ShapeMismatch(format!(
                "{} values cannot form [{}, {}, {}] ({} expected)",
                data.len(),
                batch,
                tokens,
                channels,
                expected
            )));
        }
        Ok(Self {
            data,
            batch,
            tokens,
            channels,
        })
    }

    /// Build from nested rows: `rows[b][t]` is one token vector.
    pub fn from_rows(rows: &[Vec<Vec<f32>>]) -> Result<Self> {
        let batch = rows.len();
        let tokens = rows.first().map_or(0, |r| r.len());
        let channels = rows
            .first()
            .and_then(|r| r.first())
            .map_or(0, |v| v.len());

        let mut data = Vec::with_capacity(batch * tokens * channels);
        for (b, seq) in rows.iter().enumerate() {
            if seq.len() != tokens {
                return Err(ReductionError::ShapeMismatch(format!(
                    "batch element {b} has {} tokens, expected {tokens}",
                    seq.len()
                )));
            }
            for (t, v) in seq.iter().enumerate() {
                if v.len() != channels {
                    return Err(ReductionError::ShapeMismatch(format!(
                        "token ({b}, {t}) has {} channels, expected {channels}",
                        v.len()
                    )));
                }
                data.extend_from_slice(v);
            }
        }
        Self::from_vec(data, batch, tokens, channels)
    }

    /// Per-token size tensor `[B, T, 1]` initialised to one.
    pub fn ones_size(batch: usize, tokens: usize) -> Self {
        Self {
            data: vec![1.0; batch * tokens],
            batch,
            tokens,
            channels: 1,
        }
    }

    /// Identity provenance `[B, T, T]`: current token `t` holds original `t`.
    pub fn identity_source(batch: usize, tokens: usize) -> Self {
        let mut out = Self::zeros(batch, tokens, tokens);
        for b in 0..batch {
            for t in 0..tokens {
                let base = out.offset(b, t);
                out.data[base + t] = 1.0;
            }
        }
        out
    }

    /// `(batch, tokens, channels)`.
    #[inline]
    pub fn shape(&self) -> (usize, usize, usize) {
        (self.batch, self.tokens, self.channels)
    }

    /// Total element count.
    #[inline]
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub(crate) fn offset(&self, b: usize, t: usize) -> usize {
        (b * self.tokens + t) * self.channels
    }

    /// Token vector `t` of batch element `b`.
    #[inline]
    pub fn row(&self, b: usize, t: usize) -> &[f32] {
        let base = self.offset(b, t);
        &self.data[base..base + self.channels]
    }

    /// Mutable token vector `t` of batch element `b`.
    #[inline]
    pub fn row_mut(&mut self, b: usize, t: usize) -> &mut [f32] {
        let base = self.offset(b, t);
        let c = self.channels;
        &mut self.data[base..base + c]
    }

    /// All tokens of batch element `b`, `[T, C]`.
    #[inline]
    pub fn batch_slice(&self, b: usize) -> &[f32] {
        let n = self.tokens * self.channels;
        &self.data[b * n..(b + 1) * n]
    }

    /// Sum of every element; used for size mass checks.
    pub fn sum(&self) -> f64 {
        self.data.iter().map(|&v| v as f64).sum()
    }

    /// Multiply every token row by the matching scalar of a `[B, T, 1]` tensor.
    pub fn scale_rows(&self, weights: &TokenTensor) -> Result<TokenTensor> {
        check_weights(self, weights)?;
        let mut out = self.clone();
        for b in 0..self.batch {
            for t in 0..self.tokens {
                let w = weights.data[b * self.tokens + t];
                out.row_mut(b, t).iter_mut().for_each(|v| *v *= w);
            }
        }
        Ok(out)
    }

    /// Divide every token row by the matching scalar of a `[B, T, 1]` tensor.
    pub fn divide_rows(&self, weights: &TokenTensor) -> Result<TokenTensor> {
        check_weights(self, weights)?;
        let mut out = self.clone();
        for b in 0..self.batch {
            for t in 0..self.tokens {
                let w = weights.data[b * self.tokens + t];
                out.row_mut(b, t).iter_mut().for_each(|v| *v /= w);
            }
        }
        Ok(out)
    }

    /// Check that another tensor shares the leading `[B, T]` axes.
    pub(crate) fn expect_tokens(&self, batch: usize, tokens: usize, what: &str) -> Result<()> {
        if self.batch != batch || self.tokens != tokens {
            return Err(ReductionError::ShapeMismatch(format!(
                "{what} has leading shape [{}, {}], expected [{batch}, {tokens}]",
                self.batch, self.tokens
            )));
        }
        Ok(())
    }
}

fn check_weights(x: &TokenTensor, weights: &TokenTensor) -> Result<()> {
    weights.expect_tokens(x.batch, x.tokens, "weight tensor")?;
    if weights.channels != 1 {
        return Err(ReductionError::ShapeMismatch(format!(
            "weight tensor must have one channel, found {}",
            weights.channels
        )));
    }
    Ok(())
}

/// Dot product of two equal-length slices.
#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// L2-normalise every token row, clamping the norm at `eps`.
///
/// Returns the normalised tensor and the number of rows whose norm was
/// below `eps` (these stay near zero instead of becoming NaN).
pub fn l2_normalize(x: &TokenTensor, eps: f32) -> (TokenTensor, usize) {
    let mut out = x.clone();
    let mut degenerate = 0usize;
    for b in 0..x.batch {
        for t in 0..x.tokens {
            let row = out.row_mut(b, t);
            let norm = dot(row, row).sqrt();
            if norm < eps {
                degenerate += 1;
            }
            let denom = norm.max(eps);
            row.iter_mut().for_each(|v| *v /= denom);
        }
    }
    (out, degenerate)
}
