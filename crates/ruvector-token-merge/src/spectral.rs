//! Frequency-domain token compression.
//!
//! The content tokens of each batch element are treated as `C` signals of
//! length `n` along the sequence axis. Each signal goes through an
//! orthonormal DCT-II, keeps its `k` lowest-frequency coefficients, and is
//! brought back with an orthonormal inverse DCT of length `k`. The result
//! is rescaled by `sqrt(k / n)` so constant signals survive unchanged.
//!
//! No scoring happens here; the output depends only on `n` and `k`.

use std::f64::consts::PI;

use crate::config::ReductionConfig;
use crate::error::Result;
use crate::merge::Merge;
use crate::schedule::Strategy;
use crate::tensor::TokenTensor;
use crate::traits::{resolve_count, ReductionRequest, TokenReducer};

/// Orthonormal DCT-II basis, `rows x n`: `basis[k][j] = s_k cos(pi (2j+1) k / 2n)`.
fn basis(rows: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; rows * n];
    let n_f = n as f64;
    for k in 0..rows {
        let scale = if k == 0 { (1.0 / n_f).sqrt() } else { (2.0 / n_f).sqrt() };
        for j in 0..n {
            out[k * n + j] = scale * (PI * (2 * j + 1) as f64 * k as f64 / (2.0 * n_f)).cos();
        }
    }
    out
}

/// Orthonormal DCT-II of one signal.
pub fn dct(signal: &[f32]) -> Vec<f32> {
    let n = signal.len();
    let b = basis(n, n);
    (0..n)
        .map(|k| {
            let row = &b[k * n..(k + 1) * n];
            row.iter().zip(signal).map(|(w, &v)| w * v as f64).sum::<f64>() as f32
        })
        .collect()
}

/// Orthonormal inverse DCT (DCT-III); `idct(&dct(x)) == x` up to rounding.
pub fn idct(coeffs: &[f32]) -> Vec<f32> {
    let n = coeffs.len();
    let b = basis(n, n);
    (0..n)
        .map(|j| {
            (0..n)
                .map(|k| b[k * n + j] * coeffs[k] as f64)
                .sum::<f64>() as f32
        })
        .collect()
}

/// Compress content tokens to `keep` rows; the aggregate token passes through.
pub fn compress(x: &TokenTensor, aggregate: bool, keep: usize) -> TokenTensor {
    let (batch, tokens, channels) = x.shape();
    let offset = usize::from(aggregate).min(tokens);
    let n = tokens - offset;
    let keep = keep.min(n);

    let mut out = TokenTensor::zeros(batch, offset + keep, channels);
    if n == 0 || keep == 0 {
        for b in 0..batch {
            for t in 0..offset {
                out.row_mut(b, t).copy_from_slice(x.row(b, t));
            }
        }
        return out;
    }

    let forward = basis(keep, n);
    let inverse = basis(keep, keep);
    let gain = (keep as f64 / n as f64).sqrt();

    let mut coeffs = vec![0.0f64; keep * channels];
    for b in 0..batch {
        if aggregate {
            out.row_mut(b, 0).copy_from_slice(x.row(b, 0));
        }

        coeffs.fill(0.0);
        for k in 0..keep {
            let acc = &mut coeffs[k * channels..(k + 1) * channels];
            for j in 0..n {
                let w = forward[k * n + j];
                for (a, &v) in acc.iter_mut().zip(x.row(b, offset + j)) {
                    *a += w * v as f64;
                }
            }
        }

        for i in 0..keep {
            let row = out.row_mut(b, offset + i);
            for (c, slot) in row.iter_mut().enumerate() {
                let mut v = 0.0f64;
                for k in 0..keep {
                    v += inverse[k * keep + i] * coeffs[k * channels + c];
                }
                *slot = (v * gain) as f32;
            }
        }
    }
    out
}

/// DCT truncation reducer.
#[derive(Clone, Debug)]
pub struct SpectralReducer {
    class_token: bool,
}

impl SpectralReducer {
    /// Reducer passing the aggregate token through when `config` has one.
    pub fn new(config: &ReductionConfig) -> Self {
        Self {
            class_token: config.class_token,
        }
    }
}

impl TokenReducer for SpectralReducer {
    fn plan(&self, metric: &TokenTensor, request: &ReductionRequest<'_>) -> Result<Merge> {
        let (batch, tokens, _) = metric.shape();
        let aggregate = self.class_token && tokens > 0;
        let content = tokens - usize::from(aggregate);
        let r = resolve_count(request.amount, content, 0, Strategy::Spectral);
        if r == 0 {
            return Ok(Merge::identity(batch, tokens));
        }
        Ok(Merge::spectral(batch, tokens, aggregate, content - r))
    }

    fn strategy(&self) -> Strategy {
        Strategy::Spectral
    }
}
