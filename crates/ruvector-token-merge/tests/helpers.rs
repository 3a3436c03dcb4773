//! Shared test helpers for the ruvector-token-merge integration suite.
//!
//! Deterministic token generators and invariant checks used across test
//! modules.

#![allow(dead_code)]

use ruvector_token_merge::TokenTensor;

// ---------------------------------------------------------------------------
// Random number generator (simple LCG for deterministic reproducibility)
// ---------------------------------------------------------------------------

/// A minimal linear congruential generator for deterministic test data.
pub struct Lcg {
    state: u64,
}

impl Lcg {
    /// Create a new LCG with the given seed.
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    /// Generate the next u64 value.
    pub fn next_u64(&mut self) -> u64 {
        self.state = self
            .state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.state
    }

    /// Generate a uniform f32 in [lo, hi).
    pub fn next_f32_range(&mut self, lo: f32, hi: f32) -> f32 {
        let unit = (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32;
        lo + (hi - lo) * unit
    }
}

// ---------------------------------------------------------------------------
// Token generators
// ---------------------------------------------------------------------------

/// Random `[batch, tokens, channels]` embeddings in [-1, 1).
pub fn random_tokens(batch: usize, tokens: usize, channels: usize, seed: u64) -> TokenTensor {
    let mut rng = Lcg::new(seed);
    let data = (0..batch * tokens * channels)
        .map(|_| rng.next_f32_range(-1.0, 1.0))
        .collect();
    TokenTensor::from_vec(data, batch, tokens, channels).unwrap()
}

/// Random `[batch, tokens]` attention weights in (0, 1).
pub fn random_attention(batch: usize, tokens: usize, seed: u64) -> Vec<f32> {
    let mut rng = Lcg::new(seed);
    (0..batch * tokens)
        .map(|_| rng.next_f32_range(0.01, 1.0))
        .collect()
}

/// Build a single-batch tensor from explicit rows.
pub fn rows(rows: &[&[f32]]) -> TokenTensor {
    let nested = vec![rows.iter().map(|r| r.to_vec()).collect::<Vec<_>>()];
    TokenTensor::from_rows(&nested).unwrap()
}

// ---------------------------------------------------------------------------
// Invariant checks
// ---------------------------------------------------------------------------

/// Every original token appears in exactly one current token of every
/// batch element (source stored as `[B, T_current, T_original]`).
pub fn assert_provenance_complete(source: &TokenTensor) {
    for b in 0..source.batch {
        for original in 0..source.channels {
            let owners = (0..source.tokens)
                .filter(|&t| source.row(b, t)[original] != 0.0)
                .count();
            assert_eq!(owners, 1, "batch {b}, original token {original} has {owners} owners");
        }
    }
}

/// Per-row token counts of a source tensor match the size tensor.
pub fn assert_size_matches_source(size: &TokenTensor, source: &TokenTensor) {
    for b in 0..size.batch {
        for t in 0..size.tokens {
            let members: f32 = source.row(b, t).iter().sum();
            assert_eq!(size.row(b, t)[0], members, "batch {b}, token {t}");
        }
    }
}

/// Element-wise comparison with absolute tolerance.
pub fn assert_close(a: &[f32], b: &[f32], tol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tol, "index {i}: {x} vs {y}");
    }
}
