//! Integration tests for DCT token compression.

mod helpers;

use ruvector_token_merge::spectral::{compress, dct, idct};
use ruvector_token_merge::{
    merge_source, Amount, LayerPlan, ReduceMode, ReductionConfig, Strategy, TokenMergeRouter,
    TokenTensor,
};

use helpers::{assert_close, assert_provenance_complete, random_tokens};

fn plan(keep: f64) -> LayerPlan {
    LayerPlan {
        strategy: Strategy::Spectral,
        amount: Amount::Ratio(keep),
        margin: 0.9,
    }
}

#[test]
fn test_transform_is_orthonormal() {
    let x = random_tokens(1, 1, 16, 3);
    let coeffs = dct(&x.data);
    let energy_x: f32 = x.data.iter().map(|v| v * v).sum();
    let energy_c: f32 = coeffs.iter().map(|v| v * v).sum();
    assert!((energy_x - energy_c).abs() < 1e-4);
    assert_close(&idct(&coeffs), &x.data, 1e-5);
}

#[test]
fn test_constant_sequence_survives() {
    let mut data = vec![0.5f32; 1 + 10];
    data[0] = -3.0;
    let x = TokenTensor::from_vec(data, 1, 11, 1).unwrap();

    let router = TokenMergeRouter::default();
    let out = router.reduce(&x, &plan(0.6), None).unwrap();
    // 10 content tokens, keep 6
    assert_eq!(out.tokens.tokens, 7);
    assert_eq!(out.tokens.data[0], -3.0);
    assert_close(&out.tokens.data[1..], &[0.5; 6], 1e-5);
}

#[test]
fn test_low_frequency_signal_is_kept() {
    // A single cosine at the lowest non-zero frequency resamples cleanly.
    let n = 12;
    let signal: Vec<f32> = (0..n)
        .map(|j| (std::f32::consts::PI * (2 * j + 1) as f32 / (2 * n) as f32).cos())
        .collect();
    let x = TokenTensor::from_vec(signal, 1, n, 1).unwrap();
    let y = compress(&x, false, 6);
    assert_eq!(y.tokens, 6);
    // monotone decreasing like the source half-cosine
    assert!(y.data.windows(2).all(|w| w[0] > w[1]));
    assert!(y.data[0] > 0.0 && y.data[5] < 0.0);
}

#[test]
fn test_spectral_bookkeeping() {
    let router = TokenMergeRouter::default();
    let x = random_tokens(2, 17, 5, 8);
    let out = router.reduce(&x, &plan(0.5), None).unwrap();
    assert_eq!(out.tokens.shape(), (2, 9, 5));
    assert!(out.merge.is_spectral());
    assert!(out.merge.splits().is_empty());

    let size = out.merge.apply(&TokenTensor::ones_size(2, 17), ReduceMode::Sum).unwrap();
    assert_eq!(size.sum(), 34.0);
    assert_eq!(size.row(0, 0), &[1.0]);
    assert!(size.data.iter().all(|&s| s == 1.0 || s == 2.0));

    let source = merge_source(&out.merge, None).unwrap();
    assert_provenance_complete(&source);
}

#[test]
fn test_spectral_without_aggregate() {
    let router = TokenMergeRouter::new(ReductionConfig::vision().with_class_token(false)).unwrap();
    let x = random_tokens(1, 8, 3, 1);
    let out = router.reduce(&x, &plan(0.25), None).unwrap();
    // floor(8 - 2) = 6, clamped to 4
    assert_eq!(out.tokens.tokens, 4);
}
