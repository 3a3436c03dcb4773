//! Integration tests for isolation-score merging and its margin fallback.

mod helpers;

use std::collections::BTreeSet;

use ruvector_token_merge::{
    merge_wavg, Amount, IsolationScoring, IsolationWeighting, LayerPlan, MarginSchedule, RankOrder,
    ReductionConfig, Schedule, Strategy, TokenMergeRouter, TokenTensor,
};

use helpers::{random_attention, random_tokens};

fn plan(strategy: Strategy, r: usize, margin: f32) -> LayerPlan {
    LayerPlan {
        strategy,
        amount: Amount::Count(r),
        margin,
    }
}

#[test]
fn test_margin_fallback_matches_bipartite() {
    let router = TokenMergeRouter::default();
    for seed in 0..4u64 {
        let x = random_tokens(2, 13, 6, seed);
        let iso = router.reduce(&x, &plan(Strategy::Isolation, 4, 0.5), None).unwrap();
        let bip = router.reduce(&x, &plan(Strategy::Bipartite, 4, 0.5), None).unwrap();
        assert_eq!(iso.tokens, bip.tokens);
        assert_eq!(iso.merge, bip.merge);
    }
}

#[test]
fn test_threshold_is_inclusive() {
    let router = TokenMergeRouter::default();
    let x = random_tokens(1, 9, 4, 99);
    let at = router.plan(&x, &plan(Strategy::Isolation, 2, 0.45), None).unwrap();
    let below = router.plan(&x, &plan(Strategy::Isolation, 2, 0.44), None).unwrap();
    assert!(at.isolation_scores().is_none());
    assert!(below.isolation_scores().is_some());
}

#[test]
fn test_isolation_preserves_aggregate_and_mass() {
    let router = TokenMergeRouter::default();
    let x = random_tokens(3, 17, 8, 5);
    let merge = router.plan(&x, &plan(Strategy::Isolation, 5, 0.2), None).unwrap();
    let (merged, size) = merge_wavg(&merge, &x, None).unwrap();

    assert_eq!(merged.shape(), (3, 12, 8));
    assert_eq!(size.sum(), 3.0 * 17.0);
    for b in 0..3 {
        assert_eq!(merged.row(b, 0), x.row(b, 0));
        let split = &merge.splits()[b];
        assert_eq!(split.src.len(), 5);
        assert_eq!(split.receivers.len(), 5);
        assert_eq!(split.protected.len(), 6);
        assert!(split.protected.windows(2).all(|w| w[0] < w[1]));
        for d in &split.dst {
            assert!(split.receivers.contains(d));
        }
    }
}

#[test]
fn test_attention_ranking_selects_least_attended() {
    let config = ReductionConfig::text();
    assert_eq!(config.rank_order(IsolationScoring::Attention), RankOrder::Ascending);
    let router = TokenMergeRouter::new(config).unwrap();

    let x = random_tokens(1, 12, 8, 21);
    let attention = random_attention(1, 12, 22);
    let merge = router
        .plan(&x, &plan(Strategy::Isolation, 3, 0.3), Some(attention.as_slice()))
        .unwrap();

    let mut order: Vec<usize> = (0..12).collect();
    order.sort_by(|&a, &b| attention[a].total_cmp(&attention[b]));
    let least: BTreeSet<usize> = order[..6].iter().copied().collect();

    let split = &merge.splits()[0];
    let candidates: BTreeSet<usize> = split.src.iter().chain(&split.receivers).copied().collect();
    assert_eq!(candidates, least);
    assert_eq!(split.src, order[..3].to_vec());
    assert_eq!(merge.isolation_scores().unwrap(), &attention[..]);
}

#[test]
fn test_attention_config_without_attention_merges_duplicates() {
    // Four near-duplicates followed by two mutually orthogonal loners.
    #[rustfmt::skip]
    let data = vec![
        1.0, 0.0, 0.0,
        1.0, 0.01, 0.0,
        1.0, 0.0, 0.01,
        1.0, 0.01, 0.01,
        0.0, 1.0, 0.0,
        0.0, 0.0, 1.0,
    ];
    let x = TokenTensor::from_vec(data, 1, 6, 3).unwrap();
    let router = TokenMergeRouter::new(ReductionConfig::text()).unwrap();
    let merge = router.plan(&x, &plan(Strategy::Isolation, 1, 0.3), None).unwrap();

    let split = &merge.splits()[0];
    assert!(split.src.iter().chain(&split.receivers).all(|&t| t < 4));
    assert!(split.protected.contains(&4));
    assert!(split.protected.contains(&5));

    let scores = merge.isolation_scores().unwrap();
    let lowest_candidate = split
        .src
        .iter()
        .chain(&split.receivers)
        .map(|&t| scores[t])
        .fold(f32::INFINITY, f32::min);
    for &p in &split.protected {
        assert!(scores[p] <= lowest_candidate);
    }
}

#[test]
fn test_isolation_weights_follow_scores() {
    let router = TokenMergeRouter::default();
    let x = random_tokens(2, 9, 4, 31);
    let merge = router.plan(&x, &plan(Strategy::Isolation, 2, 0.2), None).unwrap();

    let scores = merge.isolation_scores().unwrap().to_vec();
    let weights = merge.isolation_weights(IsolationWeighting::Softmax).unwrap();
    assert_eq!(weights.len(), 2 * 8);
    for b in 0..2 {
        let row = &weights[b * 8..(b + 1) * 8];
        let mass: f32 = row.iter().map(|w| 1.0 - w).sum();
        assert!((mass - 1.0).abs() < 1e-5);
        let top = (0..8).max_by(|&i, &j| scores[b * 8 + i].total_cmp(&scores[b * 8 + j])).unwrap();
        assert!(row.iter().all(|&w| w >= row[top]));
    }

    let bip = router.plan(&x, &plan(Strategy::Bipartite, 2, 0.2), None).unwrap();
    assert!(bip.isolation_weights(IsolationWeighting::Normalized).is_none());
}

#[test]
fn test_similarity_ranking_descends_by_default() {
    let config = ReductionConfig::vision().with_class_token(false);
    let router = TokenMergeRouter::new(config).unwrap();
    let x = random_tokens(1, 10, 4, 8);
    let merge = router.plan(&x, &plan(Strategy::Isolation, 2, 0.1), None).unwrap();

    let scores = merge.isolation_scores().unwrap();
    let split = &merge.splits()[0];
    let lowest_candidate = split
        .src
        .iter()
        .chain(&split.receivers)
        .map(|&t| scores[t])
        .fold(f32::INFINITY, f32::min);
    for &p in &split.protected {
        assert!(scores[p] <= lowest_candidate);
    }
}

#[test]
fn test_linear_margin_schedule_switches_mode_with_depth() {
    let router = TokenMergeRouter::default();
    let schedule = Schedule::uniform(
        12,
        Strategy::Isolation,
        Amount::Count(2),
        MarginSchedule::Linear { start: 0.9 },
    )
    .unwrap();
    let x = random_tokens(1, 21, 4, 13);

    for (layer, p) in schedule.plans().iter().enumerate() {
        let merge = router.plan(&x, p, None).unwrap();
        assert_eq!(merge.isolation_scores().is_none(), p.margin >= 0.45, "layer {layer}");
    }
    assert!(schedule.plans()[0].margin >= 0.45);
    assert!(schedule.plans()[11].margin < 0.45);
}
