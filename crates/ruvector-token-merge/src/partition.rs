//! Partition selection: which tokens donate, which receive, which are kept.
//!
//! A [`Split`] is computed once per batch element and layer, then reused by
//! every tensor merged at that layer so embeddings, size and source stay
//! index-aligned.

use crate::config::RankOrder;
use crate::scoring::{BipartiteScores, IsolationScores};

/// Disjoint token roles for one batch element, in full-sequence positions.
///
/// `protected`, `src` and `receivers` together cover every token except the
/// aggregate token. `dst[m]` is the receiver that absorbs `src[m]`; several
/// donors may share one receiver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Split {
    /// Tokens passed through unchanged, in output order.
    pub protected: Vec<usize>,
    /// Donor tokens, consumed by the merge.
    pub src: Vec<usize>,
    /// Matched receiver of each donor (`dst.len() == src.len()`).
    pub dst: Vec<usize>,
    /// Every receiver-side token, in output order.
    pub receivers: Vec<usize>,
}

impl Split {
    /// Number of donors (the reduction count `r`).
    #[inline]
    pub fn merged(&self) -> usize {
        self.src.len()
    }

    /// Tokens this split covers (everything but the aggregate token).
    #[inline]
    pub fn covered(&self) -> usize {
        self.protected.len() + self.src.len() + self.receivers.len()
    }
}

/// Stable ranking of `scores`; ties keep ascending index order.
pub fn rank(scores: &[f32], order: RankOrder) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..scores.len()).collect();
    match order {
        RankOrder::Descending => idx.sort_by(|&i, &j| scores[j].total_cmp(&scores[i])),
        RankOrder::Ascending => idx.sort_by(|&i, &j| scores[i].total_cmp(&scores[j])),
    }
    idx
}

/// Bipartite soft matching on the even/odd split.
///
/// The `r` strongest even-indexed rows donate to their argmax odd partner;
/// the other even rows stay as `protected`. With an aggregate token the
/// kept rows are re-sorted into ascending position; without one they keep
/// score order. Every odd-indexed token is a receiver.
pub fn bipartite_split(scores: &BipartiteScores, b: usize, r: usize, class_token: bool) -> Split {
    let node_max = scores.node_max(b);
    let node_idx = scores.node_idx(b);

    let first = usize::from(class_token).min(scores.a_len);
    let candidates: Vec<f32> = node_max[first..].to_vec();
    let order: Vec<usize> = rank(&candidates, RankOrder::Descending)
        .into_iter()
        .map(|i| i + first)
        .collect();
    let r = r.min(order.len()).min(scores.b_len);

    let (edges, kept) = order.split_at(r);
    let src: Vec<usize> = edges.iter().map(|&i| 2 * i).collect();
    let dst: Vec<usize> = edges.iter().map(|&i| 2 * node_idx[i] + 1).collect();

    let mut protected: Vec<usize> = kept.iter().map(|&i| 2 * i).collect();
    if class_token {
        protected.sort_unstable();
    }

    Split {
        protected,
        src,
        dst,
        receivers: (0..scores.b_len).map(|j| 2 * j + 1).collect(),
    }
}

/// Isolation-score clustering over content tokens `offset..offset + T`.
///
/// The first `2r` tokens in rank order are candidates: `a` (the first `r`)
/// donate to their best sharpened-similarity match in `b` (the next `r`),
/// first maximum winning. The remaining tokens are protected and emitted in
/// ascending position.
pub fn isolation_split(
    scores: &IsolationScores,
    b: usize,
    r: usize,
    offset: usize,
    order: RankOrder,
) -> Split {
    let n = scores.tokens;
    let r = r.min(n / 2);
    let ranked = rank(scores.score(b), order);
    let sim = scores.sharpened(b);

    let a = &ranked[..r];
    let bs = &ranked[r..2 * r];

    let dst = a
        .iter()
        .map(|&i| {
            let mut best = f32::NEG_INFINITY;
            let mut best_j = bs.first().copied().unwrap_or(i);
            for &j in bs {
                let s = sim[i * n + j];
                if s > best {
                    best = s;
                    best_j = j;
                }
            }
            best_j + offset
        })
        .collect();

    let mut protected: Vec<usize> = ranked[2 * r..].iter().map(|&i| i + offset).collect();
    protected.sort_unstable();

    Split {
        protected,
        src: a.iter().map(|&i| i + offset).collect(),
        dst,
        receivers: bs.iter().map(|&j| j + offset).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IsolationScoring;

    fn bipartite(node_max: Vec<f32>, node_idx: Vec<usize>, b_len: usize) -> BipartiteScores {
        BipartiteScores {
            a_len: node_max.len(),
            b_len,
            node_max,
            node_idx,
        }
    }

    #[test]
    fn test_rank_is_stable() {
        let s = [0.5, 0.9, 0.5, 0.1];
        assert_eq!(rank(&s, RankOrder::Descending), vec![1, 0, 2, 3]);
        assert_eq!(rank(&s, RankOrder::Ascending), vec![3, 0, 2, 1]);
    }

    #[test]
    fn test_bipartite_split_without_class_token() {
        // A = {0, 2, 4}, B = {1, 3, 5}
        let s = bipartite(vec![0.2, 0.9, 0.7], vec![0, 2, 1], 3);
        let split = bipartite_split(&s, 0, 2, false);
        assert_eq!(split.src, vec![2, 4]);
        assert_eq!(split.dst, vec![5, 3]);
        assert_eq!(split.protected, vec![0]);
        assert_eq!(split.receivers, vec![1, 3, 5]);
        assert_eq!(split.covered(), 6);
    }

    #[test]
    fn test_bipartite_split_keeps_unmerged_in_position_with_class_token() {
        // T = 7: A = {0, 2, 4, 6}, B = {1, 3, 5}; row 0 is the class token.
        let s = bipartite(
            vec![f32::NEG_INFINITY, 0.1, 0.8, 0.3],
            vec![0, 0, 1, 2],
            3,
        );
        let split = bipartite_split(&s, 0, 1, true);
        assert_eq!(split.src, vec![4]);
        assert_eq!(split.dst, vec![3]);
        assert_eq!(split.protected, vec![2, 6]);
        assert_eq!(split.covered(), 6);
    }

    #[test]
    fn test_bipartite_split_zero() {
        let s = bipartite(vec![0.4, 0.2], vec![0, 0], 2);
        let split = bipartite_split(&s, 0, 0, false);
        assert_eq!(split.merged(), 0);
        assert_eq!(split.protected, vec![0, 2]);
    }

    #[test]
    fn test_isolation_split_matches_inside_b() {
        // 4 content tokens after an aggregate token.
        let n = 4;
        #[rustfmt::skip]
        let sharpened = vec![
            1.0, 0.9, 0.1, 0.2,
            0.9, 1.0, 0.3, 0.8,
            0.1, 0.3, 1.0, 0.0,
            0.2, 0.8, 0.0, 1.0,
        ];
        let scores = IsolationScores {
            tokens: n,
            sharpened,
            score: vec![0.5, 0.8, 0.1, 0.6],
            signal: IsolationScoring::Similarity,
        };
        let split = isolation_split(&scores, 0, 1, 1, RankOrder::Descending);
        // ranked: 1, 3, 0, 2 -> a = [1], b = [3]
        assert_eq!(split.src, vec![2]);
        assert_eq!(split.dst, vec![4]);
        assert_eq!(split.receivers, vec![4]);
        assert_eq!(split.protected, vec![1, 3]);

        let split = isolation_split(&scores, 0, 2, 1, RankOrder::Descending);
        // a = [1, 3], b = [0, 2]; 1 -> 0 (0.9), 3 -> 0 (0.2)
        assert_eq!(split.src, vec![2, 4]);
        assert_eq!(split.dst, vec![1, 1]);
        assert!(split.protected.is_empty());
    }

    #[test]
    fn test_isolation_split_ascending() {
        let scores = IsolationScores {
            tokens: 3,
            sharpened: vec![1.0; 9],
            score: vec![0.3, 0.1, 0.2],
            signal: IsolationScoring::Attention,
        };
        let split = isolation_split(&scores, 0, 5, 0, RankOrder::Ascending);
        // clamped to r = 1; a = [1], b = [2], ties resolve to the first b
        assert_eq!(split.src, vec![1]);
        assert_eq!(split.dst, vec![2]);
        assert_eq!(split.protected, vec![0]);
    }
}
