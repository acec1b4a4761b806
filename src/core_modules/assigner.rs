// THEORY:
// The assigner solves the one-to-one part of the data association problem. Unlike a
// greedy nearest-neighbour pass, which lets an early pair steal a partner that a
// later pair needed more, it finds the globally cheapest pairing of previous-frame
// and current-frame fingerprints.
//
// Key architectural principles:
// 1.  **Full Matrix First**: The similarity of every (previous, current) pair is
//     computed up front, in parallel, and fully materialised before the solver runs.
// 2.  **Optimal Assignment**: Cost is `1 - similarity`; the potential-based
//     Kuhn-Munkres algorithm matches every row or every column of the rectangular
//     matrix, whichever side is smaller, at minimum total cost.
// 3.  **Post-Filter**: A pair the solver chose is still dropped when its similarity is
//     below `min_similarity`. A weak forced match is worse than two unmatched
//     segments, because unmatched segments get a second chance in merge and split
//     detection.

use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::core_modules::fingerprint::Fingerprint;
use crate::core_modules::segment::SegmentIndex;
use crate::core_modules::similarity::{SimilarityWeights, similarity_score};

/// An accepted one-to-one correspondence between two consecutive frames.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentMatch {
    pub previous: SegmentIndex,
    pub current: SegmentIndex,
    pub similarity: f64,
}

/// Row-major similarity matrix, rows = previous fingerprints, columns = current.
pub fn similarity_matrix(
    previous: &[&Fingerprint],
    current: &[&Fingerprint],
    weights: &SimilarityWeights,
) -> Vec<Vec<f64>> {
    previous
        .par_iter()
        .map(|p| current.iter().map(|c| similarity_score(p, c, weights)).collect())
        .collect()
}

/// Minimum-cost assignment on a rectangular cost matrix.
///
/// Returns `min(rows, cols)` pairs `(row, col)` sorted by row. Every row is matched
/// when there are no more rows than columns, and every column otherwise. A NaN or
/// infinite cost is treated as one more than the worst finite cost.
pub fn hungarian_assignment(costs: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let n_rows = costs.len();
    let n_cols = costs.first().map_or(0, Vec::len);
    if n_rows == 0 || n_cols == 0 {
        return Vec::new();
    }

    let worst = costs
        .iter()
        .flatten()
        .copied()
        .filter(|c| c.is_finite())
        .fold(0.0_f64, f64::max)
        + 1.0;
    let sanitized = |i: usize, j: usize| {
        let c = costs[i][j];
        if c.is_finite() { c } else { worst }
    };

    if n_rows > n_cols {
        let transposed: Vec<Vec<f64>> = (0..n_cols)
            .map(|j| (0..n_rows).map(|i| sanitized(i, j)).collect())
            .collect();
        let mut pairs: Vec<(usize, usize)> = solve_wide(&transposed)
            .into_iter()
            .map(|(col, row)| (row, col))
            .collect();
        pairs.sort_unstable();
        return pairs;
    }

    let costs: Vec<Vec<f64>> = (0..n_rows)
        .map(|i| (0..n_cols).map(|j| sanitized(i, j)).collect())
        .collect();
    solve_wide(&costs)
}

/// Kuhn-Munkres with potentials for a finite matrix with `rows <= cols`.
fn solve_wide(costs: &[Vec<f64>]) -> Vec<(usize, usize)> {
    let n = costs.len();
    let m = costs[0].len();
    let inf = f64::INFINITY;

    // u: row potentials, v: column potentials (1-indexed; index 0 is the virtual source).
    let mut u = vec![0.0_f64; n + 1];
    let mut v = vec![0.0_f64; m + 1];
    // p[j]: 1-indexed row assigned to column j (0 = free).
    let mut p = vec![0_usize; m + 1];
    // way[j]: previous column on the shortest augmenting path to column j.
    let mut way = vec![0_usize; m + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0_usize;
        let mut min_val = vec![inf; m + 1];
        let mut used = vec![false; m + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0_usize;

            for j in 1..=m {
                if used[j] {
                    continue;
                }
                let reduced = costs[i0 - 1][j - 1] - u[i0] - v[j];
                if reduced < min_val[j] {
                    min_val[j] = reduced;
                    way[j] = j0;
                }
                if min_val[j] < delta {
                    delta = min_val[j];
                    j1 = j;
                }
            }

            for j in 0..=m {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Flip the augmenting path.
        loop {
            let prev = way[j0];
            p[j0] = p[prev];
            j0 = prev;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut pairs: Vec<(usize, usize)> = (1..=m)
        .filter(|&j| p[j] != 0)
        .map(|j| (p[j] - 1, j - 1))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// Globally optimal one-to-one matching between two frames, filtered by `min_similarity`.
///
/// Returns no matches, without running the solver, when either frame is empty.
/// Matches are ordered by previous index.
pub fn match_segments(
    previous: &BTreeMap<SegmentIndex, Fingerprint>,
    current: &BTreeMap<SegmentIndex, Fingerprint>,
    weights: &SimilarityWeights,
    min_similarity: f64,
) -> Vec<SegmentMatch> {
    if previous.is_empty() || current.is_empty() {
        return Vec::new();
    }

    let prev_fps: Vec<&Fingerprint> = previous.values().collect();
    let curr_fps: Vec<&Fingerprint> = current.values().collect();

    let similarity = similarity_matrix(&prev_fps, &curr_fps, weights);
    let costs: Vec<Vec<f64>> = similarity
        .iter()
        .map(|row| row.iter().map(|s| 1.0 - s).collect())
        .collect();

    hungarian_assignment(&costs)
        .into_iter()
        .filter_map(|(i, j)| {
            let score = similarity[i][j];
            let accepted = score >= min_similarity;
            tracing::debug!(
                previous = prev_fps[i].index,
                current = curr_fps[j].index,
                similarity = score,
                accepted,
                "assignment candidate"
            );
            accepted.then(|| SegmentMatch {
                previous: prev_fps[i].index,
                current: curr_fps[j].index,
                similarity: score,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::fingerprint::build_fingerprints;
    use crate::core_modules::segment::Segment;

    fn total_cost(costs: &[Vec<f64>], pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(i, j)| costs[i][j]).sum()
    }

    #[test]
    fn hungarian_swapped_2x2() {
        let costs = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        assert_eq!(hungarian_assignment(&costs), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn hungarian_beats_greedy() {
        // Greedy takes (0,0) at cost 1 and is then forced into (1,1) at cost 10.
        let costs = vec![vec![1.0, 2.0], vec![2.0, 10.0]];
        let pairs = hungarian_assignment(&costs);
        assert_eq!(pairs, vec![(0, 1), (1, 0)]);
        assert_eq!(total_cost(&costs, &pairs), 4.0);
    }

    #[test]
    fn hungarian_more_rows_than_columns() {
        let costs = vec![vec![5.0, 9.0], vec![4.0, 6.0], vec![3.0, 1.0]];
        let pairs = hungarian_assignment(&costs);
        assert_eq!(pairs.len(), 2);
        assert_eq!(total_cost(&costs, &pairs), 5.0);
    }

    #[test]
    fn hungarian_more_columns_than_rows() {
        let costs = vec![vec![7.0, 2.0, 9.0, 4.0]];
        assert_eq!(hungarian_assignment(&costs), vec![(0, 1)]);
    }

    #[test]
    fn hungarian_matches_brute_force_on_3x3() {
        let costs = vec![
            vec![4.0, 1.0, 3.0],
            vec![2.0, 0.0, 5.0],
            vec![3.0, 2.0, 2.0],
        ];
        let pairs = hungarian_assignment(&costs);
        let perms = [
            [0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0],
        ];
        let best = perms
            .iter()
            .map(|perm| (0..3).map(|i| costs[i][perm[i]]).sum::<f64>())
            .fold(f64::INFINITY, f64::min);
        assert_eq!(total_cost(&costs, &pairs), best);
    }

    #[test]
    fn non_finite_costs_count_as_worst() {
        let costs = vec![
            vec![f64::NAN, 0.2, 0.9],
            vec![0.1, f64::INFINITY, 0.8],
        ];
        assert_eq!(hungarian_assignment(&costs), vec![(0, 1), (1, 0)]);

        let all_nan = vec![vec![f64::NAN; 2]; 3];
        assert_eq!(hungarian_assignment(&all_nan).len(), 2);
    }

    #[test]
    fn empty_side_yields_no_matches() {
        let prev = build_fingerprints(&[Segment::new(0, [0.0; 3], [1.0, 0.0, 0.0], 1.0)]);
        let curr = BTreeMap::new();
        assert!(match_segments(&prev, &curr, &SimilarityWeights::default(), 0.6).is_empty());
        assert!(match_segments(&curr, &prev, &SimilarityWeights::default(), 0.6).is_empty());
        assert!(hungarian_assignment(&[]).is_empty());
    }

    #[test]
    fn low_similarity_pairs_are_dropped() {
        let prev = build_fingerprints(&[
            Segment::new(0, [0.0; 3], [0.5, 0.5, 0.5], 10.0),
            Segment::new(1, [50.0, 0.0, 0.0], [1.0, 0.0, 0.0], 3.0),
        ]);
        let curr = build_fingerprints(&[
            Segment::new(10, [1.0, 0.0, 0.0], [0.5, 0.5, 0.5], 10.2),
            Segment::new(11, [-40.0, 0.0, 0.0], [0.0, 1.0, 0.0], 30.0),
        ]);
        let matches = match_segments(&prev, &curr, &SimilarityWeights::default(), 0.6);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].previous, 0);
        assert_eq!(matches[0].current, 10);
        assert!(matches[0].similarity > 0.96);
    }
}
