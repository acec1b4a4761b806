// THEORY:
// Segments the assigner leaves unmatched are not automatically births and deaths.
// Two dislocations can react into one (merge), or one can dissociate into several
// (split). Across such a junction the Burgers vector is conserved, so the sum over
// the parents equals the sum over the children.
//
// Key architectural principles:
// 1.  **Conservation as the Criterion**: A merge candidate is a set of unmatched
//     previous segments whose Burgers vectors add up to an unmatched current
//     segment's Burgers vector within `burgers_tolerance`. Splits mirror this.
// 2.  **Simplest Explanation First**: Subsets are tried by increasing size (2, then
//     3, up to `max_arity`) and lexicographically within a size. The first subset
//     that conserves the Burgers vector wins and the search for that target stops.
// 3.  **Greedy by Intent**: Unlike the assigner this search is first-match, not
//     optimal. Candidate search runs per target in parallel over the frame's
//     unmatched residue; acceptance is a separate, strictly ordered pass
//     (`accept_events`) so one segment never takes part in two events.

use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

use crate::core_modules::fingerprint::{Fingerprint, Vec3, add, norm, sub};
use crate::core_modules::segment::SegmentIndex;

/// Several previous segments reacting into one current segment.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeCandidate {
    pub parents: Vec<SegmentIndex>,
    pub child: SegmentIndex,
    /// Norm of (sum of parent Burgers vectors - child Burgers vector).
    pub residual: f64,
}

/// One previous segment dissociating into several current segments.
#[derive(Debug, Clone, PartialEq)]
pub struct SplitCandidate {
    pub parent: SegmentIndex,
    pub children: Vec<SegmentIndex>,
    pub residual: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComplexEvents {
    pub merges: Vec<MergeCandidate>,
    pub splits: Vec<SplitCandidate>,
}

/// Lexicographic r-combinations of `0..n`.
struct Combinations {
    n: usize,
    indices: Vec<usize>,
    started: bool,
    done: bool,
}

impl Combinations {
    fn new(n: usize, r: usize) -> Self {
        Self {
            n,
            indices: (0..r).collect(),
            started: false,
            done: r == 0 || r > n,
        }
    }
}

impl Iterator for Combinations {
    type Item = Vec<usize>;

    fn next(&mut self) -> Option<Vec<usize>> {
        if self.done {
            return None;
        }
        if !self.started {
            self.started = true;
            return Some(self.indices.clone());
        }
        let r = self.indices.len();
        // Rightmost position that can still move forward.
        let mut i = r;
        while i > 0 {
            i -= 1;
            if self.indices[i] < self.n - r + i {
                self.indices[i] += 1;
                for k in i + 1..r {
                    self.indices[k] = self.indices[k - 1] + 1;
                }
                return Some(self.indices.clone());
            }
        }
        self.done = true;
        None
    }
}

/// Norm of the difference between a Burgers vector sum and a target Burgers vector.
pub fn burgers_residual<'a>(parts: impl IntoIterator<Item = &'a Fingerprint>, target: Vec3) -> f64 {
    let sum = parts
        .into_iter()
        .fold([0.0; 3], |acc, fp| add(acc, fp.burgers_vector));
    norm(sub(sum, target))
}

/// First subset of `pool` (smallest size first, lexicographic within a size) whose
/// Burgers sum lies within `tolerance` of `target`.
fn find_conserving_subset(
    pool: &[&Fingerprint],
    target: Vec3,
    tolerance: f64,
    max_arity: usize,
) -> Option<(Vec<SegmentIndex>, f64)> {
    let max_size = max_arity.min(pool.len());
    for size in 2..=max_size {
        for combo in Combinations::new(pool.len(), size) {
            let residual = burgers_residual(combo.iter().map(|&k| pool[k]), target);
            if residual < tolerance {
                return Some((combo.iter().map(|&k| pool[k].index).collect(), residual));
            }
        }
    }
    None
}

/// Searches the unmatched residue of a frame pair for merges and splits.
///
/// Both searches see the same unmatched sets, so the returned candidates may
/// overlap. Pass them through `accept_events` before committing anything.
pub fn detect_complex_events(
    previous: &BTreeMap<SegmentIndex, Fingerprint>,
    current: &BTreeMap<SegmentIndex, Fingerprint>,
    unmatched_prev: &BTreeSet<SegmentIndex>,
    unmatched_curr: &BTreeSet<SegmentIndex>,
    burgers_tolerance: f64,
    max_arity: usize,
) -> ComplexEvents {
    let prev_pool: Vec<&Fingerprint> = unmatched_prev
        .iter()
        .filter_map(|idx| previous.get(idx))
        .collect();
    let curr_pool: Vec<&Fingerprint> = unmatched_curr
        .iter()
        .filter_map(|idx| current.get(idx))
        .collect();

    let merges: Vec<MergeCandidate> = curr_pool
        .par_iter()
        .filter_map(|child| {
            find_conserving_subset(&prev_pool, child.burgers_vector, burgers_tolerance, max_arity)
                .map(|(parents, residual)| MergeCandidate {
                    parents,
                    child: child.index,
                    residual,
                })
        })
        .collect();

    let splits: Vec<SplitCandidate> = prev_pool
        .par_iter()
        .filter_map(|parent| {
            find_conserving_subset(&curr_pool, parent.burgers_vector, burgers_tolerance, max_arity)
                .map(|(children, residual)| SplitCandidate {
                    parent: parent.index,
                    children,
                    residual,
                })
        })
        .collect();

    ComplexEvents { merges, splits }
}

/// Commits candidates against the unmatched sets, merges before splits, each in
/// detection order. A candidate is accepted only if every participant is still
/// unmatched; accepted participants are removed from the sets.
pub fn accept_events(
    candidates: ComplexEvents,
    unmatched_prev: &mut BTreeSet<SegmentIndex>,
    unmatched_curr: &mut BTreeSet<SegmentIndex>,
) -> ComplexEvents {
    let mut accepted = ComplexEvents::default();

    for merge in candidates.merges {
        let available = unmatched_curr.contains(&merge.child)
            && merge.parents.iter().all(|p| unmatched_prev.contains(p));
        if !available {
            tracing::debug!(child = merge.child, parents = ?merge.parents, "merge candidate superseded");
            continue;
        }
        unmatched_curr.remove(&merge.child);
        for parent in &merge.parents {
            unmatched_prev.remove(parent);
        }
        accepted.merges.push(merge);
    }

    for split in candidates.splits {
        let available = unmatched_prev.contains(&split.parent)
            && split.children.iter().all(|c| unmatched_curr.contains(c));
        if !available {
            tracing::debug!(parent = split.parent, children = ?split.children, "split candidate superseded");
            continue;
        }
        unmatched_prev.remove(&split.parent);
        for child in &split.children {
            unmatched_curr.remove(child);
        }
        accepted.splits.push(split);
    }

    accepted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::fingerprint::build_fingerprints;
    use crate::core_modules::segment::Segment;

    fn frame(burgers: &[(SegmentIndex, Vec3)]) -> BTreeMap<SegmentIndex, Fingerprint> {
        let segments: Vec<Segment> = burgers
            .iter()
            .map(|&(index, b)| Segment::new(index, [0.0; 3], b, 1.0))
            .collect();
        build_fingerprints(&segments)
    }

    fn all(fps: &BTreeMap<SegmentIndex, Fingerprint>) -> BTreeSet<SegmentIndex> {
        fps.keys().copied().collect()
    }

    #[test]
    fn combinations_are_lexicographic() {
        let combos: Vec<Vec<usize>> = Combinations::new(4, 2).collect();
        assert_eq!(
            combos,
            vec![vec![0, 1], vec![0, 2], vec![0, 3], vec![1, 2], vec![1, 3], vec![2, 3]]
        );
        assert_eq!(Combinations::new(3, 3).count(), 1);
        assert_eq!(Combinations::new(2, 3).count(), 0);
    }

    #[test]
    fn detects_two_way_split() {
        let prev = frame(&[(0, [1.0, 0.0, 0.0])]);
        let curr = frame(&[(0, [0.5, 0.0, 0.0]), (1, [0.5, 0.0, 0.0])]);
        let events = detect_complex_events(&prev, &curr, &all(&prev), &all(&curr), 0.05, 3);
        assert!(events.merges.is_empty());
        assert_eq!(events.splits.len(), 1);
        assert_eq!(events.splits[0].parent, 0);
        assert_eq!(events.splits[0].children, vec![0, 1]);
        assert!(events.splits[0].residual < 1e-12);
    }

    #[test]
    fn prefers_smaller_merge_over_larger() {
        let prev = frame(&[
            (0, [0.5, 0.0, 0.0]),
            (1, [0.25, 0.0, 0.0]),
            (2, [0.25, 0.0, 0.0]),
            (3, [0.5, 0.0, 0.0]),
        ]);
        let curr = frame(&[(7, [1.0, 0.0, 0.0])]);
        let events = detect_complex_events(&prev, &curr, &all(&prev), &all(&curr), 0.05, 3);
        assert_eq!(events.merges.len(), 1);
        assert_eq!(events.merges[0].parents, vec![0, 3]);
        assert_eq!(events.merges[0].child, 7);
    }

    #[test]
    fn three_way_merge_respects_arity_bound() {
        let prev = frame(&[(0, [0.0, 0.0, 1.0]), (1, [1.0, 0.0, 0.0]), (2, [0.0, 1.0, 0.0])]);
        let curr = frame(&[(0, [1.0, 1.0, 1.0])]);

        let bounded = detect_complex_events(&prev, &curr, &all(&prev), &all(&curr), 0.05, 2);
        assert!(bounded.merges.is_empty());

        let events = detect_complex_events(&prev, &curr, &all(&prev), &all(&curr), 0.05, 3);
        assert_eq!(events.merges[0].parents, vec![0, 1, 2]);
    }

    #[test]
    fn tolerance_is_strict() {
        let prev = frame(&[(0, [1.0, 0.0, 0.0])]);
        let curr = frame(&[(0, [0.5, 0.0, 0.0]), (1, [0.45, 0.0, 0.0])]);
        let loose = detect_complex_events(&prev, &curr, &all(&prev), &all(&curr), 0.06, 3);
        assert_eq!(loose.splits.len(), 1);
        let tight = detect_complex_events(&prev, &curr, &all(&prev), &all(&curr), 0.04, 3);
        assert!(tight.splits.is_empty());
    }

    #[test]
    fn acceptance_serializes_overlapping_candidates() {
        // Both children want the same pair of parents; only the first child gets them.
        let prev = frame(&[(0, [0.5, 0.0, 0.0]), (1, [0.5, 0.0, 0.0])]);
        let curr = frame(&[(0, [1.0, 0.0, 0.0]), (1, [1.0, 0.0, 0.0])]);
        let mut unmatched_prev = all(&prev);
        let mut unmatched_curr = all(&curr);
        let candidates =
            detect_complex_events(&prev, &curr, &unmatched_prev, &unmatched_curr, 0.05, 3);
        assert_eq!(candidates.merges.len(), 2);

        let accepted = accept_events(candidates, &mut unmatched_prev, &mut unmatched_curr);
        assert_eq!(accepted.merges.len(), 1);
        assert_eq!(accepted.merges[0].child, 0);
        assert!(accepted.splits.is_empty());
        assert!(unmatched_prev.is_empty());
        assert_eq!(unmatched_curr, BTreeSet::from([1]));
    }

    #[test]
    fn split_sharing_a_merged_segment_is_dropped() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        let prev = frame(&[(0, a), (1, b)]);
        let curr = frame(&[(0, [1.0, 1.0, 0.0]), (2, [0.0, -1.0, 0.0])]);
        let mut unmatched_prev = all(&prev);
        let mut unmatched_curr = all(&curr);
        let candidates =
            detect_complex_events(&prev, &curr, &unmatched_prev, &unmatched_curr, 0.05, 3);
        assert_eq!(candidates.merges.len(), 1);
        assert_eq!(candidates.splits.len(), 1);
        assert_eq!(candidates.splits[0].parent, 0);
        assert_eq!(candidates.splits[0].children, vec![0, 2]);

        let accepted = accept_events(candidates, &mut unmatched_prev, &mut unmatched_curr);
        assert_eq!(accepted.merges[0].parents, vec![0, 1]);
        assert_eq!(accepted.merges[0].child, 0);
        assert!(accepted.splits.is_empty());
        assert!(unmatched_prev.is_empty());
        assert_eq!(unmatched_curr, BTreeSet::from([2]));
    }

    #[test]
    fn merges_take_precedence_over_splits() {
        // prev {0: a+b, 1: a, 2: b}, curr {0: a+b, 1: a, 2: b}: every segment can
        // take part in either a merge or a split.
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        let ab = [1.0, 1.0, 0.0];
        let prev = frame(&[(0, ab), (1, a), (2, b)]);
        let curr = frame(&[(0, ab), (1, a), (2, b)]);
        let mut unmatched_prev = all(&prev);
        let mut unmatched_curr = all(&curr);
        let candidates =
            detect_complex_events(&prev, &curr, &unmatched_prev, &unmatched_curr, 0.05, 3);
        let accepted = accept_events(candidates, &mut unmatched_prev, &mut unmatched_curr);

        assert_eq!(accepted.merges.len(), 1);
        assert_eq!(accepted.merges[0].parents, vec![1, 2]);
        assert_eq!(accepted.merges[0].child, 0);
        assert_eq!(accepted.splits.len(), 1);
        assert_eq!(accepted.splits[0].parent, 0);
        assert_eq!(accepted.splits[0].children, vec![1, 2]);
        assert!(unmatched_prev.is_empty());
        assert!(unmatched_curr.is_empty());
    }
}
