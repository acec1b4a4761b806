// THEORY:
// The similarity scorer answers one question: how plausible is it that fingerprint
// `a` in frame t and fingerprint `b` in frame t+1 are the same dislocation? The
// answer is a weighted blend of three lenses, each in [0, 1]:
//
// 1.  **Spatial proximity**: linear falloff with distance, and a hard zero beyond
//     `max_spatial_distance`. The cut-off also short-circuits most of the O(n*m)
//     pairwise work in large frames.
// 2.  **Burgers alignment**: the cosine between unit Burgers vectors, clamped at
//     zero so anti-parallel vectors earn nothing, times the magnitude ratio.
// 3.  **Length ratio**: shorter over longer.
//
// The scorer is a pure function and symmetric in its two inputs. It is total: any
// combination that does not produce a finite number scores 0.

use serde::{Deserialize, Serialize};

use crate::core_modules::fingerprint::{EPSILON, Fingerprint, dot, norm, sub};

/// Weights and cut-off for `similarity_score`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityWeights {
    pub spatial_weight: f64,
    pub burgers_weight: f64,
    pub length_weight: f64,
    pub max_spatial_distance: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            spatial_weight: 0.4,
            burgers_weight: 0.4,
            length_weight: 0.2,
            max_spatial_distance: 15.0,
        }
    }
}

/// Scores how alike two fingerprints are, in [0, 1].
pub fn similarity_score(a: &Fingerprint, b: &Fingerprint, weights: &SimilarityWeights) -> f64 {
    let spatial_distance = norm(sub(a.position, b.position));
    if !(spatial_distance <= weights.max_spatial_distance) {
        return 0.0;
    }
    let spatial_score = 1.0 - spatial_distance / weights.max_spatial_distance;

    let direction_score = dot(a.burgers_normalized, b.burgers_normalized).max(0.0);
    let magnitude_ratio = a.burgers_magnitude.min(b.burgers_magnitude)
        / a.burgers_magnitude.max(b.burgers_magnitude).max(EPSILON);
    let burgers_score = direction_score * magnitude_ratio;

    let length_ratio = a.length.min(b.length) / a.length.max(b.length).max(EPSILON);

    let score = weights.spatial_weight * spatial_score
        + weights.burgers_weight * burgers_score
        + weights.length_weight * length_ratio;
    if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::segment::Segment;
    use proptest::prelude::*;

    fn fp(position: [f64; 3], burgers: [f64; 3], length: f64) -> Fingerprint {
        Fingerprint::from_segment(&Segment::new(0, position, burgers, length))
    }

    #[test]
    fn nearby_identical_segment_scores_high() {
        let a = fp([0.0, 0.0, 0.0], [0.5, 0.5, 0.5], 10.0);
        let b = fp([1.0, 0.0, 0.0], [0.5, 0.5, 0.5], 10.2);
        let score = similarity_score(&a, &b, &SimilarityWeights::default());
        // 0.4 * (1 - 1/15) + 0.4 * 1 + 0.2 * (10 / 10.2)
        let expected = 0.4 * (14.0 / 15.0) + 0.4 + 0.2 * (10.0 / 10.2);
        assert!((score - expected).abs() < 1e-9);
        assert!(score > 0.96);
    }

    #[test]
    fn beyond_cutoff_scores_zero() {
        let a = fp([0.0; 3], [1.0, 0.0, 0.0], 5.0);
        let b = fp([15.5, 0.0, 0.0], [1.0, 0.0, 0.0], 5.0);
        assert_eq!(similarity_score(&a, &b, &SimilarityWeights::default()), 0.0);
    }

    #[test]
    fn antiparallel_burgers_earns_nothing() {
        let a = fp([0.0; 3], [1.0, 0.0, 0.0], 5.0);
        let b = fp([0.0; 3], [-1.0, 0.0, 0.0], 5.0);
        let score = similarity_score(&a, &b, &SimilarityWeights::default());
        assert!((score - 0.6).abs() < 1e-12);
    }

    #[test]
    fn degenerate_fingerprints_are_bounded() {
        let zero = fp([0.0; 3], [0.0; 3], 0.0);
        let score = similarity_score(&zero, &zero, &SimilarityWeights::default());
        assert!((0.0..=1.0).contains(&score));
        assert!((score - 0.4).abs() < 1e-12);
    }

    #[test]
    fn huge_burgers_vectors_score_finitely() {
        let weights = SimilarityWeights::default();
        let a = fp([0.0; 3], [1e200, 0.0, 0.0], 5.0);
        assert!((similarity_score(&a, &a, &weights) - 1.0).abs() < 1e-9);

        let b = fp([0.0; 3], [f64::MAX, f64::MAX, f64::MAX], 5.0);
        let c = fp([0.0; 3], [1.0, 0.0, 0.0], f64::MAX);
        for (x, y) in [(&a, &b), (&b, &b), (&b, &c), (&c, &a)] {
            let score = similarity_score(x, y, &weights);
            assert!((0.0..=1.0).contains(&score), "{score}");
        }
    }

    fn arb_vec3(range: f64) -> impl Strategy<Value = [f64; 3]> {
        prop::array::uniform3(-range..range)
    }

    fn arb_fingerprint() -> impl Strategy<Value = Fingerprint> {
        (arb_vec3(20.0), arb_vec3(2.0), 0.0..50.0f64, any::<bool>()).prop_map(
            |(position, burgers, length, null_burgers)| {
                let burgers = if null_burgers { [0.0; 3] } else { burgers };
                fp(position, burgers, length)
            },
        )
    }

    proptest! {
        #[test]
        fn prop_score_is_symmetric(a in arb_fingerprint(), b in arb_fingerprint()) {
            let weights = SimilarityWeights::default();
            prop_assert_eq!(similarity_score(&a, &b, &weights), similarity_score(&b, &a, &weights));
        }

        #[test]
        fn prop_score_is_bounded(a in arb_fingerprint(), b in arb_fingerprint()) {
            let score = similarity_score(&a, &b, &SimilarityWeights::default());
            prop_assert!((0.0..=1.0).contains(&score));
        }
    }
}
