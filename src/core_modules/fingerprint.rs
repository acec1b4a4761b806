// THEORY:
// A `Fingerprint` is the comparison-ready form of a `Segment`. It caches the values
// the similarity scorer needs for every pairwise comparison (Burgers magnitude and
// unit direction) so they are computed once per segment instead of once per pair.
//
// Fingerprints are rebuilt every frame and never mutated.

use rayon::prelude::*;
use std::collections::BTreeMap;

use crate::core_modules::segment::{Segment, SegmentIndex};

pub type Vec3 = [f64; 3];

/// Guards normalisation against a null Burgers vector or zero lengths.
pub const EPSILON: f64 = 1e-10;

pub fn add(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn sub(a: Vec3, b: Vec3) -> Vec3 {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn dot(a: Vec3, b: Vec3) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

/// Euclidean norm. Finite for any finite input whose norm fits in an `f64`.
pub fn norm(a: Vec3) -> f64 {
    a[0].hypot(a[1]).hypot(a[2])
}

pub fn scale(a: Vec3, factor: f64) -> Vec3 {
    [a[0] * factor, a[1] * factor, a[2] * factor]
}

/// Normalised, comparison-ready view of one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub index: SegmentIndex,
    pub position: Vec3,
    pub burgers_vector: Vec3,
    pub burgers_magnitude: f64,
    /// Unit Burgers direction, or the zero vector when the magnitude is null.
    pub burgers_normalized: Vec3,
    pub length: f64,
}

impl Fingerprint {
    pub fn from_segment(segment: &Segment) -> Self {
        let burgers_magnitude = norm(segment.burgers_vector);
        Self {
            index: segment.index,
            position: segment.position,
            burgers_vector: segment.burgers_vector,
            burgers_magnitude,
            burgers_normalized: scale(segment.burgers_vector, 1.0 / burgers_magnitude.max(EPSILON)),
            length: segment.length,
        }
    }
}

/// Builds the fingerprints of a whole frame in parallel, keyed by segment index.
pub fn build_fingerprints(segments: &[Segment]) -> BTreeMap<SegmentIndex, Fingerprint> {
    segments
        .par_iter()
        .map(|segment| (segment.index, Fingerprint::from_segment(segment)))
        .collect::<Vec<_>>()
        .into_iter()
        .collect()
}
