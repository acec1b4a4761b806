// THEORY:
// The `segment` module is the input boundary of the tracker. An external defect
// extraction step analyses each simulation frame in isolation and emits a JSON
// document listing the dislocation segments it found. Nothing in that document
// carries identity across frames; that is what the rest of the crate rebuilds.
//
// Key architectural principles:
// 1.  **Dumb Data Container**: A `Segment` is an immutable snapshot of one line
//     defect in one frame: its frame-local index, a representative position, its
//     Burgers vector and its length. It knows nothing about other frames.
// 2.  **Per-Segment Fault Isolation**: Records are decoded one at a time. A record
//     with a missing or mistyped field is rejected on its own and reported as
//     `MalformedInput`; the remaining records of the frame are still usable.
// 3.  **Fixed Position Rule**: The position of a segment is the centroid of its
//     polyline `points`. Every frame uses the same rule so positions are comparable.

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;

use crate::core_modules::fingerprint::Vec3;
use crate::error::{Result, TrackingError};

/// Frame-local identifier assigned by the extraction step.
pub type SegmentIndex = u64;

/// One dislocation segment as seen in a single frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub index: SegmentIndex,
    /// Centroid of the segment's polyline.
    pub position: Vec3,
    /// Burgers vector in lattice units.
    pub burgers_vector: Vec3,
    pub length: f64,
}

impl Segment {
    pub fn new(index: SegmentIndex, position: Vec3, burgers_vector: Vec3, length: f64) -> Self {
        Self {
            index,
            position,
            burgers_vector,
            length,
        }
    }
}

/// Top-level shape of one frame's extraction output.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameDocument {
    pub dislocations: Option<DislocationSection>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DislocationSection {
    /// Kept as raw JSON so each record can fail independently.
    #[serde(default)]
    pub data: Option<Vec<Value>>,
}

/// A segment record exactly as the extraction step writes it. Every field is
/// optional here; `RawSegment::into_segment` decides what is required.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSegment {
    pub index: Option<u64>,
    pub points: Option<Vec<[f64; 3]>>,
    pub length: Option<f64>,
    pub burgers: Option<RawBurgers>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawBurgers {
    pub vector: Option<[f64; 3]>,
    pub magnitude: Option<f64>,
    pub fractional: Option<String>,
}

impl RawSegment {
    pub fn into_segment(self, frame: u64) -> Result<Segment> {
        let index = self
            .index
            .ok_or_else(|| TrackingError::malformed(frame, None, "missing `index`"))?;
        let malformed = |reason: &str| TrackingError::malformed(frame, Some(index), reason);

        let points = self.points.ok_or_else(|| malformed("missing `points`"))?;
        let position = centroid(&points).ok_or_else(|| malformed("`points` is empty"))?;
        let length = self.length.ok_or_else(|| malformed("missing `length`"))?;
        if !(length >= 0.0) {
            return Err(malformed("`length` must be non-negative"));
        }
        let burgers_vector = self
            .burgers
            .and_then(|b| b.vector)
            .ok_or_else(|| malformed("missing `burgers.vector`"))?;

        Ok(Segment {
            index,
            position,
            burgers_vector,
            length,
        })
    }
}

/// Arithmetic mean of a polyline's points. `None` for an empty polyline.
pub fn centroid(points: &[[f64; 3]]) -> Option<Vec3> {
    if points.is_empty() {
        return None;
    }
    let mut sum = [0.0; 3];
    for point in points {
        for axis in 0..3 {
            sum[axis] += point[axis];
        }
    }
    let n = points.len() as f64;
    Some([sum[0] / n, sum[1] / n, sum[2] / n])
}

/// Result of decoding one frame: the usable segments plus one error per rejected record.
#[derive(Debug, Default)]
pub struct ParsedFrame {
    pub segments: Vec<Segment>,
    pub rejected: Vec<TrackingError>,
}

/// Decodes every segment record of a frame document.
///
/// Fails as a whole only when the document has no `dislocations.data` array.
/// Individual bad records, and repeated indices after their first occurrence, end
/// up in `ParsedFrame::rejected`.
pub fn parse_frame_segments(frame: u64, document: FrameDocument) -> Result<ParsedFrame> {
    let records = document
        .dislocations
        .and_then(|section| section.data)
        .ok_or_else(|| TrackingError::malformed(frame, None, "missing `dislocations.data`"))?;

    let mut parsed = ParsedFrame::default();
    let mut seen: BTreeSet<SegmentIndex> = BTreeSet::new();

    for record in records {
        let declared_index = record.get("index").and_then(Value::as_u64);
        let decoded = serde_json::from_value::<RawSegment>(record)
            .map_err(|e| TrackingError::malformed(frame, declared_index, e.to_string()))
            .and_then(|raw| raw.into_segment(frame));

        match decoded {
            Ok(segment) if !seen.insert(segment.index) => {
                parsed.rejected.push(TrackingError::malformed(
                    frame,
                    Some(segment.index),
                    "duplicate `index` within frame",
                ));
            }
            Ok(segment) => parsed.segments.push(segment),
            Err(err) => parsed.rejected.push(err),
        }
    }

    Ok(parsed)
}

/// Parses a frame document from JSON text.
pub fn parse_frame_json(frame: u64, json: &str) -> Result<ParsedFrame> {
    let document: FrameDocument = serde_json::from_str(json)?;
    parse_frame_segments(frame, document)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn position_is_centroid_of_points() {
        let json = r#"{"dislocations": {"data": [
            {"index": 3, "points": [[0,0,0],[2,0,0],[4,6,0]], "length": 7.5,
             "burgers": {"vector": [0.5, 0.5, 0.0], "magnitude": 0.707, "fractional": "1/2[110]"}}
        ]}}"#;
        let parsed = parse_frame_json(0, json).unwrap();
        assert!(parsed.rejected.is_empty());
        assert_eq!(
            parsed.segments,
            vec![Segment::new(3, [2.0, 2.0, 0.0], [0.5, 0.5, 0.0], 7.5)]
        );
    }

    #[test]
    fn malformed_records_are_rejected_individually() {
        let json = r#"{"dislocations": {"data": [
            {"index": 0, "points": [[0,0,0]], "length": 1.0, "burgers": {"vector": [1,0,0]}},
            {"index": 1, "points": [[0,0,0]], "burgers": {"vector": [1,0,0]}},
            {"index": 2, "points": [], "length": 1.0, "burgers": {"vector": [1,0,0]}},
            {"index": 3, "points": [[0,0,0]], "length": 1.0, "burgers": {"magnitude": 1.0}},
            {"points": [[0,0,0]], "length": 1.0, "burgers": {"vector": [1,0,0]}},
            {"index": 5, "points": "nope", "length": 1.0, "burgers": {"vector": [1,0,0]}},
            {"index": 6, "points": [[0,0,0]], "length": -2.0, "burgers": {"vector": [1,0,0]}}
        ]}}"#;
        let parsed = parse_frame_json(9, json).unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].index, 0);
        assert_eq!(parsed.rejected.len(), 6);

        let indices: Vec<Option<u64>> = parsed
            .rejected
            .iter()
            .map(|e| match e {
                TrackingError::MalformedInput { frame, index, .. } => {
                    assert_eq!(*frame, 9);
                    *index
                }
                other => panic!("unexpected error {other:?}"),
            })
            .collect();
        assert_eq!(indices, vec![Some(1), Some(2), Some(3), None, Some(5), Some(6)]);
    }

    #[test]
    fn duplicate_index_keeps_first_occurrence() {
        let json = r#"{"dislocations": {"data": [
            {"index": 4, "points": [[1,1,1]], "length": 1.0, "burgers": {"vector": [1,0,0]}},
            {"index": 4, "points": [[9,9,9]], "length": 2.0, "burgers": {"vector": [0,1,0]}}
        ]}}"#;
        let parsed = parse_frame_json(0, json).unwrap();
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.segments[0].position, [1.0, 1.0, 1.0]);
        assert_eq!(parsed.rejected.len(), 1);
    }

    #[test]
    fn missing_data_section_fails_the_frame() {
        assert!(parse_frame_json(0, r#"{"other": 1}"#).is_err());
        assert!(parse_frame_json(0, r#"{"dislocations": {}}"#).is_err());
        let empty = parse_frame_json(0, r#"{"dislocations": {"data": []}}"#).unwrap();
        assert!(empty.segments.is_empty());
    }
}
