// THEORY:
// The `pipeline` module is the top-level API of the tracker. `TrackingPipeline` owns
// the only cross-frame state (the `TrackerState`) and turns a stream of per-frame
// segment lists into lineages.
//
// Each frame goes through three stages:
// 1.  **Resolve**: fingerprints, optimal one-to-one matching, merge/split search on
//     the residue, and classification of whatever is left as annihilations and
//     nucleations. Pure; produces a `FrameResolution` in segment-index space.
// 2.  **Validate**: every current segment must be classified exactly once and every
//     previous segment must map to an active lineage. A violation aborts the frame
//     before anything is written, so lineage integrity survives a bad frame.
// 3.  **Commit**: store mutations and counters in a fixed order (tracks, merges,
//     splits, annihilations, nucleations), then the current frame becomes the
//     comparison base for the next one.
//
// Frames must arrive in increasing frame order.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::config::TrackerConfig;
use crate::core_modules::assigner::{SegmentMatch, match_segments};
use crate::core_modules::complex_events::{
    MergeCandidate, SplitCandidate, accept_events, detect_complex_events,
};
use crate::core_modules::export::{LineageExport, export_lineages, write_export};
use crate::core_modules::fingerprint::{Fingerprint, build_fingerprints};
use crate::core_modules::lineage::{EventStatus, LineageId, LineageStore, SegmentFields};
use crate::core_modules::segment::{FrameDocument, Segment, SegmentIndex, parse_frame_segments};
use crate::error::{Result, TrackingError};

/// Running counters, incremented once per committed event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrackingStats {
    pub total_tracks: u64,
    pub total_nucleations: u64,
    pub total_annihilations: u64,
    pub total_merges: u64,
    pub total_splits: u64,
}

/// Summary of one committed frame.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FrameReport {
    pub frame: u64,
    pub tracked: usize,
    pub merges: usize,
    pub splits: usize,
    pub annihilated: usize,
    pub nucleated: usize,
    pub rejected_segments: usize,
}

/// Outcome of a whole trajectory run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TrajectorySummary {
    pub frames_processed: usize,
    pub frames_failed: usize,
    pub lineages: usize,
    pub active_lineages: usize,
    pub errors: usize,
    pub stats: TrackingStats,
}

impl TrajectorySummary {
    pub fn record(&mut self, committed: bool) {
        if committed {
            self.frames_processed += 1;
        } else {
            self.frames_failed += 1;
        }
    }

    pub fn finish(mut self, pipeline: &TrackingPipeline) -> Self {
        self.lineages = pipeline.store().len();
        self.active_lineages = pipeline.store().active_count();
        self.errors = pipeline.errors().len();
        self.stats = pipeline.stats().clone();
        self
    }
}

/// How every segment of a frame pair was explained, before any lineage is touched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameResolution {
    pub tracked: Vec<SegmentMatch>,
    pub merges: Vec<MergeCandidate>,
    pub splits: Vec<SplitCandidate>,
    pub annihilated: Vec<SegmentIndex>,
    pub nucleated: Vec<SegmentIndex>,
}

impl FrameResolution {
    /// Checks that each current index is classified exactly once (tracked, merge
    /// child, split child or nucleated) and each previous index exactly once
    /// (tracked, merge parent, split parent or annihilated).
    pub fn validate(
        &self,
        previous: &BTreeSet<SegmentIndex>,
        current: &BTreeSet<SegmentIndex>,
    ) -> Result<()> {
        let current_claims = self
            .tracked
            .iter()
            .map(|m| m.current)
            .chain(self.merges.iter().map(|m| m.child))
            .chain(self.splits.iter().flat_map(|s| s.children.iter().copied()))
            .chain(self.nucleated.iter().copied());
        check_partition("current", current_claims, current)?;

        let previous_claims = self
            .tracked
            .iter()
            .map(|m| m.previous)
            .chain(self.merges.iter().flat_map(|m| m.parents.iter().copied()))
            .chain(self.splits.iter().map(|s| s.parent))
            .chain(self.annihilated.iter().copied());
        check_partition("previous", previous_claims, previous)
    }
}

fn check_partition(
    side: &str,
    claims: impl Iterator<Item = SegmentIndex>,
    universe: &BTreeSet<SegmentIndex>,
) -> Result<()> {
    let mut seen = BTreeSet::new();
    for index in claims {
        if !universe.contains(&index) {
            return Err(TrackingError::invariant(format!(
                "{side} segment {index} is not part of the frame"
            )));
        }
        if !seen.insert(index) {
            return Err(TrackingError::invariant(format!(
                "{side} segment {index} takes part in more than one event"
            )));
        }
    }
    if let Some(missing) = universe.difference(&seen).next() {
        return Err(TrackingError::invariant(format!(
            "{side} segment {missing} was left unclassified"
        )));
    }
    Ok(())
}

/// Everything kept about the last committed frame.
#[derive(Debug, Clone)]
struct FrameSnapshot {
    frame: u64,
    fingerprints: BTreeMap<SegmentIndex, Fingerprint>,
    lineage_map: BTreeMap<SegmentIndex, LineageId>,
}

/// All mutable state of a tracking run.
#[derive(Debug, Default)]
struct TrackerState {
    store: LineageStore,
    previous: Option<FrameSnapshot>,
    frame_maps: BTreeMap<u64, BTreeMap<SegmentIndex, LineageId>>,
    stats: TrackingStats,
    errors: Vec<TrackingError>,
    tracking_log: Vec<FrameReport>,
}

/// Frame-over-frame lineage tracker.
pub struct TrackingPipeline {
    config: TrackerConfig,
    state: TrackerState,
}

impl TrackingPipeline {
    pub fn new(config: TrackerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            state: TrackerState::default(),
        })
    }

    pub fn with_defaults() -> Self {
        Self {
            config: TrackerConfig::default(),
            state: TrackerState::default(),
        }
    }

    /// Decodes a frame document and tracks its valid segments. Rejected records are
    /// added to the run's error list once the frame has been committed.
    pub fn process_document(&mut self, frame: u64, document: FrameDocument) -> Result<FrameReport> {
        let parsed = parse_frame_segments(frame, document)?;
        self.track(frame, parsed.segments, parsed.rejected)
    }

    /// Tracks one frame's segments against the last committed frame.
    ///
    /// # Errors
    ///
    /// `InvariantViolation` when the frame is out of order or its resolution would
    /// break lineage integrity. The frame is then discarded as a whole and the last
    /// committed frame stays the comparison base.
    pub fn process_frame(&mut self, frame: u64, segments: Vec<Segment>) -> Result<FrameReport> {
        self.track(frame, segments, Vec::new())
    }

    fn track(
        &mut self,
        frame: u64,
        segments: Vec<Segment>,
        mut rejected: Vec<TrackingError>,
    ) -> Result<FrameReport> {
        if let Some(previous) = &self.state.previous {
            if frame <= previous.frame {
                return Err(TrackingError::invariant(format!(
                    "frame {frame} arrived after frame {}",
                    previous.frame
                )));
            }
        }

        let mut current: BTreeMap<SegmentIndex, Segment> = BTreeMap::new();
        for segment in segments {
            if current.contains_key(&segment.index) {
                rejected.push(TrackingError::malformed(
                    frame,
                    Some(segment.index),
                    "duplicate `index` within frame",
                ));
                continue;
            }
            current.insert(segment.index, segment);
        }

        let ordered: Vec<Segment> = current.values().cloned().collect();
        let fingerprints = build_fingerprints(&ordered);
        let resolution = self.resolve(&fingerprints);
        self.validate(&resolution, &fingerprints)?;

        let lineage_map = self.commit(frame, &resolution, &current)?;
        let report = FrameReport {
            frame,
            tracked: resolution.tracked.len(),
            merges: resolution.merges.len(),
            splits: resolution.splits.len(),
            annihilated: resolution.annihilated.len(),
            nucleated: resolution.nucleated.len(),
            rejected_segments: rejected.len(),
        };
        tracing::info!(
            frame,
            tracked = report.tracked,
            merges = report.merges,
            splits = report.splits,
            annihilated = report.annihilated,
            nucleated = report.nucleated,
            active = self.state.store.active_count(),
            "frame committed"
        );

        for err in rejected {
            self.record_error(err);
        }
        self.state.frame_maps.insert(frame, lineage_map.clone());
        self.state.previous = Some(FrameSnapshot {
            frame,
            fingerprints,
            lineage_map,
        });
        self.state.tracking_log.push(report.clone());
        Ok(report)
    }

    /// Parses and tracks a frame given as JSON text.
    pub fn process_frame_json(&mut self, frame: u64, json: &str) -> Result<FrameReport> {
        let document: FrameDocument = serde_json::from_str(json)?;
        self.process_document(frame, document)
    }

    /// Feeds one loaded (or failed-to-load) frame into the run. Failures are recorded
    /// in the error list and the last committed frame stays the comparison base.
    pub fn process_loaded(&mut self, frame: u64, loaded: Result<FrameDocument>) -> Option<FrameReport> {
        match loaded.and_then(|document| self.process_document(frame, document)) {
            Ok(report) => Some(report),
            Err(err) => {
                tracing::warn!(frame, error = %err, "frame skipped");
                self.record_error(err);
                None
            }
        }
    }

    /// Runs every frame selected by the configured start, end and step, in order.
    pub fn analyze_trajectory<I>(&mut self, frames: I) -> TrajectorySummary
    where
        I: IntoIterator<Item = (u64, FrameDocument)>,
    {
        let mut summary = TrajectorySummary::default();
        for (frame, document) in frames {
            if !self.config.includes_frame(frame) {
                continue;
            }
            summary.record(self.process_loaded(frame, Ok(document)).is_some());
        }
        summary.finish(self)
    }

    fn resolve(&self, current: &BTreeMap<SegmentIndex, Fingerprint>) -> FrameResolution {
        let Some(previous) = &self.state.previous else {
            return FrameResolution {
                nucleated: current.keys().copied().collect(),
                ..FrameResolution::default()
            };
        };

        // --- 1. One-to-one matching ---
        let tracked = match_segments(
            &previous.fingerprints,
            current,
            &self.config.similarity_weights(),
            self.config.min_similarity,
        );
        let matched_prev: BTreeSet<SegmentIndex> = tracked.iter().map(|m| m.previous).collect();
        let matched_curr: BTreeSet<SegmentIndex> = tracked.iter().map(|m| m.current).collect();
        let mut unmatched_prev: BTreeSet<SegmentIndex> = previous
            .fingerprints
            .keys()
            .filter(|idx| !matched_prev.contains(*idx))
            .copied()
            .collect();
        let mut unmatched_curr: BTreeSet<SegmentIndex> = current
            .keys()
            .filter(|idx| !matched_curr.contains(*idx))
            .copied()
            .collect();

        // --- 2. Merges and splits on the residue ---
        let candidates = detect_complex_events(
            &previous.fingerprints,
            current,
            &unmatched_prev,
            &unmatched_curr,
            self.config.burgers_tolerance,
            self.config.max_event_arity,
        );
        let accepted = accept_events(candidates, &mut unmatched_prev, &mut unmatched_curr);

        // --- 3. Leftovers ---
        FrameResolution {
            tracked,
            merges: accepted.merges,
            splits: accepted.splits,
            annihilated: unmatched_prev.into_iter().collect(),
            nucleated: unmatched_curr.into_iter().collect(),
        }
    }

    fn validate(
        &self,
        resolution: &FrameResolution,
        current: &BTreeMap<SegmentIndex, Fingerprint>,
    ) -> Result<()> {
        let current_indices: BTreeSet<SegmentIndex> = current.keys().copied().collect();
        let previous_indices: BTreeSet<SegmentIndex> = self
            .state
            .previous
            .as_ref()
            .map(|p| p.fingerprints.keys().copied().collect())
            .unwrap_or_default();
        resolution.validate(&previous_indices, &current_indices)?;

        if let Some(previous) = &self.state.previous {
            let mut owners = BTreeSet::new();
            for (index, lineage) in &previous.lineage_map {
                if !self.state.store.is_active(*lineage) {
                    return Err(TrackingError::invariant(format!(
                        "segment {index} of frame {} maps to inactive lineage {lineage}",
                        previous.frame
                    )));
                }
                if !owners.insert(*lineage) {
                    return Err(TrackingError::invariant(format!(
                        "lineage {lineage} represents more than one segment of frame {}",
                        previous.frame
                    )));
                }
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        frame: u64,
        resolution: &FrameResolution,
        current: &BTreeMap<SegmentIndex, Segment>,
    ) -> Result<BTreeMap<SegmentIndex, LineageId>> {
        let previous_map = self
            .state
            .previous
            .as_ref()
            .map(|p| p.lineage_map.clone())
            .unwrap_or_default();
        let lineage_of = |index: SegmentIndex| -> Result<LineageId> {
            previous_map.get(&index).copied().ok_or_else(|| {
                TrackingError::invariant(format!("previous segment {index} has no lineage"))
            })
        };
        let fields_of = |index: SegmentIndex| -> Result<SegmentFields> {
            current.get(&index).map(SegmentFields::from).ok_or_else(|| {
                TrackingError::invariant(format!("current segment {index} is unknown"))
            })
        };

        let store = &mut self.state.store;
        let stats = &mut self.state.stats;
        let mut map = BTreeMap::new();

        for m in &resolution.tracked {
            let lineage = lineage_of(m.previous)?;
            store.update(lineage, frame, EventStatus::Tracked, fields_of(m.current)?)?;
            map.insert(m.current, lineage);
            stats.total_tracks += 1;
        }

        for merge in &resolution.merges {
            let parents = merge
                .parents
                .iter()
                .map(|&p| lineage_of(p))
                .collect::<Result<Vec<_>>>()?;
            let child = store.create_with_status(
                frame,
                EventStatus::MergeProductOf(parents.clone()),
                fields_of(merge.child)?,
            )?;
            for parent in &parents {
                store.terminate(*parent, frame, EventStatus::MergedInto(child), None)?;
            }
            tracing::debug!(frame, child = %child, parents = ?parents, residual = merge.residual, "merge");
            map.insert(merge.child, child);
            stats.total_merges += 1;
        }

        for split in &resolution.splits {
            let parent = lineage_of(split.parent)?;
            store.terminate(parent, frame, EventStatus::Split, None)?;
            for &child_index in &split.children {
                let child = store.create_with_status(
                    frame,
                    EventStatus::SplitProductOf(parent),
                    fields_of(child_index)?,
                )?;
                map.insert(child_index, child);
            }
            tracing::debug!(frame, parent = %parent, children = ?split.children, residual = split.residual, "split");
            stats.total_splits += 1;
        }

        for &index in &resolution.annihilated {
            let lineage = lineage_of(index)?;
            if store.is_active(lineage) {
                store.terminate(lineage, frame, EventStatus::Annihilated, None)?;
                stats.total_annihilations += 1;
            }
        }

        for &index in &resolution.nucleated {
            let lineage = store.create(frame, fields_of(index)?);
            map.insert(index, lineage);
            stats.total_nucleations += 1;
        }

        Ok(map)
    }

    /// Adds an error to the run's error list.
    pub fn record_error(&mut self, err: TrackingError) {
        tracing::warn!(error = %err, "tracking error recorded");
        self.state.errors.push(err);
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn store(&self) -> &LineageStore {
        &self.state.store
    }

    pub fn stats(&self) -> &TrackingStats {
        &self.state.stats
    }

    pub fn errors(&self) -> &[TrackingError] {
        &self.state.errors
    }

    pub fn tracking_log(&self) -> &[FrameReport] {
        &self.state.tracking_log
    }

    /// Last committed frame number.
    pub fn last_frame(&self) -> Option<u64> {
        self.state.previous.as_ref().map(|p| p.frame)
    }

    /// Segment-index to lineage mapping of a committed frame.
    pub fn lineage_map(&self, frame: u64) -> Option<&BTreeMap<SegmentIndex, LineageId>> {
        self.state.frame_maps.get(&frame)
    }

    pub fn export(&self) -> LineageExport {
        export_lineages(&self.state.store)
    }

    pub fn export_lineage_data(&self, path: impl AsRef<Path>) -> Result<()> {
        write_export(&self.export(), path)
    }
}
