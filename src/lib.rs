// THEORY:
// This file is the entry point of the `dislocation_tracker` library crate. The
// public surface is the `TrackingPipeline` (one frame at a time), the trajectory
// loader in `parallel_pipeline` (a directory of frame files), the `TrackerConfig`,
// and the lineage/export types a caller needs to read the results. The per-frame
// algorithms live in `core_modules` and are public so they can be tested and
// reused on their own.

pub mod config;
pub mod core_modules;
pub mod error;
pub mod parallel_pipeline;
pub mod pipeline;

pub use config::{ConfigError, TrackerConfig};
pub use core_modules::export::{ExportedLineage, LineageExport, read_export};
pub use core_modules::lineage::{EventStatus, Lineage, LineageEvent, LineageId, LineageStore, SegmentFields};
pub use core_modules::segment::{FrameDocument, Segment, SegmentIndex};
pub use error::{Result, TrackingError};
pub use pipeline::{FrameReport, TrackingPipeline, TrackingStats, TrajectorySummary};
