// THEORY:
// Reading and decoding frame files is the only part of a run that touches I/O, and
// frames are independent until they reach the tracker. The loader therefore fans
// file reads out over a tokio worker pool, while lineage commits stay strictly
// sequential: results are parked in `pending_frames` and released to the
// `TrackingPipeline` only when the next expected frame has arrived.
//
// At most `2 * workers` frames are in flight or parked at once, so memory stays
// bounded on long trajectories.

use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::{mpsc, oneshot};

use crate::config::TrackerConfig;
use crate::core_modules::segment::FrameDocument;
use crate::error::{Result, TrackingError};
use crate::pipeline::{TrackingPipeline, TrajectorySummary};

/// One frame file of a trajectory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSource {
    pub frame: u64,
    pub path: PathBuf,
}

/// Frame number encoded in a file name: the trailing digits of its stem
/// (`frame_0042.json` and `42.json` are both frame 42).
pub fn frame_number(path: &Path) -> Option<u64> {
    if path.extension()?.to_str()? != "json" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    let digits_start = stem
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)?;
    stem[digits_start..].parse().ok()
}

/// Lists the frame files of `dir` selected by the configuration, in frame order.
pub fn discover_frames(dir: impl AsRef<Path>, config: &TrackerConfig) -> Result<Vec<FrameSource>> {
    let mut sources = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some(frame) = frame_number(&path) else {
            continue;
        };
        if config.includes_frame(frame) {
            sources.push(FrameSource { frame, path });
        }
    }
    sources.sort_by(|a, b| a.frame.cmp(&b.frame).then_with(|| a.path.cmp(&b.path)));

    let before = sources.len();
    sources.dedup_by_key(|source| source.frame);
    if sources.len() != before {
        tracing::warn!(dropped = before - sources.len(), "several files share a frame number; keeping the first by name");
    }
    Ok(sources)
}

pub struct LoadTask {
    pub source: FrameSource,
    pub result_sender: oneshot::Sender<Result<FrameDocument>>,
}

/// Round-robin pool of tokio tasks that read and decode frame files.
pub struct WorkerPool {
    task_sender: mpsc::UnboundedSender<LoadTask>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, mut task_receiver) = mpsc::unbounded_channel::<LoadTask>();
        let mut workers = Vec::with_capacity(worker_count);

        let (worker_senders, worker_receivers): (Vec<_>, Vec<_>) = (0..worker_count)
            .map(|_| mpsc::unbounded_channel::<LoadTask>())
            .unzip();

        // Dispatcher
        tokio::spawn(async move {
            let mut worker_idx = 0;
            while let Some(task) = task_receiver.recv().await {
                let _ = worker_senders[worker_idx].send(task);
                worker_idx = (worker_idx + 1) % worker_count;
            }
        });

        for mut worker_receiver in worker_receivers {
            let worker = tokio::spawn(async move {
                while let Some(task) = worker_receiver.recv().await {
                    let loaded = Self::load_frame(&task.source).await;
                    let _ = task.result_sender.send(loaded);
                }
            });
            workers.push(worker);
        }

        Self {
            task_sender,
            workers,
        }
    }

    async fn load_frame(source: &FrameSource) -> Result<FrameDocument> {
        let text = tokio::fs::read_to_string(&source.path).await?;
        serde_json::from_str(&text).map_err(|e| {
            TrackingError::malformed(
                source.frame,
                None,
                format!("{}: {e}", source.path.display()),
            )
        })
    }

    /// Queues one frame; the receiver resolves once a worker has decoded it.
    pub fn submit(&self, source: FrameSource) -> Result<oneshot::Receiver<Result<FrameDocument>>> {
        let (result_sender, result_receiver) = oneshot::channel();
        self.task_sender
            .send(LoadTask {
                source,
                result_sender,
            })
            .map_err(|_| loader_stopped())?;
        Ok(result_receiver)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn loader_stopped() -> TrackingError {
    TrackingError::Io(std::io::Error::other("frame loader stopped"))
}

/// Loads frames concurrently and hands them to the pipeline in frame order.
pub struct TrajectoryLoader {
    pool: WorkerPool,
    window: usize,
}

impl TrajectoryLoader {
    pub fn new(worker_count: usize) -> Self {
        let pool = WorkerPool::new(worker_count);
        let window = pool.worker_count() * 2;
        Self { pool, window }
    }

    pub async fn run(&self, pipeline: &mut TrackingPipeline, sources: &[FrameSource]) -> TrajectorySummary {
        let mut summary = TrajectorySummary::default();
        let mut in_flight = FuturesUnordered::new();
        let mut pending_frames: BTreeMap<usize, Result<FrameDocument>> = BTreeMap::new();
        let mut next_submit = 0;
        let mut next_expected = 0;

        while next_expected < sources.len() {
            while next_submit < sources.len() && next_submit < next_expected + self.window {
                let position = next_submit;
                let receiver = self.pool.submit(sources[position].clone());
                in_flight.push(async move {
                    let loaded = match receiver {
                        Ok(receiver) => receiver.await.unwrap_or_else(|_| Err(loader_stopped())),
                        Err(err) => Err(err),
                    };
                    (position, loaded)
                });
                next_submit += 1;
            }

            let Some((position, loaded)) = in_flight.next().await else {
                break;
            };
            pending_frames.insert(position, loaded);

            while let Some(loaded) = pending_frames.remove(&next_expected) {
                let frame = sources[next_expected].frame;
                summary.record(pipeline.process_loaded(frame, loaded).is_some());
                next_expected += 1;
            }
        }

        summary.finish(pipeline)
    }
}

/// Tracks every selected frame file of `dir` with a concurrent loader.
pub async fn analyze_directory(
    pipeline: &mut TrackingPipeline,
    dir: impl AsRef<Path>,
) -> Result<TrajectorySummary> {
    let sources = discover_frames(dir.as_ref(), pipeline.config())?;
    tracing::info!(
        frames = sources.len(),
        dir = %dir.as_ref().display(),
        "starting trajectory"
    );
    let loader = TrajectoryLoader::new(pipeline.config().worker_count());
    Ok(loader.run(pipeline, &sources).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_json(segments: &[(u64, f64, [f64; 3], f64)]) -> String {
        let data: Vec<serde_json::Value> = segments
            .iter()
            .map(|&(index, x, burgers, length)| {
                serde_json::json!({
                    "index": index,
                    "points": [[x, 0.0, 0.0], [x, 2.0, 0.0]],
                    "length": length,
                    "burgers": {"vector": burgers, "magnitude": 0.0, "fractional": ""}
                })
            })
            .collect();
        serde_json::json!({"dislocations": {"data": data}}).to_string()
    }

    #[test]
    fn frame_numbers_come_from_trailing_digits() {
        assert_eq!(frame_number(Path::new("dump/frame_0042.json")), Some(42));
        assert_eq!(frame_number(Path::new("7.json")), Some(7));
        assert_eq!(frame_number(Path::new("frame.json")), None);
        assert_eq!(frame_number(Path::new("frame_3.txt")), None);
    }

    #[test]
    fn discovery_filters_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["frame_10.json", "frame_2.json", "frame_4.json", "notes.json", "frame_6.txt"] {
            std::fs::write(dir.path().join(name), "{}").unwrap();
        }
        let config = TrackerConfig {
            start_frame: 2,
            step: 2,
            end_frame: Some(8),
            ..TrackerConfig::default()
        };
        let frames: Vec<u64> = discover_frames(dir.path(), &config)
            .unwrap()
            .iter()
            .map(|s| s.frame)
            .collect();
        assert_eq!(frames, vec![2, 4]);
    }

    #[tokio::test]
    async fn directory_run_commits_in_frame_order() {
        let dir = tempfile::tempdir().unwrap();
        for frame in 0..12u64 {
            let x = frame as f64 * 0.25;
            std::fs::write(
                dir.path().join(format!("frame_{frame:03}.json")),
                frame_json(&[(0, x, [0.5, 0.5, 0.0], 6.0), (1, x + 100.0, [0.0, 0.0, 1.0], 3.0)]),
            )
            .unwrap();
        }

        let config = TrackerConfig {
            workers: Some(3),
            ..TrackerConfig::default()
        };
        let mut pipeline = TrackingPipeline::new(config).unwrap();
        let summary = analyze_directory(&mut pipeline, dir.path()).await.unwrap();

        assert_eq!(summary.frames_processed, 12);
        assert_eq!(summary.frames_failed, 0);
        assert_eq!(summary.lineages, 2);
        assert_eq!(summary.stats.total_tracks, 22);
        let frames: Vec<u64> = pipeline.tracking_log().iter().map(|r| r.frame).collect();
        assert_eq!(frames, (0..12).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn unreadable_frame_is_skipped_and_recorded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("frame_0.json"), frame_json(&[(0, 0.0, [1.0, 0.0, 0.0], 4.0)])).unwrap();
        std::fs::write(dir.path().join("frame_1.json"), "{ not json").unwrap();
        std::fs::write(dir.path().join("frame_2.json"), frame_json(&[(5, 0.5, [1.0, 0.0, 0.0], 4.0)])).unwrap();

        let mut pipeline = TrackingPipeline::with_defaults();
        let summary = analyze_directory(&mut pipeline, dir.path()).await.unwrap();

        assert_eq!(summary.frames_processed, 2);
        assert_eq!(summary.frames_failed, 1);
        assert_eq!(summary.errors, 1);
        // Frame 2 is compared against frame 0, the last committed frame.
        assert_eq!(summary.stats.total_tracks, 1);
        assert_eq!(summary.lineages, 1);
    }
}
