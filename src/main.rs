use dislocation_tracker::parallel_pipeline::analyze_directory;
use dislocation_tracker::{TrackerConfig, TrackingPipeline};
use std::env;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // --- 1. Argument Parsing & Setup ---
    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        println!("Usage: dislocation_tracker <frames_dir> <output_json> [config_toml]");
        return Ok(());
    }
    let frames_dir = &args[1];
    let output_path = &args[2];
    let config = match args.get(3) {
        Some(path) => TrackerConfig::load(path)?,
        None => TrackerConfig::default(),
    };

    // --- 2. Tracking ---
    let mut pipeline = TrackingPipeline::new(config)?;
    let summary = analyze_directory(&mut pipeline, frames_dir).await?;

    // --- 3. Export ---
    pipeline.export_lineage_data(output_path)?;

    for err in pipeline.errors() {
        tracing::warn!(error = %err, "reported");
    }
    tracing::info!(
        frames = summary.frames_processed,
        failed = summary.frames_failed,
        lineages = summary.lineages,
        active = summary.active_lineages,
        tracks = summary.stats.total_tracks,
        nucleations = summary.stats.total_nucleations,
        annihilations = summary.stats.total_annihilations,
        merges = summary.stats.total_merges,
        splits = summary.stats.total_splits,
        "trajectory complete"
    );
    println!("Tracking complete. Lineages saved to {}", output_path);
    Ok(())
}
