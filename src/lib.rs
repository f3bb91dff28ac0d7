//! Tomo Batch
//!
//! Batch planning and driving of CT reconstructions for many acquisitions
//! below a common root, plus half-acquisition (360°) overlap search and
//! stitching.
//!
//! # Architecture
//!
//! The pipeline consists of:
//!
//! - **Index**: Acquisition layout, CT set classification, already-reconstructed sets
//! - **I/O**: TIFF frame access and per-set run records
//! - **Transform**: Sharpness metrics, flat-field helpers, correlation and stitching
//! - **Axis**: Rotation axis resolution and cross-view outlier correction
//! - **Pipeline**: Stage composition, engine commands, staging and orchestration
//! - **Stitch**: Overlap search and parallel find-and-stitch
//!
//! # Usage
//!
//! ```no_run
//! use std::path::Path;
//! use tomo_batch::{run_batch, Config};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(Path::new("batch.yaml"))?;
//!     let report = run_batch(&config)?;
//!     println!("{}", report);
//!     Ok(())
//! }
//! ```

pub mod axis;
pub mod config;
pub mod index;
pub mod io;
pub mod pipeline;
pub mod stitch;
pub mod transform;

pub use axis::{AxisEstimate, AxisResolver, ResolveError};
pub use config::{Config, ConfigUpdate};
pub use index::{classify, AcquisitionLayout, CtSet, DataLocation};
pub use io::{ImageStore, TiffStore};
pub use pipeline::{BatchMetrics, BatchOrchestrator, BatchPlan, RunReport};
pub use stitch::{OverlapReport, StitchStats};

use anyhow::{Context, Result};
use pipeline::{CommandRunner, DryRunRunner, ProcessRunner, StagingArea};
use std::sync::Arc;

/// Reconstruct every CT set under the configured input root.
pub fn run_batch(config: &Config) -> Result<RunReport> {
    config.validate()?;
    tracing::info!("Starting batch under {}", config.input.root.display());

    let store = TiffStore::new(config.input.image_extensions.clone());
    let metrics = BatchMetrics::new();
    let runner: &dyn CommandRunner = if config.output.dry_run {
        &DryRunRunner
    } else {
        &ProcessRunner
    };
    // Axis searches read back what the engine wrote, so they always execute.
    let orchestrator = BatchOrchestrator::new(config, &store, runner, &ProcessRunner, metrics.clone());
    let mut staging = StagingArea::new(&config.output.staging_dir);

    let report = orchestrator.run(&mut staging)?;
    finish_metrics(config, &metrics)?;
    Ok(report)
}

/// Classify, resolve and compose without executing any stage.
pub fn plan_batch(config: &Config) -> Result<BatchPlan> {
    config.validate()?;
    let store = TiffStore::new(config.input.image_extensions.clone());
    let orchestrator = BatchOrchestrator::new(config, &store, &DryRunRunner, &ProcessRunner, BatchMetrics::new());
    let mut staging = StagingArea::new(&config.output.staging_dir);

    let plan = orchestrator.plan(&mut staging)?;
    if !config.output.keep_temp {
        staging.sweep()?;
    }
    Ok(plan)
}

/// Search the half-acquisition overlap of every CT set.
pub fn find_overlaps(config: &Config) -> Result<OverlapReport> {
    let store = TiffStore::new(config.input.image_extensions.clone());
    let mut staging = StagingArea::new(&config.stitch.temp_dir);
    stitch::OverlapSearch::new(config, &store, &ProcessRunner).search_all(&mut staging)
}

/// Overlap search, outlier correction, axis log and parallel stitching of
/// every set into `<output>/stitched`.
pub fn auto_stitch(config: &Config) -> Result<StitchStats> {
    config.validate()?;
    std::fs::create_dir_all(&config.output.root)
        .with_context(|| format!("Failed to create {}", config.output.root.display()))?;
    let params = config.output.root.join(stitch::AUTO_STITCH_PARAMS_FILE);
    config.save(&params)?;
    tracing::info!("Parameters file saved at {}", params.display());

    let report = find_overlaps(config)?;
    tracing::info!("{}", report);
    let jobs = stitch::plan_stitch(config, &report)?;
    stitch::axis_values_log(config, &jobs).save()?;

    if config.output.dry_run {
        tracing::info!("Dry run: {} sets not stitched", jobs.len());
        return Ok(StitchStats::default());
    }

    let workers = config
        .processing
        .stitch_workers
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()));
    let metrics = BatchMetrics::new();
    let store: Arc<dyn ImageStore> = Arc::new(TiffStore::new(config.input.image_extensions.clone()));
    let runtime = build_runtime(config.processing.worker_threads)?;
    let stats = runtime.block_on(stitch::stitch_all(
        jobs,
        store,
        metrics.clone(),
        workers,
        config.processing.metrics_interval_secs,
    ));

    finish_metrics(config, &metrics)?;
    Ok(stats)
}

fn finish_metrics(config: &Config, metrics: &BatchMetrics) -> Result<()> {
    let snapshot = metrics.snapshot();
    tracing::info!("{}", snapshot);
    if let Some(path) = &config.processing.metrics_output_path {
        snapshot.save_to_file(path)?;
    }
    Ok(())
}

/// Build a Tokio runtime with the specified configuration.
pub fn build_runtime(worker_threads: Option<usize>) -> Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();

    if let Some(threads) = worker_threads {
        builder.worker_threads(threads);
    }

    builder.enable_all();

    Ok(builder.build()?)
}

/// Initialize the Rayon thread pool.
pub fn init_rayon(threads: Option<usize>) -> Result<()> {
    if let Some(threads) = threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()?;
    }
    Ok(())
}
