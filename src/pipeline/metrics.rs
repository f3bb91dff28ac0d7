//! Batch counters and progress reporting.

use serde::{Serialize, Serializer};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::interval;

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Counters shared by the orchestrator and the stitch workers.
#[derive(Debug, Default)]
pub struct BatchMetrics {
    /// External commands that exited successfully
    pub commands_run: AtomicU64,

    /// External commands that failed to start or exited non-zero
    pub commands_failed: AtomicU64,

    pub sets_processed: AtomicU64,

    /// Sets already reconstructed in the output tree
    pub sets_skipped: AtomicU64,

    pub sets_failed: AtomicU64,

    /// Projection pairs merged by the stitcher
    pub frames_stitched: AtomicU64,

    /// Wall time spent inside external commands (microseconds)
    pub engine_us: AtomicU64,

    start_time: Option<Instant>,
}

impl BatchMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        })
    }

    pub fn add_command(&self, elapsed: Duration) {
        self.commands_run.fetch_add(1, Ordering::Relaxed);
        self.engine_us.fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn add_command_failure(&self) {
        self.commands_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_set_processed(&self) {
        self.sets_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_set_skipped(&self) {
        self.sets_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_set_failed(&self) {
        self.sets_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_frames_stitched(&self, count: u64) {
        self.frames_stitched.fetch_add(count, Ordering::Relaxed);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    pub fn snapshot(&self) -> BatchMetricsSnapshot {
        BatchMetricsSnapshot {
            commands_run: self.commands_run.load(Ordering::Relaxed),
            commands_failed: self.commands_failed.load(Ordering::Relaxed),
            sets_processed: self.sets_processed.load(Ordering::Relaxed),
            sets_skipped: self.sets_skipped.load(Ordering::Relaxed),
            sets_failed: self.sets_failed.load(Ordering::Relaxed),
            frames_stitched: self.frames_stitched.load(Ordering::Relaxed),
            engine_secs: self.engine_us.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            elapsed: self.elapsed(),
        }
    }
}

/// Counters at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct BatchMetricsSnapshot {
    pub commands_run: u64,
    pub commands_failed: u64,
    pub sets_processed: u64,
    pub sets_skipped: u64,
    pub sets_failed: u64,
    pub frames_stitched: u64,
    /// Time spent waiting on external programs (seconds)
    pub engine_secs: f64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
}

impl BatchMetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path.display());
        Ok(())
    }
}

impl std::fmt::Display for BatchMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let engine_pct = if self.elapsed.as_secs_f64() > 0.0 {
            self.engine_secs / self.elapsed.as_secs_f64() * 100.0
        } else {
            0.0
        };
        write!(
            f,
            "Sets: {} processed, {} skipped, {} failed | Commands: {} run, {} failed | \
             Stitched: {} frames | Engine: {:.1}s ({:.0}%) | Elapsed: {:.1}s",
            self.sets_processed,
            self.sets_skipped,
            self.sets_failed,
            self.commands_run,
            self.commands_failed,
            self.frames_stitched,
            self.engine_secs,
            engine_pct,
            self.elapsed.as_secs_f64(),
        )
    }
}

/// Periodic progress log while stitch workers run.
pub struct MetricsReporter {
    metrics: Arc<BatchMetrics>,
    interval_secs: u64,
    total_frames: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<BatchMetrics>, interval_secs: u64, total_frames: u64) -> Self {
        Self {
            metrics,
            interval_secs,
            total_frames,
        }
    }

    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    let progress = if self.total_frames > 0 {
                        snapshot.frames_stitched as f64 / self.total_frames as f64 * 100.0
                    } else {
                        0.0
                    };
                    tracing::info!("[{:.1}%] {}", progress, snapshot);
                }
                _ = shutdown.recv() => {
                    tracing::info!("Final: {}", self.metrics.snapshot());
                    break;
                }
            }
        }
    }
}
