//! Task counters, stage timings and periodic progress reporting.

use super::events::Stage;
use serde::{Serialize, Serializer};
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

/// Metrics for the pipeline.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Tasks that ended with a succeeded job (or a rendered preview)
    pub tasks_succeeded: AtomicU64,

    /// Tasks that ended with a failed job
    pub tasks_failed: AtomicU64,

    /// Uploads whose job record was missing
    pub tasks_lost: AtomicU64,

    /// Tasks for jobs that had already completed
    pub tasks_duplicate: AtomicU64,

    /// Inputs re-encoded to COG or COPC
    pub conversions: AtomicU64,

    /// Inputs already in their target format
    pub passthroughs: AtomicU64,

    /// Toolbox runs that produced an output
    pub tools_run: AtomicU64,

    pub previews_rendered: AtomicU64,
    pub previews_failed: AtomicU64,
    pub previews_skipped: AtomicU64,

    /// Persistence attempts that were retried
    pub persistence_retries: AtomicU64,

    /// Bytes of standardized output produced
    pub bytes_written: AtomicU64,

    /// Start time
    start_time: Option<Instant>,

    // Per-stage timing (in microseconds for precision)
    /// Time spent converting inputs (microseconds)
    pub convert_us: AtomicU64,

    /// Time spent running tools (microseconds)
    pub tool_us: AtomicU64,

    /// Time spent rendering previews (microseconds)
    pub preview_us: AtomicU64,

    /// Time spent persisting records (microseconds)
    pub persist_us: AtomicU64,
}

impl Metrics {
    /// Create new metrics.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            start_time: Some(Instant::now()),
            ..Self::default()
        })
    }

    pub fn add_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_failed(&self) {
        self.tasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_lost(&self) {
        self.tasks_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_duplicate(&self) {
        self.tasks_duplicate.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a conversion, or a passthrough when nothing was re-encoded.
    pub fn add_conversion(&self, passthrough: bool) {
        if passthrough {
            self.passthroughs.fetch_add(1, Ordering::Relaxed);
        } else {
            self.conversions.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn add_tool_run(&self) {
        self.tools_run.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_preview_rendered(&self) {
        self.previews_rendered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_preview_failed(&self) {
        self.previews_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_preview_skipped(&self) {
        self.previews_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_persistence_retry(&self) {
        self.persistence_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record time spent in a stage. Stages without a timer are ignored.
    pub fn add_stage_time(&self, stage: Stage, duration: Duration) {
        let counter = match stage {
            Stage::Convert => &self.convert_us,
            Stage::Tool => &self.tool_us,
            Stage::Preview => &self.preview_us,
            Stage::Persist => &self.persist_us,
            _ => return,
        };
        counter.fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    /// Get elapsed time since start.
    pub fn elapsed(&self) -> Duration {
        self.start_time.map_or(Duration::ZERO, |t| t.elapsed())
    }

    /// Tasks finished so far, whatever their outcome.
    pub fn tasks_finished(&self) -> u64 {
        self.tasks_succeeded.load(Ordering::Relaxed)
            + self.tasks_failed.load(Ordering::Relaxed)
            + self.tasks_lost.load(Ordering::Relaxed)
            + self.tasks_duplicate.load(Ordering::Relaxed)
    }

    /// Get finished tasks per second.
    pub fn tasks_per_second(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.tasks_finished() as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Get a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let secs = |us: &AtomicU64| us.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        MetricsSnapshot {
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            tasks_failed: self.tasks_failed.load(Ordering::Relaxed),
            tasks_lost: self.tasks_lost.load(Ordering::Relaxed),
            tasks_duplicate: self.tasks_duplicate.load(Ordering::Relaxed),
            conversions: self.conversions.load(Ordering::Relaxed),
            passthroughs: self.passthroughs.load(Ordering::Relaxed),
            tools_run: self.tools_run.load(Ordering::Relaxed),
            previews_rendered: self.previews_rendered.load(Ordering::Relaxed),
            previews_failed: self.previews_failed.load(Ordering::Relaxed),
            previews_skipped: self.previews_skipped.load(Ordering::Relaxed),
            persistence_retries: self.persistence_retries.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            elapsed: self.elapsed(),
            tasks_per_second: self.tasks_per_second(),
            convert_secs: secs(&self.convert_us),
            tool_secs: secs(&self.tool_us),
            preview_secs: secs(&self.preview_us),
            persist_secs: secs(&self.persist_us),
        }
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub tasks_succeeded: u64,
    pub tasks_failed: u64,
    pub tasks_lost: u64,
    pub tasks_duplicate: u64,
    pub conversions: u64,
    pub passthroughs: u64,
    pub tools_run: u64,
    pub previews_rendered: u64,
    pub previews_failed: u64,
    pub previews_skipped: u64,
    pub persistence_retries: u64,
    pub bytes_written: u64,
    #[serde(serialize_with = "serialize_duration")]
    pub elapsed: Duration,
    pub tasks_per_second: f64,
    /// Total time spent converting (seconds, summed across workers)
    pub convert_secs: f64,
    /// Total time spent in toolbox algorithms (seconds, summed across workers)
    pub tool_secs: f64,
    /// Total time spent rendering previews (seconds, summed across workers)
    pub preview_secs: f64,
    /// Total time spent persisting records, retries included
    pub persist_secs: f64,
}

impl MetricsSnapshot {
    /// Save metrics to a JSON file.
    pub fn save_to_file(&self, path: &str) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        tracing::info!("Metrics saved to {}", path);
        Ok(())
    }

    pub fn tasks_finished(&self) -> u64 {
        self.tasks_succeeded + self.tasks_failed + self.tasks_lost + self.tasks_duplicate
    }
}

impl std::fmt::Display for MetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let total_stage_time = self.convert_secs + self.tool_secs + self.preview_secs + self.persist_secs;
        let pct = |secs: f64| {
            if total_stage_time > 0.0 {
                secs / total_stage_time * 100.0
            } else {
                0.0
            }
        };

        write!(
            f,
            "Tasks: {} ok, {} failed, {} lost, {} duplicate | \
             Converted: {} (+{} passthrough) | Tools: {} | \
             Previews: {} rendered, {} failed, {} skipped | Retries: {} | \
             Written: {:.2} MB | Rate: {:.2} tasks/s | Elapsed: {:.1}s | \
             Time: convert {:.0}% | tool {:.0}% | preview {:.0}% | persist {:.0}%",
            self.tasks_succeeded,
            self.tasks_failed,
            self.tasks_lost,
            self.tasks_duplicate,
            self.conversions,
            self.passthroughs,
            self.tools_run,
            self.previews_rendered,
            self.previews_failed,
            self.previews_skipped,
            self.persistence_retries,
            self.bytes_written as f64 / (1024.0 * 1024.0),
            self.tasks_per_second,
            self.elapsed.as_secs_f64(),
            pct(self.convert_secs),
            pct(self.tool_secs),
            pct(self.preview_secs),
            pct(self.persist_secs),
        )
    }
}

/// Periodic metrics reporter.
pub struct MetricsReporter {
    metrics: Arc<Metrics>,
    interval_secs: u64,
    total_tasks: Option<u64>,
}

impl MetricsReporter {
    /// `total_tasks` is unknown when tasks arrive over a channel.
    pub fn new(metrics: Arc<Metrics>, interval_secs: u64, total_tasks: Option<u64>) -> Self {
        Self {
            metrics,
            interval_secs,
            total_tasks,
        }
    }

    /// Start the periodic reporter.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) {
        let mut ticker = interval(Duration::from_secs(self.interval_secs.max(1)));

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let snapshot = self.metrics.snapshot();
                    match self.total_tasks {
                        Some(total) if total > 0 => {
                            let progress = snapshot.tasks_finished() as f64 / total as f64 * 100.0;
                            tracing::info!("[{:.1}%] {}", progress, snapshot);
                        }
                        _ => tracing::info!("{}", snapshot),
                    }
                }
                _ = shutdown.recv() => {
                    let snapshot = self.metrics.snapshot();
                    tracing::info!("Final: {}", snapshot);
                    break;
                }
            }
        }
    }

    /// Print a final summary.
    pub fn print_summary(&self) {
        let snapshot = self.metrics.snapshot();

        println!("\n=== Pipeline Summary ===");
        println!("Total time: {:.1}s", snapshot.elapsed.as_secs_f64());
        println!("Tasks succeeded: {}", snapshot.tasks_succeeded);
        println!("Tasks failed: {}", snapshot.tasks_failed);
        println!("Tasks lost: {}", snapshot.tasks_lost);
        println!("Duplicate tasks: {}", snapshot.tasks_duplicate);
        println!("Conversions: {} ({} passthrough)", snapshot.conversions, snapshot.passthroughs);
        println!("Tools run: {}", snapshot.tools_run);
        println!(
            "Previews: {} rendered, {} failed, {} skipped",
            snapshot.previews_rendered, snapshot.previews_failed, snapshot.previews_skipped
        );
        println!("Persistence retries: {}", snapshot.persistence_retries);
        println!(
            "Data written: {:.2} MB",
            snapshot.bytes_written as f64 / (1024.0 * 1024.0)
        );

        let total_stage = snapshot.convert_secs + snapshot.tool_secs + snapshot.preview_secs + snapshot.persist_secs;
        if total_stage > 0.0 {
            println!("\n--- Stage Time Breakdown ---");
            println!("Convert:  {:>7.1}s ({:>5.1}%)", snapshot.convert_secs, snapshot.convert_secs / total_stage * 100.0);
            println!("Tool:     {:>7.1}s ({:>5.1}%)", snapshot.tool_secs, snapshot.tool_secs / total_stage * 100.0);
            println!("Preview:  {:>7.1}s ({:>5.1}%)", snapshot.preview_secs, snapshot.preview_secs / total_stage * 100.0);
            println!("Persist:  {:>7.1}s ({:>5.1}%)", snapshot.persist_secs, snapshot.persist_secs / total_stage * 100.0);
        }
        println!("========================\n");
    }
}
