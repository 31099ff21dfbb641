//! Bounded-concurrency task execution.
//!
//! Tasks run on the blocking pool because GDAL handles and subprocess waits
//! block. A panicking task is counted and does not stop the batch.

use super::metrics::MetricsReporter;
use super::orchestrator::{Pipeline, PreviewTask, TaskOutcome, ToolTask, UploadTask};
use crate::config::WorkerConfig;
use anyhow::{Context, Result};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One unit of work as received from the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Task {
    Upload(UploadTask),
    Tool(ToolTask),
    Preview(PreviewTask),
}

impl Task {
    /// Parse one JSON task per line. Blank lines and `#` comments are ignored.
    pub fn parse_lines(text: &str) -> Result<Vec<Task>> {
        text.lines()
            .enumerate()
            .filter(|(_, line)| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with('#')
            })
            .map(|(index, line)| {
                serde_json::from_str(line).with_context(|| format!("Invalid task on line {}", index + 1))
            })
            .collect()
    }

    pub fn describe(&self) -> String {
        match self {
            Task::Upload(t) => format!("upload {} (job {})", t.original_filename, t.job_id),
            Task::Tool(t) => format!("{} on {}", t.tool_name, t.input_path.display()),
            Task::Preview(t) => format!("preview {}", t.file_path.display()),
        }
    }
}

impl Pipeline {
    /// Run one task to completion on the calling thread.
    pub fn execute(&self, task: &Task) -> TaskOutcome {
        match task {
            Task::Upload(t) => self.process_upload(t),
            Task::Tool(t) => self.run_tool(t),
            Task::Preview(t) => self.generate_preview(t),
        }
    }
}

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of tasks running at once
    pub concurrency: usize,

    /// Enable progress reporting
    pub enable_metrics: bool,

    /// Metrics reporting interval in seconds
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after the run completes
    pub metrics_output_path: Option<String>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for DispatcherConfig {
    fn from(worker: &WorkerConfig) -> Self {
        Self {
            concurrency: worker.concurrency.max(1),
            enable_metrics: worker.enable_metrics,
            metrics_interval_secs: worker.metrics_interval_secs,
            metrics_output_path: worker.metrics_output_path.clone(),
        }
    }
}

pub struct Dispatcher {
    pipeline: Arc<Pipeline>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(pipeline: Arc<Pipeline>, config: DispatcherConfig) -> Self {
        Self { pipeline, config }
    }

    /// Run a known batch of tasks.
    pub async fn run(&self, tasks: Vec<Task>) -> DispatchStats {
        let total = tasks.len() as u64;
        tracing::info!(
            "Dispatching {} tasks ({} concurrent)",
            total,
            self.config.concurrency
        );
        self.drive(stream::iter(tasks), Some(total)).await
    }

    /// Run tasks as they arrive until every sender is dropped.
    pub async fn run_queue(&self, receiver: mpsc::Receiver<Task>) -> DispatchStats {
        tracing::info!("Consuming task queue ({} concurrent)", self.config.concurrency);
        let tasks = stream::unfold(receiver, |mut rx| async move { rx.recv().await.map(|task| (task, rx)) });
        self.drive(tasks, None).await
    }

    async fn drive(&self, tasks: impl Stream<Item = Task>, total: Option<u64>) -> DispatchStats {
        // Start metrics reporter if enabled
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let reporter_handle = if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.pipeline.metrics().clone(),
                self.config.metrics_interval_secs,
                total,
            );
            Some(tokio::spawn(reporter.run(shutdown_rx)))
        } else {
            drop(shutdown_rx);
            None
        };

        let pipeline = self.pipeline.clone();
        let stats = tasks
            .map(|task| {
                let pipeline = pipeline.clone();
                async move {
                    let description = task.describe();
                    match tokio::task::spawn_blocking(move || pipeline.execute(&task)).await {
                        Ok(outcome) => Some(outcome),
                        Err(e) => {
                            tracing::error!("Task {} panicked: {}", description, e);
                            None
                        }
                    }
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .fold(DispatchStats::default(), |mut stats, result| async move {
                stats.record(result);
                stats
            })
            .await;

        // Shutdown metrics reporter
        let _ = shutdown_tx.send(()).await;
        if let Some(handle) = reporter_handle {
            let _ = handle.await;
        }

        if self.config.enable_metrics {
            let reporter = MetricsReporter::new(
                self.pipeline.metrics().clone(),
                self.config.metrics_interval_secs,
                total,
            );
            reporter.print_summary();

            if let Some(ref path) = self.config.metrics_output_path {
                let snapshot = self.pipeline.metrics().snapshot();
                if let Err(e) = snapshot.save_to_file(path) {
                    tracing::warn!("Failed to save metrics to {}: {}", path, e);
                }
            }
        }

        stats
    }
}

/// Statistics from a dispatcher run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchStats {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub lost: usize,
    pub duplicate: usize,
    pub panicked: usize,
}

impl DispatchStats {
    /// Count one finished task; `None` means it panicked.
    pub fn record(&mut self, outcome: Option<TaskOutcome>) {
        self.total += 1;
        match outcome {
            Some(TaskOutcome::Succeeded) => self.succeeded += 1,
            Some(TaskOutcome::Failed { .. }) => self.failed += 1,
            Some(TaskOutcome::Lost) => self.lost += 1,
            Some(TaskOutcome::Duplicate) => self.duplicate += 1,
            None => self.panicked += 1,
        }
    }
}

impl std::fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Succeeded: {}, Failed: {}, Lost: {}, Duplicate: {}, Panicked: {}, Total: {}",
            self.succeeded, self.failed, self.lost, self.duplicate, self.panicked, self.total
        )
    }
}
