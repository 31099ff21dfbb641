//! Structured pipeline events.
//!
//! The orchestrator reports everything noteworthy through an [`EventSink`]
//! instead of logging directly, so tests can assert on what happened.

use crate::model::JobStatus;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Mutex;
use uuid::Uuid;

/// Step of a task at which something went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Lookup,
    Start,
    Convert,
    Persist,
    Preview,
    Tool,
    Complete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Lookup => "lookup",
            Stage::Start => "start",
            Stage::Convert => "convert",
            Stage::Persist => "persist",
            Stage::Preview => "preview",
            Stage::Tool => "tool",
            Stage::Complete => "complete",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    /// Upload whose job record no longer exists. Its files were removed.
    LostUpload { job_id: Uuid, path: PathBuf },

    StageFailed {
        stage: Stage,
        job_id: Option<Uuid>,
        data_product_id: Option<Uuid>,
        path: PathBuf,
        error: String,
    },

    /// Task for a job that had already completed.
    DuplicateTask { job_id: Uuid, data_product_id: Uuid },

    PreviewSkipped { path: PathBuf, marker: PathBuf },

    PreviewFailed { path: PathBuf, error: String },

    /// Files could not be cleaned up after a failure.
    CleanupFailed { path: PathBuf, error: String },

    JobCompleted {
        job_id: Uuid,
        data_product_id: Uuid,
        status: JobStatus,
        path: PathBuf,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: PipelineEvent);
}

/// Render an error and its sources as `outer: inner: root`.
///
/// Sources whose text is already part of the message are not repeated.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}

/// Forwards events to `tracing` with one field per identifier.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::LostUpload { job_id, path } => {
                tracing::error!(
                    job_id = %job_id,
                    path = %path.display(),
                    "Job not found, removed upload"
                );
            }
            PipelineEvent::StageFailed { stage, job_id, data_product_id, path, error } => {
                tracing::error!(
                    stage = %stage,
                    job_id = ?job_id,
                    data_product_id = ?data_product_id,
                    path = %path.display(),
                    "Stage failed: {}",
                    error
                );
            }
            PipelineEvent::DuplicateTask { job_id, data_product_id } => {
                tracing::warn!(
                    job_id = %job_id,
                    data_product_id = %data_product_id,
                    "Job already completed, task ignored"
                );
            }
            PipelineEvent::PreviewSkipped { path, marker } => {
                tracing::info!(
                    path = %path.display(),
                    marker = %marker.display(),
                    "Preview skipped after earlier failure"
                );
            }
            PipelineEvent::PreviewFailed { path, error } => {
                tracing::warn!(path = %path.display(), "Preview failed: {}", error);
            }
            PipelineEvent::CleanupFailed { path, error } => {
                tracing::warn!(path = %path.display(), "Cleanup failed: {}", error);
            }
            PipelineEvent::JobCompleted { job_id, data_product_id, status, path } => {
                tracing::info!(
                    job_id = %job_id,
                    data_product_id = %data_product_id,
                    path = %path.display(),
                    "Job completed with {}",
                    status
                );
            }
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Stages of every `StageFailed` event, in order.
    pub fn failed_stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::StageFailed { stage, .. } => Some(stage),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("outer failure")]
    struct Outer(#[source] std::io::Error);

    #[derive(Debug, thiserror::Error)]
    #[error("wrapped: {0}")]
    struct Wrapped(#[source] std::io::Error);

    #[test]
    fn test_error_chain() {
        let err = Outer(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(error_chain(&err), "outer failure: disk full");

        let err = Wrapped(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        assert_eq!(error_chain(&err), "wrapped: disk full");
    }

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        let path = PathBuf::from("/u/a/ortho.tif");
        sink.emit(PipelineEvent::StageFailed {
            stage: Stage::Convert,
            job_id: None,
            data_product_id: None,
            path: path.clone(),
            error: "boom".to_string(),
        });
        sink.emit(PipelineEvent::PreviewFailed { path: path.clone(), error: "x".to_string() });
        sink.emit(PipelineEvent::StageFailed {
            stage: Stage::Persist,
            job_id: None,
            data_product_id: None,
            path,
            error: "boom".to_string(),
        });

        assert_eq!(sink.events().len(), 3);
        assert_eq!(sink.failed_stages(), vec![Stage::Convert, Stage::Persist]);
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Persist.to_string(), "persist");
        assert_eq!(serde_json::to_string(&Stage::Convert).unwrap(), "\"convert\"");
    }
}
