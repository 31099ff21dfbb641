//! Task orchestration: job tracking, the upload and tool flows, and the
//! dispatcher that runs them concurrently.

pub mod dispatch;
pub mod events;
pub mod metrics;
pub mod orchestrator;
pub mod tracker;

#[cfg(test)]
mod orchestrator_tests;
#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{DispatchStats, Dispatcher, DispatcherConfig, Task};
pub use events::{error_chain, EventSink, MemorySink, PipelineEvent, Stage, TracingSink};
pub use metrics::{Metrics, MetricsReporter, MetricsSnapshot};
pub use orchestrator::{
    Pipeline, PipelineParts, PreviewTask, ProductKind, TaskOutcome, ToolTask, UploadTask,
};
pub use tracker::{JobError, JobTracker};
