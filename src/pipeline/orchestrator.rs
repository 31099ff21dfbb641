//! Upload, tool and preview tasks composed from the converters, the toolbox,
//! the preview generator and the job tracker.
//!
//! Entry points never return errors. Every stage failure is reported through
//! the [`EventSink`], cleaned up, and recorded as a terminal job state; the
//! returned [`TaskOutcome`] only feeds dispatcher statistics.

use super::events::{error_chain, EventSink, PipelineEvent, Stage};
use super::metrics::Metrics;
use super::tracker::{JobError, JobTracker};
use crate::config::{Config, RetryConfig};
use crate::convert::{upload_dir, Converter, PointCloudConverter, RasterConverter};
use crate::model::{DataProductPatch, Job, JobStatus, ProductProperties, StyleSettings};
use crate::preview::{PointCloudPreviewRenderer, PreviewGenerator, PreviewOutcome};
use crate::store::{DataStore, StoreError};
use crate::toolbox::{check_output_path, Tool, ToolParams, ToolRunner, Toolbox};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductKind {
    Raster,
    PointCloud,
}

impl ProductKind {
    /// Name given to the upload job when the pipeline creates it itself.
    pub fn job_name(&self) -> &'static str {
        match self {
            ProductKind::Raster => "upload-data-product",
            ProductKind::PointCloud => "upload-point-cloud",
        }
    }

    pub fn data_type(&self) -> &'static str {
        match self {
            ProductKind::Raster => "ortho",
            ProductKind::PointCloud => "point_cloud",
        }
    }
}

/// A file that was just uploaded into its own directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadTask {
    pub kind: ProductKind,
    pub original_filename: String,
    pub file_path: PathBuf,
    pub user_id: Uuid,
    pub project_id: Uuid,
    pub flight_id: Uuid,
    pub job_id: Uuid,
    pub data_product_id: Uuid,
}

/// Run a toolbox algorithm on an existing raster into a new data product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolTask {
    pub tool_name: String,
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    #[serde(default)]
    pub params: ToolParams,
    pub new_data_product_id: Uuid,
    pub user_id: Uuid,
}

/// Render the preview of an existing point cloud.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviewTask {
    pub file_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Succeeded,
    Failed { stage: Stage },
    /// The job record was gone; the upload was discarded.
    Lost,
    /// The job had already completed; nothing was done.
    Duplicate,
}

/// Collaborators of a [`Pipeline`].
pub struct PipelineParts {
    pub store: Arc<dyn DataStore>,
    pub raster_converter: Arc<dyn Converter>,
    pub point_cloud_converter: Arc<dyn Converter>,
    pub previews: PreviewGenerator,
    pub tools: Arc<dyn ToolRunner>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
    pub retry: RetryConfig,
    /// Only directories strictly below this root are ever removed.
    pub upload_root: PathBuf,
}

pub struct Pipeline {
    store: Arc<dyn DataStore>,
    jobs: JobTracker,
    raster_converter: Arc<dyn Converter>,
    point_cloud_converter: Arc<dyn Converter>,
    previews: PreviewGenerator,
    tools: Arc<dyn ToolRunner>,
    events: Arc<dyn EventSink>,
    metrics: Arc<Metrics>,
    retry: RetryConfig,
    upload_root: PathBuf,
}

/// Identifiers attached to every event of one task.
struct TaskContext<'a> {
    job_id: Option<Uuid>,
    data_product_id: Option<Uuid>,
    path: &'a Path,
}

impl Pipeline {
    pub fn new(parts: PipelineParts) -> Self {
        Self {
            jobs: JobTracker::new(parts.store.clone()),
            store: parts.store,
            raster_converter: parts.raster_converter,
            point_cloud_converter: parts.point_cloud_converter,
            previews: parts.previews,
            tools: parts.tools,
            events: parts.events,
            metrics: parts.metrics,
            retry: parts.retry,
            upload_root: parts.upload_root,
        }
    }

    /// Pipeline with the GDAL, untwine and PDAL backed collaborators.
    pub fn from_config(config: &Config, store: Arc<dyn DataStore>, events: Arc<dyn EventSink>) -> Self {
        let renderer = Arc::new(PointCloudPreviewRenderer::from_config(&config.preview));
        Self::new(PipelineParts {
            store,
            raster_converter: Arc::new(RasterConverter::from_config(&config.conversion)),
            point_cloud_converter: Arc::new(PointCloudConverter::from_config(&config.conversion)),
            previews: PreviewGenerator::new(renderer, config.preview.max_size),
            tools: Arc::new(Toolbox::from_config(&config.conversion)),
            events,
            metrics: Metrics::new(),
            retry: config.pipeline.persistence_retry.clone(),
            upload_root: config.storage.upload_dir.clone(),
        })
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn jobs(&self) -> &JobTracker {
        &self.jobs
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Standardize an uploaded file and record it on its data product.
    pub fn process_upload(&self, task: &UploadTask) -> TaskOutcome {
        tracing::info!(
            job_id = %task.job_id,
            data_product_id = %task.data_product_id,
            "Processing {:?} upload {}",
            task.kind,
            task.original_filename
        );
        let outcome = self.upload(task);
        self.record(outcome)
    }

    /// Run a toolbox algorithm and record its output on the new data product.
    pub fn run_tool(&self, task: &ToolTask) -> TaskOutcome {
        tracing::info!(
            data_product_id = %task.new_data_product_id,
            "Running {} on {}",
            task.tool_name,
            task.input_path.display()
        );
        let outcome = self.tool(task);
        self.record(outcome)
    }

    /// Render the preview of an existing point cloud. Only the failure
    /// marker records a failure; no job is involved.
    pub fn generate_preview(&self, task: &PreviewTask) -> TaskOutcome {
        let outcome = if self.preview(&task.file_path) {
            TaskOutcome::Succeeded
        } else {
            TaskOutcome::Failed { stage: Stage::Preview }
        };
        self.record(outcome)
    }

    fn record(&self, outcome: TaskOutcome) -> TaskOutcome {
        match outcome {
            TaskOutcome::Succeeded => self.metrics.add_succeeded(),
            TaskOutcome::Failed { .. } => self.metrics.add_failed(),
            TaskOutcome::Lost => self.metrics.add_lost(),
            TaskOutcome::Duplicate => self.metrics.add_duplicate(),
        }
        outcome
    }

    fn upload(&self, task: &UploadTask) -> TaskOutcome {
        let ctx = TaskContext {
            job_id: Some(task.job_id),
            data_product_id: Some(task.data_product_id),
            path: &task.file_path,
        };

        let job = match self.jobs.get(task.job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                self.remove_upload_dir(&task.file_path);
                self.events.emit(PipelineEvent::LostUpload {
                    job_id: task.job_id,
                    path: task.file_path.clone(),
                });
                return TaskOutcome::Lost;
            }
            Err(e) => {
                self.remove_upload_dir(&task.file_path);
                return self.fail(Stage::Lookup, &ctx, None, error_chain(&e));
            }
        };

        if job.is_completed() {
            self.events.emit(PipelineEvent::DuplicateTask {
                job_id: job.id,
                data_product_id: task.data_product_id,
            });
            return TaskOutcome::Duplicate;
        }

        match self.store.get_data_product(task.data_product_id) {
            Ok(Some(_)) => {}
            Ok(None) => {
                self.remove_upload_dir(&task.file_path);
                let error = format!("data product {} not found", task.data_product_id);
                return self.fail(Stage::Lookup, &ctx, Some(&job), error);
            }
            Err(e) => {
                self.remove_upload_dir(&task.file_path);
                return self.fail(Stage::Lookup, &ctx, Some(&job), error_chain(&e));
            }
        }

        let job = match self.jobs.mark_started(&job) {
            Ok(job) => job,
            Err(e) => return self.start_failed(e, &ctx, &job),
        };

        let converter = match task.kind {
            ProductKind::Raster => &self.raster_converter,
            ProductKind::PointCloud => &self.point_cloud_converter,
        };
        let converted = match self.timed(Stage::Convert, || converter.convert(&task.file_path)) {
            Ok(converted) => converted,
            Err(e) => {
                self.remove_upload_dir(&task.file_path);
                return self.fail(Stage::Convert, &ctx, Some(&job), error_chain(&e));
            }
        };
        self.metrics.add_conversion(converted.passthrough);
        if !converted.passthrough {
            self.add_output_size(&converted.path);
        }

        let style = match (&task.kind, &converted.properties) {
            (ProductKind::Raster, ProductProperties::Raster(props)) => Some(StyleSettings::default_for(props)),
            _ => None,
        };
        let persisted = self.timed(Stage::Persist, || {
            self.persist(
                task.data_product_id,
                task.user_id,
                &converted.path,
                converted.properties.clone(),
                style,
            )
        });
        if let Err(e) = persisted {
            // Converted output lives in the upload directory too
            self.remove_upload_dir(&task.file_path);
            return self.fail(Stage::Persist, &ctx, Some(&job), error_chain(&e));
        }

        if task.kind == ProductKind::PointCloud {
            self.preview(&converted.path);
        }

        if let Err(e) = self.complete(&job) {
            return self.fail(Stage::Complete, &ctx, Some(&job), error_chain(&e));
        }

        if task.kind == ProductKind::PointCloud && converted.path != task.file_path {
            self.remove_file(&task.file_path);
        }

        self.events.emit(PipelineEvent::JobCompleted {
            job_id: job.id,
            data_product_id: task.data_product_id,
            status: JobStatus::Success,
            path: converted.path,
        });
        TaskOutcome::Succeeded
    }

    fn tool(&self, task: &ToolTask) -> TaskOutcome {
        let mut ctx = TaskContext {
            job_id: None,
            data_product_id: Some(task.new_data_product_id),
            path: &task.input_path,
        };

        let job = match self.jobs.create(task.new_data_product_id, &Tool::job_name(&task.tool_name)) {
            Ok(job) => job,
            Err(e) => return self.fail(Stage::Start, &ctx, None, error_chain(&e)),
        };
        ctx.job_id = Some(job.id);

        let job = match self.jobs.mark_started(&job) {
            Ok(job) => job,
            Err(e) => return self.start_failed(e, &ctx, &job),
        };

        // Cleanup below removes the output path, which must never be the input
        if let Err(e) = check_output_path(&task.tool_name, &task.input_path, &task.output_path) {
            return self.fail(Stage::Tool, &ctx, Some(&job), error_chain(&e));
        }

        let output = match self.timed(Stage::Tool, || {
            self.tools
                .run(&task.tool_name, &task.input_path, &task.output_path, &task.params)
        }) {
            Ok(output) => output,
            Err(e) => {
                self.remove_file(&task.output_path);
                return self.fail(Stage::Tool, &ctx, Some(&job), error_chain(&e));
            }
        };
        self.metrics.add_tool_run();
        self.add_output_size(&output.path);

        let persisted = self.timed(Stage::Persist, || {
            self.persist(
                task.new_data_product_id,
                task.user_id,
                &output.path,
                output.product_properties(),
                Some(output.style.clone()),
            )
        });
        if let Err(e) = persisted {
            self.remove_file(&output.path);
            return self.fail(Stage::Persist, &ctx, Some(&job), error_chain(&e));
        }

        if let Err(e) = self.complete(&job) {
            return self.fail(Stage::Complete, &ctx, Some(&job), error_chain(&e));
        }

        self.events.emit(PipelineEvent::JobCompleted {
            job_id: job.id,
            data_product_id: task.new_data_product_id,
            status: JobStatus::Success,
            path: output.path,
        });
        TaskOutcome::Succeeded
    }

    /// Best-effort preview. Returns whether no new failure occurred.
    fn preview(&self, path: &Path) -> bool {
        match self.timed(Stage::Preview, || self.previews.generate(path)) {
            Ok(PreviewOutcome::Rendered(_)) => {
                self.metrics.add_preview_rendered();
                true
            }
            Ok(PreviewOutcome::Skipped(marker)) => {
                self.metrics.add_preview_skipped();
                self.events.emit(PipelineEvent::PreviewSkipped {
                    path: path.to_path_buf(),
                    marker,
                });
                true
            }
            Err(e) => {
                self.metrics.add_preview_failed();
                self.events.emit(PipelineEvent::PreviewFailed {
                    path: path.to_path_buf(),
                    error: error_chain(&e),
                });
                false
            }
        }
    }

    /// Record the standardized file on its data product, plus an optional
    /// default style for the uploading user.
    ///
    /// The caller deletes the file when this fails, so a style write that
    /// still fails after retries puts the data product back as it was.
    fn persist(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
        path: &Path,
        properties: ProductProperties,
        style: Option<StyleSettings>,
    ) -> Result<(), StoreError> {
        let prior = self
            .with_retry(|| self.store.get_data_product(data_product_id))?
            .ok_or(StoreError::NotFound {
                entity: "data product",
                id: data_product_id,
            })?;

        let patch = DataProductPatch {
            filepath: Some(path.to_path_buf()),
            stac_properties: Some(Some(properties)),
        };
        self.with_retry(|| self.store.update_data_product(data_product_id, patch.clone()))?;

        let Some(style) = style else {
            return Ok(());
        };
        if let Err(e) = self.with_retry(|| self.store.create_user_style(data_product_id, user_id, style.clone())) {
            let restore = DataProductPatch::restore(&prior);
            if let Err(restore_err) = self.with_retry(|| self.store.update_data_product(data_product_id, restore.clone())) {
                tracing::error!(
                    data_product_id = %data_product_id,
                    "Failed to restore data product after style write failed: {}",
                    restore_err
                );
            }
            return Err(e);
        }
        Ok(())
    }

    fn with_retry<T>(&self, op: impl FnMut() -> Result<T, StoreError>) -> Result<T, StoreError> {
        // A missing record will not reappear
        self.retry_while(op, |e| !matches!(e, StoreError::NotFound { .. }))
    }

    /// Retry `op` with backoff for as long as `retryable` accepts its error.
    fn retry_while<T, E: Display>(
        &self,
        mut op: impl FnMut() -> Result<T, E>,
        retryable: impl Fn(&E) -> bool,
    ) -> Result<T, E> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_retries && retryable(&e) => {
                    let backoff = self.retry.backoff(attempt);
                    attempt += 1;
                    tracing::warn!(
                        "Persistence attempt {} failed: {}, retrying in {}ms",
                        attempt,
                        e,
                        backoff.as_millis()
                    );
                    self.metrics.add_persistence_retry();
                    std::thread::sleep(backoff);
                }
                Err(e) => {
                    if attempt > 0 {
                        tracing::error!("Persistence failed after {} attempts: {}", attempt + 1, e);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Move `job` to SUCCEEDED, retrying store failures like persistence.
    fn complete(&self, job: &Job) -> Result<Job, JobError> {
        self.retry_while(|| self.jobs.mark_succeeded(job), is_transient)
    }

    /// A start that raced with another worker completing the job is a duplicate.
    fn start_failed(&self, err: JobError, ctx: &TaskContext, job: &Job) -> TaskOutcome {
        if let JobError::AlreadyCompleted { id, .. } = err {
            self.events.emit(PipelineEvent::DuplicateTask {
                job_id: id,
                data_product_id: job.data_product_id,
            });
            return TaskOutcome::Duplicate;
        }
        self.fail(Stage::Start, ctx, Some(job), error_chain(&err))
    }

    /// Report a stage failure and move `job` (when known) to FAILED.
    fn fail(&self, stage: Stage, ctx: &TaskContext, job: Option<&Job>, error: String) -> TaskOutcome {
        self.events.emit(PipelineEvent::StageFailed {
            stage,
            job_id: ctx.job_id,
            data_product_id: ctx.data_product_id,
            path: ctx.path.to_path_buf(),
            error,
        });

        if let Some(job) = job {
            match self.retry_while(|| self.jobs.mark_failed(job), is_transient) {
                Ok(failed) => self.events.emit(PipelineEvent::JobCompleted {
                    job_id: failed.id,
                    data_product_id: failed.data_product_id,
                    status: failed.status,
                    path: ctx.path.to_path_buf(),
                }),
                Err(e) => self.events.emit(PipelineEvent::StageFailed {
                    stage: Stage::Complete,
                    job_id: Some(job.id),
                    data_product_id: ctx.data_product_id,
                    path: ctx.path.to_path_buf(),
                    error: error_chain(&e),
                }),
            }
        }
        TaskOutcome::Failed { stage }
    }

    fn timed<T>(&self, stage: Stage, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        self.metrics.add_stage_time(stage, start.elapsed());
        result
    }

    fn add_output_size(&self, path: &Path) {
        if let Ok(meta) = std::fs::metadata(path) {
            self.metrics.add_bytes_written(meta.len());
        }
    }

    /// Remove the directory an upload was placed in.
    fn remove_upload_dir(&self, file_path: &Path) {
        let dir = upload_dir(file_path);
        if !dir.exists() {
            return;
        }
        if !is_strictly_below(&dir, &self.upload_root) {
            self.events.emit(PipelineEvent::CleanupFailed {
                error: format!(
                    "refusing to remove a directory outside {}",
                    self.upload_root.display()
                ),
                path: dir,
            });
            return;
        }
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => tracing::debug!("Removed {}", dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self.events.emit(PipelineEvent::CleanupFailed {
                path: dir,
                error: e.to_string(),
            }),
        }
    }

    fn remove_file(&self, path: &Path) {
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!("Removed {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self.events.emit(PipelineEvent::CleanupFailed {
                path: path.to_path_buf(),
                error: e.to_string(),
            }),
        }
    }
}

/// Store failures other than a missing record may clear up on retry.
fn is_transient(err: &JobError) -> bool {
    matches!(err, JobError::Store(e) if !matches!(e, StoreError::NotFound { .. }))
}

/// True when `dir` resolves to a directory strictly inside `root`.
fn is_strictly_below(dir: &Path, root: &Path) -> bool {
    match (dir.canonicalize(), root.canonicalize()) {
        (Ok(dir), Ok(root)) => dir != root && dir.starts_with(&root),
        _ => false,
    }
}
