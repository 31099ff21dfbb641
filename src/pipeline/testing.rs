//! Fakes and fixtures shared by the pipeline tests.

use super::events::MemorySink;
use super::metrics::Metrics;
use super::orchestrator::{Pipeline, PipelineParts, ProductKind, UploadTask};
use crate::config::RetryConfig;
use crate::convert::{
    cog_output_path, copc_output_path, ConvertError, ConvertedProduct, Converter,
    PointCloudConverter, RasterConverter,
};
use crate::model::{
    BandInfo, BandStats, DataProduct, DataProductPatch, Job, JobPatch, JobStatus, NewDataProduct, NewJob,
    PointCloudProperties, ProductProperties, RasterProperties, StyleSettings, UserStyle,
};
use crate::preview::testing::FakeRenderer;
use crate::preview::PreviewGenerator;
use crate::store::{DataStore, MemoryStore, StoreError};
use crate::toolbox::{ToolOutput, ToolParams, ToolRunner, ToolboxError};
use crate::tools::{CommandOutput, CommandRunner};
use std::ffi::OsString;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

pub fn raster_properties() -> RasterProperties {
    RasterProperties {
        epsg: Some(32610),
        wkt: None,
        shape: [50, 70],
        transform: [610000.0, 0.5, 0.0, 4261000.0, 0.0, -0.5],
        bbox: None,
        bands: vec![BandInfo {
            data_type: "Float32".to_string(),
            nodata: Some(-9999.0),
            stats: BandStats { minimum: -0.2, maximum: 0.9, mean: 0.4, stddev: 0.1 },
        }],
        driver: "GTiff".to_string(),
    }
}

pub fn point_cloud_properties() -> PointCloudProperties {
    PointCloudProperties {
        las_version: "1.4".to_string(),
        point_format: 6,
        point_count: 1000,
        bounds: [610000.0, 4260000.0, 10.0, 610100.0, 4260050.0, 40.0],
        scale: [0.01, 0.01, 0.01],
        offset: [0.0, 0.0, 0.0],
        compressed: true,
        copc: true,
    }
}

/// Converter writing a placeholder output next to the input.
pub struct FakeConverter {
    pub kind: ProductKind,
    pub fail: bool,
    pub passthrough: bool,
}

impl Converter for FakeConverter {
    fn convert(&self, input: &Path) -> Result<ConvertedProduct, ConvertError> {
        if self.fail {
            return Err(ConvertError::Unreadable {
                path: input.to_path_buf(),
                reason: "not a recognized format".to_string(),
            });
        }
        let (path, properties) = match self.kind {
            ProductKind::Raster => (cog_output_path(input), ProductProperties::Raster(raster_properties())),
            ProductKind::PointCloud => (
                copc_output_path(input),
                ProductProperties::PointCloud(point_cloud_properties()),
            ),
        };
        if self.passthrough {
            return Ok(ConvertedProduct { path: input.to_path_buf(), properties, passthrough: true });
        }
        std::fs::write(&path, b"standardized").map_err(|source| ConvertError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(ConvertedProduct { path, properties, passthrough: false })
    }
}

/// Tool runner writing a placeholder output, or a partial one before failing.
pub struct FakeTools {
    pub fail: bool,
}

impl ToolRunner for FakeTools {
    fn run(
        &self,
        tool_name: &str,
        _input: &Path,
        output: &Path,
        _params: &ToolParams,
    ) -> Result<ToolOutput, ToolboxError> {
        let _ = std::fs::write(output, b"index");
        if self.fail {
            return Err(ToolboxError::Execution {
                tool: tool_name.to_string(),
                reason: "band math failed".to_string(),
            });
        }
        let properties = raster_properties();
        Ok(ToolOutput {
            path: output.to_path_buf(),
            style: StyleSettings::from_stats(&properties.bands[0].stats),
            properties,
        })
    }
}

/// Indexing tool that always exits with `code`.
pub struct ExitingRunner {
    pub code: i32,
}

impl CommandRunner for ExitingRunner {
    fn run(&self, _program: &Path, _args: &[OsString]) -> std::io::Result<CommandOutput> {
        Ok(CommandOutput {
            exit_code: Some(self.code),
            stdout: String::new(),
            stderr: "untwine: out of memory".to_string(),
        })
    }
}

/// Memory store whose data product updates, style inserts and success
/// transitions fail a set number of times before succeeding.
#[derive(Default)]
pub struct FailingStore {
    pub inner: MemoryStore,
    pub update_failures: AtomicUsize,
    pub style_failures: AtomicUsize,
    pub success_failures: AtomicUsize,
    pub update_calls: AtomicUsize,
}

impl FailingStore {
    fn take_failure(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl DataStore for FailingStore {
    fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.get_job(id)
    }

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError> {
        self.inner.create_job(job)
    }

    fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        if patch.status == Some(JobStatus::Success) && Self::take_failure(&self.success_failures) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.update_job(id, patch)
    }

    fn find_job_for_data_product(&self, data_product_id: Uuid) -> Result<Option<Job>, StoreError> {
        self.inner.find_job_for_data_product(data_product_id)
    }

    fn get_data_product(&self, id: Uuid) -> Result<Option<DataProduct>, StoreError> {
        self.inner.get_data_product(id)
    }

    fn create_data_product(&self, product: NewDataProduct) -> Result<DataProduct, StoreError> {
        self.inner.create_data_product(product)
    }

    fn update_data_product(&self, id: Uuid, patch: DataProductPatch) -> Result<DataProduct, StoreError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.update_failures) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.update_data_product(id, patch)
    }

    fn list_data_products_by_flight(&self, flight_id: Uuid) -> Result<Vec<DataProduct>, StoreError> {
        self.inner.list_data_products_by_flight(flight_id)
    }

    fn create_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
        settings: StyleSettings,
    ) -> Result<UserStyle, StoreError> {
        if Self::take_failure(&self.style_failures) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.create_user_style(data_product_id, user_id, settings)
    }

    fn get_user_style(&self, data_product_id: Uuid, user_id: Uuid) -> Result<Option<UserStyle>, StoreError> {
        self.inner.get_user_style(data_product_id, user_id)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HarnessOptions {
    pub convert_fails: bool,
    pub passthrough: bool,
    pub preview_fails: bool,
    pub tool_fails: bool,
    pub update_failures: usize,
    pub style_failures: usize,
    pub success_failures: usize,
    pub max_retries: usize,
    /// Use the GDAL raster converter instead of the fake.
    pub real_raster: bool,
    /// Use the point-cloud converter over an indexing tool exiting with this code.
    pub untwine_exit: Option<i32>,
}

/// A pipeline over fakes rooted in a temporary upload directory.
pub struct Harness {
    pub root: TempDir,
    pub store: Arc<FailingStore>,
    pub sink: Arc<MemorySink>,
    pub renderer: Arc<FakeRenderer>,
    pub pipeline: Pipeline,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HarnessOptions::default())
    }

    pub fn with(options: HarnessOptions) -> Self {
        let store = Arc::new(FailingStore::default());
        store.update_failures.store(options.update_failures, Ordering::SeqCst);
        store.style_failures.store(options.style_failures, Ordering::SeqCst);
        store.success_failures.store(options.success_failures, Ordering::SeqCst);
        let root = tempfile::tempdir().expect("tempdir");

        let sink = Arc::new(MemorySink::new());
        let renderer = FakeRenderer::new(options.preview_fails);
        let converter = |kind| -> Arc<dyn Converter> {
            Arc::new(FakeConverter {
                kind,
                fail: options.convert_fails,
                passthrough: options.passthrough,
            })
        };
        let raster_converter: Arc<dyn Converter> = if options.real_raster {
            Arc::new(RasterConverter::default())
        } else {
            converter(ProductKind::Raster)
        };
        let point_cloud_converter: Arc<dyn Converter> = match options.untwine_exit {
            Some(code) => Arc::new(PointCloudConverter::new("untwine", Arc::new(ExitingRunner { code }))),
            None => converter(ProductKind::PointCloud),
        };

        let pipeline = Pipeline::new(PipelineParts {
            store: store.clone(),
            raster_converter,
            point_cloud_converter,
            previews: PreviewGenerator::new(renderer.clone(), 256),
            tools: Arc::new(FakeTools { fail: options.tool_fails }),
            events: sink.clone(),
            metrics: Metrics::new(),
            retry: RetryConfig {
                max_retries: options.max_retries,
                initial_backoff_ms: 1,
                max_backoff_ms: 2,
            },
            upload_root: root.path().to_path_buf(),
        });

        Self {
            root,
            store,
            sink,
            renderer,
            pipeline,
        }
    }

    /// Place a file in a fresh upload directory with a pending job and a
    /// placeholder data product.
    pub fn upload(&self, kind: ProductKind, filename: &str) -> UploadTask {
        let dir = self.root.path().join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir).expect("create upload dir");
        let file_path = dir.join(filename);
        std::fs::write(&file_path, b"raw upload").expect("write upload");

        let flight_id = Uuid::new_v4();
        let product = DataProduct {
            id: Uuid::new_v4(),
            flight_id,
            data_type: kind.data_type().to_string(),
            filepath: file_path.clone(),
            original_filename: filename.to_string(),
            stac_properties: None,
        };
        self.store.inner.insert_data_product(product.clone());

        let job = Job {
            id: Uuid::new_v4(),
            data_product_id: product.id,
            name: kind.job_name().to_string(),
            state: crate::model::JobState::Pending,
            status: JobStatus::Waiting,
            start_time: Utc::now(),
            end_time: None,
        };
        self.store.inner.insert_job(job.clone());

        UploadTask {
            kind,
            original_filename: filename.to_string(),
            file_path,
            user_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            flight_id,
            job_id: job.id,
            data_product_id: product.id,
        }
    }

    /// Insert an empty data product for a tool result.
    pub fn tool_product(&self) -> Uuid {
        let product = DataProduct {
            id: Uuid::new_v4(),
            flight_id: Uuid::new_v4(),
            data_type: "ndvi".to_string(),
            filepath: PathBuf::new(),
            original_filename: String::new(),
            stac_properties: None,
        };
        self.store.inner.insert_data_product(product.clone());
        product.id
    }

    pub fn job(&self, id: Uuid) -> Job {
        self.store.get_job(id).expect("store").expect("job exists")
    }

    pub fn product(&self, id: Uuid) -> DataProduct {
        self.store.get_data_product(id).expect("store").expect("product exists")
    }
}
