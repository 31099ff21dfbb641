//! Geospatial data product pipeline
//!
//! Turns uploaded rasters and point clouds into cloud-optimized data products
//! (COG and COPC), extracts their metadata, renders previews, and derives new
//! rasters with band-math tools. Every unit of work is tracked as a job whose
//! persisted state is the contract with pollers.
//!
//! # Architecture
//!
//! - **Convert**: COG re-encoding through GDAL, COPC through untwine
//! - **Preview**: best-effort PNG previews with a failure marker
//! - **Toolbox**: NDVI, ExG and VARI over ndarray with rayon
//! - **Pipeline**: job state machine, upload/tool orchestration, dispatcher
//! - **Store**: `DataStore` over SQLite or memory
//!
//! # Usage
//!
//! ```no_run
//! use geoproduct_pipeline::{open_store, run_tasks, Config, Task};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_file(&"config.yaml".into())?;
//!     let tasks = Task::parse_lines(&std::fs::read_to_string("tasks.jsonl")?)?;
//!     let stats = run_tasks(&config, open_store(&config.storage)?, tasks).await?;
//!     println!("{}", stats);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod convert;
pub mod crs;
pub mod model;
pub mod pipeline;
pub mod preview;
pub mod store;
pub mod toolbox;
pub mod tools;

pub use config::Config;
pub use convert::{ConvertError, ConvertedProduct, Converter, PointCloudConverter, RasterConverter};
pub use model::{DataProduct, DataProductView, Job, JobPhase, ProductProperties};
pub use pipeline::{
    DispatchStats, Dispatcher, DispatcherConfig, JobTracker, Pipeline, Task, TaskOutcome,
    TracingSink,
};
pub use preview::PreviewGenerator;
pub use store::{DataStore, MemoryStore, SqliteStore};
pub use toolbox::{Tool, Toolbox};

use anyhow::{Context, Result};
use std::sync::Arc;

/// Open the configured data store: SQLite when a database path is set,
/// otherwise an in-memory store.
pub fn open_store(storage: &config::StorageConfig) -> Result<Arc<dyn DataStore>> {
    match &storage.database_path {
        Some(path) => {
            let store = SqliteStore::open(path)
                .with_context(|| format!("Failed to open database {}", path.display()))?;
            tracing::info!("Using database {}", path.display());
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database_path configured, records will not outlive this process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Run a batch of tasks with the configured collaborators.
pub async fn run_tasks(config: &Config, store: Arc<dyn DataStore>, tasks: Vec<Task>) -> Result<DispatchStats> {
    config.validate()?;

    tracing::info!("Starting data product pipeline");
    let pipeline = Arc::new(Pipeline::from_config(config, store, Arc::new(TracingSink)));
    let dispatcher = Dispatcher::new(pipeline, DispatcherConfig::from(&config.worker));

    let stats = dispatcher.run(tasks).await;
    tracing::info!("Pipeline complete: {}", stats);

    Ok(stats)
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
