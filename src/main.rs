//! Geospatial data product pipeline CLI
//!
//! Processes uploads, runs toolbox algorithms and inspects job state.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use geoproduct_pipeline::model::{data_product_view, NewDataProduct};
use geoproduct_pipeline::pipeline::{PreviewTask, ProductKind, ToolTask, UploadTask};
use geoproduct_pipeline::preview::{PreviewOutcome, RasterPreviewRenderer};
use geoproduct_pipeline::toolbox::ToolParams;
use geoproduct_pipeline::{
    build_runtime, init_rayon, open_store, run_tasks, Config, DataStore, Pipeline, PreviewGenerator,
    Task, TaskOutcome, Tool, TracingSink,
};

#[derive(Parser)]
#[command(name = "geoproduct")]
#[command(about = "Convert uploads into COG / COPC data products and track their jobs", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml", global = true)]
    config: PathBuf,

    /// Override concurrency level
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tasks from a JSON-lines file
    RunTasks {
        /// One JSON task per line
        file: PathBuf,
    },

    /// Register and process a local file as a new data product
    Upload {
        file: PathBuf,

        /// Product kind (inferred from the extension when omitted)
        #[arg(long, value_enum)]
        kind: Option<KindArg>,

        #[arg(long)]
        flight: Option<Uuid>,

        #[arg(long)]
        user: Option<Uuid>,
    },

    /// Run a toolbox algorithm into a new data product
    Tool {
        /// Tool name (ndvi, exg, vari)
        name: String,

        #[arg(long)]
        input: PathBuf,

        #[arg(long)]
        output: PathBuf,

        /// Tool parameter as key=value, repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, serde_json::Value)>,

        #[arg(long)]
        flight: Option<Uuid>,

        #[arg(long)]
        user: Option<Uuid>,
    },

    /// Render the preview of an existing file
    Preview {
        file: PathBuf,

        /// Treat the input as a raster instead of a point cloud
        #[arg(long)]
        raster: bool,

        /// Remove an earlier failure marker first
        #[arg(long)]
        retry: bool,
    },

    /// Show a job record
    Status { job_id: Uuid },

    /// Show a data product as seen by a user
    View {
        data_product_id: Uuid,

        #[arg(long)]
        user: Uuid,
    },

    /// List the available tools
    Tools,

    /// Validate configuration
    Validate,

    /// Generate a sample configuration file
    GenerateConfig {
        /// Output path for configuration file
        #[arg(short, long, default_value = "config.yaml")]
        output: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindArg {
    Raster,
    PointCloud,
}

impl From<KindArg> for ProductKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Raster => ProductKind::Raster,
            KindArg::PointCloud => ProductKind::PointCloud,
        }
    }
}

/// `key=value`, where the value is JSON when it parses as JSON and a string otherwise.
fn parse_param(s: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", s));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn infer_kind(path: &Path) -> ProductKind {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_ascii_lowercase()) {
        Some(ext) if ext == "las" || ext == "laz" => ProductKind::PointCloud,
        _ => ProductKind::Raster,
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::RunTasks { file } => {
            run_tasks_command(&cli.config, cli.concurrency, &file)?;
        }

        Commands::Upload { file, kind, flight, user } => {
            let kind = kind.map(ProductKind::from).unwrap_or_else(|| infer_kind(&file));
            upload_command(&cli.config, &file, kind, flight, user)?;
        }

        Commands::Tool { name, input, output, params, flight, user } => {
            tool_command(&cli.config, &name, input, output, params.into_iter().collect(), flight, user)?;
        }

        Commands::Preview { file, raster, retry } => {
            preview_command(&cli.config, &file, raster, retry)?;
        }

        Commands::Status { job_id } => {
            status_command(&cli.config, job_id)?;
        }

        Commands::View { data_product_id, user } => {
            view_command(&cli.config, data_product_id, user)?;
        }

        Commands::Tools => {
            for tool in Tool::ALL {
                println!("{:<6} {} (bands: {})", tool.name(), tool.description(), tool.band_params().join(", "));
            }
        }

        Commands::Validate => {
            validate_command(&cli.config)?;
        }

        Commands::GenerateConfig { output } => {
            generate_config_command(output)?;
        }
    }

    Ok(())
}

fn load_config(config_path: &PathBuf) -> Result<Config> {
    let config = Config::from_file(config_path)?;
    config.validate()?;
    Ok(config)
}

fn run_tasks_command(config_path: &PathBuf, concurrency: Option<usize>, file: &Path) -> Result<()> {
    let mut config = Config::from_file(config_path)?;

    // Apply overrides
    if let Some(c) = concurrency {
        config.worker.concurrency = c;
    }

    config.validate()?;

    let text = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let tasks = Task::parse_lines(&text)?;
    tracing::info!("Loaded {} tasks from {}", tasks.len(), file.display());

    // Initialize Rayon
    init_rayon(config.worker.rayon_threads)?;

    let store = open_store(&config.storage)?;

    // Build and run Tokio runtime
    let runtime = build_runtime(config.worker.worker_threads)?;
    let stats = runtime.block_on(async { run_tasks(&config, store, tasks).await })?;

    println!("{}", stats);
    Ok(())
}

/// Copy `file` into a fresh directory under the upload root.
fn stage_upload(upload_root: &Path, flight_id: Uuid, file: &Path) -> Result<(PathBuf, String)> {
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("{} has no file name", file.display()))?;

    let dir = upload_root.join(flight_id.to_string()).join(Uuid::new_v4().to_string());
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let staged = dir.join(&filename);
    std::fs::copy(file, &staged).with_context(|| format!("Failed to copy {}", file.display()))?;
    Ok((staged, filename))
}

fn print_outcome(pipeline: &Pipeline, outcome: TaskOutcome, job_id: Option<Uuid>) -> Result<()> {
    println!("Outcome: {:?}", outcome);
    if let Some(job) = job_id.map(|id| pipeline.jobs().get(id)).transpose()?.flatten() {
        println!("{}", serde_json::to_string_pretty(&job)?);
    }
    Ok(())
}

fn upload_command(
    config_path: &PathBuf,
    file: &Path,
    kind: ProductKind,
    flight: Option<Uuid>,
    user: Option<Uuid>,
) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config.storage)?;
    let flight_id = flight.unwrap_or_else(Uuid::new_v4);

    let (file_path, original_filename) = stage_upload(&config.storage.upload_dir, flight_id, file)?;
    let product = store.create_data_product(NewDataProduct {
        flight_id,
        data_type: kind.data_type().to_string(),
        filepath: file_path.clone(),
        original_filename: original_filename.clone(),
    })?;

    let pipeline = Pipeline::from_config(&config, store, Arc::new(TracingSink));
    let job = pipeline.jobs().create(product.id, kind.job_name())?;
    println!("Data product {} (job {})", product.id, job.id);

    let task = UploadTask {
        kind,
        original_filename,
        file_path,
        user_id: user.unwrap_or_else(Uuid::new_v4),
        project_id: Uuid::nil(),
        flight_id,
        job_id: job.id,
        data_product_id: product.id,
    };
    let outcome = pipeline.process_upload(&task);
    print_outcome(&pipeline, outcome, Some(job.id))
}

fn tool_command(
    config_path: &PathBuf,
    name: &str,
    input: PathBuf,
    output: PathBuf,
    params: ToolParams,
    flight: Option<Uuid>,
    user: Option<Uuid>,
) -> Result<()> {
    let config = load_config(config_path)?;
    init_rayon(config.worker.rayon_threads)?;
    let store = open_store(&config.storage)?;

    let product = store.create_data_product(NewDataProduct {
        flight_id: flight.unwrap_or_else(Uuid::new_v4),
        data_type: name.to_string(),
        filepath: output.clone(),
        original_filename: output
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    })?;
    println!("Data product {}", product.id);

    let pipeline = Pipeline::from_config(&config, store.clone(), Arc::new(TracingSink));
    let task = ToolTask {
        tool_name: name.to_string(),
        input_path: input,
        output_path: output,
        params,
        new_data_product_id: product.id,
        user_id: user.unwrap_or_else(Uuid::new_v4),
    };
    let outcome = pipeline.run_tool(&task);
    let job_id = store.find_job_for_data_product(product.id)?.map(|job| job.id);
    print_outcome(&pipeline, outcome, job_id)
}

fn preview_command(config_path: &PathBuf, file: &Path, raster: bool, retry: bool) -> Result<()> {
    let config = load_config(config_path)?;

    if retry && PreviewGenerator::clear_marker(file)? {
        println!("Cleared earlier failure marker");
    }

    if raster {
        let generator = PreviewGenerator::new(Arc::new(RasterPreviewRenderer), config.preview.max_size);
        match generator.generate(file)? {
            PreviewOutcome::Rendered(path) => println!("Preview written to {}", path.display()),
            PreviewOutcome::Skipped(marker) => println!("Skipped, marker at {}", marker.display()),
        }
        return Ok(());
    }

    // Point clouds go through the pipeline so the outcome is reported as events
    let pipeline = Pipeline::from_config(&config, open_store(&config.storage)?, Arc::new(TracingSink));
    let outcome = pipeline.generate_preview(&PreviewTask { file_path: file.to_path_buf() });
    println!("Outcome: {:?}", outcome);
    Ok(())
}

fn status_command(config_path: &PathBuf, job_id: Uuid) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config.storage)?;
    match store.get_job(job_id)? {
        Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
        None => anyhow::bail!("Job {} not found", job_id),
    }
    Ok(())
}

fn view_command(config_path: &PathBuf, data_product_id: Uuid, user: Uuid) -> Result<()> {
    let config = load_config(config_path)?;
    let store = open_store(&config.storage)?;
    match data_product_view(store.as_ref(), data_product_id, user, &config.storage)? {
        Some(view) => println!("{}", serde_json::to_string_pretty(&view)?),
        None => anyhow::bail!("Data product {} not found", data_product_id),
    }
    Ok(())
}

fn validate_command(config_path: &PathBuf) -> Result<()> {
    load_config(config_path)?;
    println!("Configuration is valid");
    Ok(())
}

fn generate_config_command(output: PathBuf) -> Result<()> {
    // Generate a commented YAML config
    let yaml = r#"# Geospatial data product pipeline configuration

# === STORAGE: Where uploads live and how they are served ===
storage:
  # Root directory; every upload gets its own child directory
  upload_dir: "/data/uploads"

  # URL prefix that maps onto upload_dir
  static_url: "/static"

  # SQLite database holding jobs, data products and styles
  # Omit to keep records in memory (testing only)
  database_path: "/data/geoproduct.db"

# === CONVERSION: COG and COPC output ===
conversion:
  # Lossless COG compression: DEFLATE, LZW, ZSTD or NONE
  compression: "DEFLATE"

  # COG tile size in pixels (multiple of 16)
  block_size: 512

  # Overview resampling passed to the GDAL COG driver
  overview_resampling: "NEAREST"

  # untwine executable used to build COPC files
  untwine_path: "untwine"

# === PREVIEW: PNG previews ===
preview:
  # Longest side of a preview in pixels
  max_size: 512

  # pdal executable used to rasterize point clouds
  pdal_path: "pdal"

# === PIPELINE: Persistence retries ===
pipeline:
  persistence_retry:
    max_retries: 3
    initial_backoff_ms: 100
    max_backoff_ms: 10000

# === WORKER: Task execution ===
worker:
  # Tasks processed concurrently
  concurrency: 4

  # Tokio worker threads (null = num CPUs)
  # worker_threads: 8

  # Rayon thread pool size for band math (null = num CPUs)
  # rayon_threads: 8

  # Log progress while a batch runs
  enable_metrics: true

  # Seconds between progress reports
  metrics_interval_secs: 30

  # Save a metrics JSON after each batch
  # metrics_output_path: "/data/metrics.json"
"#;

    std::fs::write(&output, yaml)?;
    println!("Generated sample configuration at: {}", output.display());

    Ok(())
}
