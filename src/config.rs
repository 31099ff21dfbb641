//! Configuration for the processing pipeline.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Upload root, public URL and database location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Raster and point-cloud conversion settings
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Preview image settings
    #[serde(default)]
    pub preview: PreviewConfig,

    /// Orchestrator behaviour
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Task execution settings
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Where uploaded files live and how they are published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root directory containing every upload directory
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,

    /// URL prefix under which `upload_dir` is served
    #[serde(default = "default_static_url")]
    pub static_url: String,

    /// SQLite database file. In-memory store when unset.
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            static_url: default_static_url(),
            database_path: None,
        }
    }
}

/// Format conversion settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Lossless COG compression: DEFLATE, LZW, ZSTD or NONE
    #[serde(default = "default_compression")]
    pub compression: String,

    /// Internal COG tile size in pixels
    #[serde(default = "default_block_size")]
    pub block_size: usize,

    /// Resampling used to build COG overviews
    #[serde(default = "default_overview_resampling")]
    pub overview_resampling: String,

    /// Point-cloud indexing executable
    #[serde(default = "default_untwine_path")]
    pub untwine_path: PathBuf,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            compression: default_compression(),
            block_size: default_block_size(),
            overview_resampling: default_overview_resampling(),
            untwine_path: default_untwine_path(),
        }
    }
}

/// Preview image settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreviewConfig {
    /// Longest side of the preview in pixels
    #[serde(default = "default_preview_size")]
    pub max_size: usize,

    /// PDAL executable used to rasterize point clouds
    #[serde(default = "default_pdal_path")]
    pub pdal_path: PathBuf,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            max_size: default_preview_size(),
            pdal_path: default_pdal_path(),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Retry policy for persisting results after a successful conversion
    #[serde(default)]
    pub persistence_retry: RetryConfig,
}

/// Retry configuration for transient failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial backoff in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based), doubling each time.
    pub fn backoff(&self, attempt: usize) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32) as u32).unwrap_or(u64::MAX);
        let ms = self.initial_backoff_ms.saturating_mul(factor).min(self.max_backoff_ms);
        Duration::from_millis(ms)
    }
}

/// Task execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of tasks processed concurrently
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Number of Tokio worker threads
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Rayon thread pool size for band math
    #[serde(default)]
    pub rayon_threads: Option<usize>,

    /// Log progress and a metrics summary while a batch runs
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Seconds between progress reports
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,

    /// Optional path to save metrics JSON after a batch completes
    #[serde(default)]
    pub metrics_output_path: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            worker_threads: None,
            rayon_threads: None,
            enable_metrics: true,
            metrics_interval_secs: default_metrics_interval(),
            metrics_output_path: None,
        }
    }
}

const LOSSLESS_COMPRESSION: &[&str] = &["DEFLATE", "LZW", "ZSTD", "NONE"];

impl Config {
    /// Load configuration from a YAML or JSON file.
    /// Format is auto-detected from file extension (.yaml, .yml, or .json).
    pub fn from_file(path: &PathBuf) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let config: Config = match ext {
            "yaml" | "yml" => serde_yaml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => {
                // Try YAML first (it's a superset of JSON)
                serde_yaml::from_str(&contents)?
            }
        };
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        Ok(config)
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.static_url.trim().is_empty() {
            anyhow::bail!("static_url must not be empty");
        }

        let compression = self.conversion.compression.to_uppercase();
        if !LOSSLESS_COMPRESSION.contains(&compression.as_str()) {
            anyhow::bail!(
                "Compression '{}' is not lossless; expected one of {:?}",
                self.conversion.compression,
                LOSSLESS_COMPRESSION
            );
        }
        if self.conversion.block_size < 16 || self.conversion.block_size % 16 != 0 {
            anyhow::bail!("COG block size must be a positive multiple of 16");
        }
        if self.preview.max_size == 0 || self.preview.max_size > 4096 {
            anyhow::bail!("Preview size must be 1-4096 pixels");
        }
        if self.worker.concurrency == 0 {
            anyhow::bail!("Concurrency must be > 0");
        }
        if self.worker.enable_metrics && self.worker.metrics_interval_secs == 0 {
            anyhow::bail!("metrics_interval_secs must be > 0 when metrics are enabled");
        }
        let retry = &self.pipeline.persistence_retry;
        if retry.max_backoff_ms < retry.initial_backoff_ms {
            anyhow::bail!("max_backoff_ms must be >= initial_backoff_ms");
        }
        Ok(())
    }
}

// Default value functions for serde
fn default_upload_dir() -> PathBuf { PathBuf::from("/data/uploads") }
fn default_static_url() -> String { "/static".to_string() }
fn default_compression() -> String { "DEFLATE".to_string() }
fn default_block_size() -> usize { 512 }
fn default_overview_resampling() -> String { "NEAREST".to_string() }
fn default_untwine_path() -> PathBuf { PathBuf::from("untwine") }
fn default_pdal_path() -> PathBuf { PathBuf::from("pdal") }
fn default_preview_size() -> usize { 512 }
fn default_concurrency() -> usize { 4 }
fn default_true() -> bool { true }
fn default_metrics_interval() -> u64 { 30 }
fn default_max_retries() -> usize { 3 }
fn default_initial_backoff_ms() -> u64 { 100 }
fn default_max_backoff_ms() -> u64 { 10000 }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.conversion.compression, "DEFLATE");
        assert_eq!(config.preview.max_size, 512);
        assert_eq!(config.worker.concurrency, 4);
        assert!(config.storage.database_path.is_none());
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config = Config::from_yaml(
            r#"
storage:
  upload_dir: /srv/uploads
  database_path: /srv/pipeline.sqlite
worker:
  concurrency: 8
"#,
        )
        .unwrap();
        assert_eq!(config.storage.upload_dir, PathBuf::from("/srv/uploads"));
        assert_eq!(config.storage.static_url, "/static");
        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.conversion.block_size, 512);
        assert_eq!(config.pipeline.persistence_retry.max_retries, 3);
    }

    #[test]
    fn test_json_config() {
        let config = Config::from_json(r#"{"conversion": {"compression": "zstd"}}"#).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation_invalid() {
        let mut config = Config::default();
        config.conversion.compression = "JPEG".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.conversion.block_size = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.worker.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.preview.max_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip() {
        let config = Config::default();
        let yaml = config.to_yaml().unwrap();
        let back = Config::from_yaml(&yaml).unwrap();
        assert_eq!(back.storage.upload_dir, config.storage.upload_dir);
    }

    #[test]
    fn test_retry_backoff() {
        let retry = RetryConfig::default();
        assert_eq!(retry.backoff(0), Duration::from_millis(100));
        assert_eq!(retry.backoff(1), Duration::from_millis(200));
        assert_eq!(retry.backoff(3), Duration::from_millis(800));
        assert_eq!(retry.backoff(20), Duration::from_millis(10000));
        assert_eq!(RetryConfig::none().backoff(5), Duration::ZERO);
    }
}
