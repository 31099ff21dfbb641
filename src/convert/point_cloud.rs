//! Point-cloud normalization to COPC through an external indexing tool.

use super::las::{LasError, LasHeader};
use super::{
    copc_output_path, move_into_place, output_stem, work_dir, ConvertError, ConvertedProduct,
    Converter, COPC_SUFFIX,
};
use crate::config::ConversionConfig;
use crate::model::ProductProperties;
use crate::tools::{CommandRunner, SystemCommandRunner};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

const STDERR_TAIL_LINES: usize = 20;

/// Converts LAS/LAZ files to COPC with `untwine`.
pub struct PointCloudConverter {
    untwine_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
}

impl PointCloudConverter {
    pub fn new(untwine_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            untwine_path: untwine_path.into(),
            runner,
        }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(config.untwine_path.clone(), Arc::new(SystemCommandRunner))
    }

    fn tool_name(&self) -> String {
        self.untwine_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "untwine".to_string())
    }

    fn read_header(path: &Path) -> Result<LasHeader, ConvertError> {
        LasHeader::read_from_path(path).map_err(|e| match e {
            LasError::NotLas | LasError::UnsupportedVersion(..) | LasError::BadHeaderSize(_) => {
                ConvertError::Unsupported {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                }
            }
            LasError::Io(err) => ConvertError::Unreadable {
                path: path.to_path_buf(),
                reason: err.to_string(),
            },
        })
    }

    /// Run the indexing tool and return the header of what it produced.
    fn index(&self, input: &Path, output: &Path) -> Result<LasHeader, ConvertError> {
        let args: Vec<OsString> = vec![
            "--single_file".into(),
            "-i".into(),
            input.as_os_str().to_owned(),
            "-o".into(),
            output.as_os_str().to_owned(),
        ];

        let result = self.runner.run(&self.untwine_path, &args);
        remove_tool_scratch(output);

        let tool = self.tool_name();
        let output_info = result.map_err(|source| ConvertError::ToolLaunch {
            tool: tool.clone(),
            source,
        })?;

        if !output_info.success() {
            return Err(ConvertError::ToolFailed {
                tool,
                exit_code: output_info.exit_code,
                stderr: output_info.stderr_tail(STDERR_TAIL_LINES),
            });
        }

        let produced = std::fs::metadata(output).map(|m| m.len() > 0).unwrap_or(false);
        if !produced {
            return Err(ConvertError::MissingOutput {
                tool,
                path: output.to_path_buf(),
            });
        }

        LasHeader::read_from_path(output).map_err(|e| ConvertError::Encode {
            path: output.to_path_buf(),
            reason: format!("{} produced an unreadable file: {}", tool, e),
        })
    }
}

impl Converter for PointCloudConverter {
    fn convert(&self, input: &Path) -> Result<ConvertedProduct, ConvertError> {
        let header = Self::read_header(input)?;

        if header.is_copc() {
            tracing::info!("{} is already COPC, skipping indexing", input.display());
            return Ok(ConvertedProduct {
                path: input.to_path_buf(),
                properties: ProductProperties::PointCloud(header.properties()),
                passthrough: true,
            });
        }

        let start = Instant::now();
        let work = work_dir(input)?;
        let staged = work
            .path()
            .join(format!("{}{}", output_stem(input), COPC_SUFFIX));

        let produced = self.index(input, &staged)?;
        let final_path = copc_output_path(input);
        move_into_place(&staged, &final_path)?;

        tracing::info!(
            "Indexed {} points from {} into {} in {:.1}s",
            produced.point_count,
            input.display(),
            final_path.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(ConvertedProduct {
            path: final_path,
            properties: ProductProperties::PointCloud(produced.properties()),
            passthrough: false,
        })
    }
}

/// The indexing tool keeps scratch data in `<output>_tmp`.
fn remove_tool_scratch(output: &Path) {
    let mut scratch = output.as_os_str().to_owned();
    scratch.push("_tmp");
    let scratch = PathBuf::from(scratch);
    if scratch.exists() {
        if let Err(e) = std::fs::remove_dir_all(&scratch) {
            tracing::warn!("Failed to remove {}: {}", scratch.display(), e);
        }
    }
}
