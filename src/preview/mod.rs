//! Small PNG previews of uploaded products.
//!
//! Rendering is best effort. A failed render leaves a `preview_failed`
//! marker beside the input, and later requests are skipped until the marker
//! is cleared.

mod point_cloud;
mod raster;

pub use point_cloud::PointCloudPreviewRenderer;
pub use raster::{preview_size, RasterPreviewRenderer};

use crate::convert::{output_stem, upload_dir};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Marker file name written after a failed render.
pub const FAILURE_MARKER: &str = "preview_failed";

#[derive(Debug, thiserror::Error)]
pub enum PreviewError {
    #[error("cannot read {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("failed to launch {tool}: {source}")]
    ToolLaunch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} exited with status {}: {stderr}", .exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string()))]
    ToolFailed {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("failed to render {}: {reason}", .path.display())]
    Render { path: PathBuf, reason: String },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewOutcome {
    /// Preview written to this path.
    Rendered(PathBuf),
    /// Skipped because of the failure marker at this path.
    Skipped(PathBuf),
}

/// Draws a preview of `input` into `output`, longest side `max_size` pixels.
pub trait PreviewRenderer: Send + Sync {
    fn render(&self, input: &Path, output: &Path, max_size: usize) -> Result<(), PreviewError>;
}

/// Where the preview of `input` is written.
pub fn preview_path(input: &Path) -> PathBuf {
    upload_dir(input).join(format!("{}.png", output_stem(input)))
}

/// Where the failure marker for `input` lives.
pub fn marker_path(input: &Path) -> PathBuf {
    upload_dir(input).join(FAILURE_MARKER)
}

/// Renders previews through a [`PreviewRenderer`] and manages the failure marker.
pub struct PreviewGenerator {
    renderer: Arc<dyn PreviewRenderer>,
    max_size: usize,
}

impl PreviewGenerator {
    pub fn new(renderer: Arc<dyn PreviewRenderer>, max_size: usize) -> Self {
        Self { renderer, max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn generate(&self, input: &Path) -> Result<PreviewOutcome, PreviewError> {
        let marker = marker_path(input);
        if marker.exists() {
            tracing::debug!("Preview of {} skipped, marker present", input.display());
            return Ok(PreviewOutcome::Skipped(marker));
        }

        let output = preview_path(input);
        match self.render_atomically(input, &output) {
            Ok(()) => {
                tracing::debug!("Rendered preview {}", output.display());
                Ok(PreviewOutcome::Rendered(output))
            }
            Err(e) => {
                if let Err(write_err) = std::fs::write(&marker, e.to_string()) {
                    tracing::warn!("Failed to write {}: {}", marker.display(), write_err);
                }
                Err(e)
            }
        }
    }

    fn render_atomically(&self, input: &Path, output: &Path) -> Result<(), PreviewError> {
        let dir = upload_dir(input);
        let staged = tempfile::Builder::new()
            .prefix(".preview-")
            .suffix(".png")
            .tempfile_in(&dir)
            .map_err(|source| PreviewError::Write { path: dir.clone(), source })?;

        self.renderer.render(input, staged.path(), self.max_size)?;

        staged.persist(output).map_err(|e| PreviewError::Write {
            path: output.to_path_buf(),
            source: e.error,
        })?;
        Ok(())
    }

    /// Remove the failure marker so the next request renders again.
    ///
    /// Returns whether a marker was present.
    pub fn clear_marker(input: &Path) -> std::io::Result<bool> {
        match std::fs::remove_file(marker_path(input)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
