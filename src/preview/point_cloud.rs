//! Point-cloud previews: rasterize the highest return per cell with PDAL,
//! then draw that surface like any other raster.

use super::raster::RasterPreviewRenderer;
use super::{PreviewError, PreviewRenderer};
use crate::config::PreviewConfig;
use crate::convert::las::LasHeader;
use crate::convert::upload_dir;
use crate::tools::{CommandRunner, SystemCommandRunner};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SURFACE_NODATA: f64 = -9999.0;
const STDERR_TAIL_LINES: usize = 20;

pub struct PointCloudPreviewRenderer {
    pdal_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    raster: RasterPreviewRenderer,
}

impl PointCloudPreviewRenderer {
    pub fn new(pdal_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            pdal_path: pdal_path.into(),
            runner,
            raster: RasterPreviewRenderer,
        }
    }

    pub fn from_config(config: &PreviewConfig) -> Self {
        Self::new(config.pdal_path.clone(), Arc::new(SystemCommandRunner))
    }

    fn tool_name(&self) -> String {
        self.pdal_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "pdal".to_string())
    }
}

/// Cell size that makes the longer side of the extent `max_size` cells.
fn surface_resolution(extent: (f64, f64), max_size: usize) -> Option<f64> {
    let longest = extent.0.max(extent.1);
    let resolution = longest / max_size.max(1) as f64;
    (resolution.is_finite() && resolution > 0.0).then_some(resolution)
}

fn translate_args(input: &Path, surface: &Path, resolution: f64) -> Vec<OsString> {
    vec![
        "translate".into(),
        input.as_os_str().to_owned(),
        surface.as_os_str().to_owned(),
        "--writer".into(),
        "writers.gdal".into(),
        format!("--writers.gdal.resolution={}", resolution).into(),
        "--writers.gdal.output_type=max".into(),
        "--writers.gdal.gdaldriver=GTiff".into(),
        format!("--writers.gdal.nodata={}", SURFACE_NODATA).into(),
    ]
}

impl PreviewRenderer for PointCloudPreviewRenderer {
    fn render(&self, input: &Path, output: &Path, max_size: usize) -> Result<(), PreviewError> {
        let header = LasHeader::read_from_path(input).map_err(|e| PreviewError::Unreadable {
            path: input.to_path_buf(),
            reason: e.to_string(),
        })?;

        let resolution = surface_resolution(header.properties().extent_xy(), max_size).ok_or_else(|| {
            PreviewError::Render {
                path: input.to_path_buf(),
                reason: "point cloud has an empty horizontal extent".to_string(),
            }
        })?;

        let dir = upload_dir(input);
        let work = tempfile::Builder::new()
            .prefix(".preview-")
            .tempdir_in(&dir)
            .map_err(|source| PreviewError::Write { path: dir.clone(), source })?;
        let surface = work.path().join("surface.tif");

        let tool = self.tool_name();
        let result = self
            .runner
            .run(&self.pdal_path, &translate_args(input, &surface, resolution))
            .map_err(|source| PreviewError::ToolLaunch { tool: tool.clone(), source })?;

        if !result.success() {
            return Err(PreviewError::ToolFailed {
                tool,
                exit_code: result.exit_code,
                stderr: result.stderr_tail(STDERR_TAIL_LINES),
            });
        }
        if !surface.exists() {
            return Err(PreviewError::Render {
                path: input.to_path_buf(),
                reason: format!("{} did not write a surface raster", tool),
            });
        }

        self.raster.render(&surface, output, max_size)
    }
}
