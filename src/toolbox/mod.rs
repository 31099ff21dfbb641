//! Named raster tools.
//!
//! A tool reads bands from an input raster, computes a single-band `f32`
//! index, and writes it as a COG at the requested output path together with
//! a default single-band style. The input raster is only ever read.

mod algorithms;

pub use algorithms::{exg, ndvi, vari, NODATA};

use crate::config::ConversionConfig;
use crate::convert::raster::open_raster;
use crate::convert::{output_stem, upload_dir, ConvertError, Converter, RasterConverter};
use crate::model::{ProductProperties, RasterProperties, StyleSettings};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Tool parameters as received in a task.
pub type ToolParams = BTreeMap<String, serde_json::Value>;

/// The fixed tool registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tool {
    Ndvi,
    Exg,
    Vari,
}

impl Tool {
    pub const ALL: [Tool; 3] = [Tool::Ndvi, Tool::Exg, Tool::Vari];

    pub fn name(&self) -> &'static str {
        match self {
            Tool::Ndvi => "ndvi",
            Tool::Exg => "exg",
            Tool::Vari => "vari",
        }
    }

    pub fn from_name(name: &str) -> Option<Tool> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Band parameters the tool needs, in the order the algorithm takes them.
    pub fn band_params(&self) -> &'static [&'static str] {
        match self {
            Tool::Ndvi => &["red_band", "nir_band"],
            Tool::Exg | Tool::Vari => &["red_band", "green_band", "blue_band"],
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Tool::Ndvi => "Normalized Difference Vegetation Index",
            Tool::Exg => "Excess Green Index",
            Tool::Vari => "Visible Atmospherically Resistant Index",
        }
    }

    /// Name of the job created for a run of this tool.
    pub fn job_name(tool_name: &str) -> String {
        format!("{}-process", tool_name)
    }
}

impl std::fmt::Display for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolboxError {
    #[error("unsupported tool '{0}'")]
    UnsupportedTool(String),

    #[error("invalid parameters for {tool}: {reason}")]
    InvalidParameters { tool: String, reason: String },

    #[error("{tool} failed: {reason}")]
    Execution { tool: String, reason: String },

    #[error("failed to normalize tool output: {0}")]
    Conversion(#[from] ConvertError),
}

/// Result of a successful tool run.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutput {
    pub path: PathBuf,
    pub properties: RasterProperties,
    pub style: StyleSettings,
}

impl ToolOutput {
    pub fn product_properties(&self) -> ProductProperties {
        ProductProperties::Raster(self.properties.clone())
    }
}

/// Runs a named tool.
pub trait ToolRunner: Send + Sync {
    fn run(
        &self,
        tool_name: &str,
        input: &Path,
        output: &Path,
        params: &ToolParams,
    ) -> Result<ToolOutput, ToolboxError>;
}

/// Validate band parameters against the registry and the input band count.
///
/// Returns the 1-based band indices in [`Tool::band_params`] order.
pub fn resolve_bands(tool: Tool, params: &ToolParams, band_count: usize) -> Result<Vec<usize>, ToolboxError> {
    let invalid = |reason: String| ToolboxError::InvalidParameters {
        tool: tool.name().to_string(),
        reason,
    };

    let mut bands = Vec::with_capacity(tool.band_params().len());
    for &name in tool.band_params() {
        let value = params
            .get(name)
            .ok_or_else(|| invalid(format!("missing '{}'", name)))?;
        let index = value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
            .ok_or_else(|| invalid(format!("'{}' must be a positive integer, got {}", name, value)))?;
        let index = index as usize;
        if index == 0 || index > band_count {
            return Err(invalid(format!(
                "'{}' = {} is outside bands 1..={}",
                name, index, band_count
            )));
        }
        if bands.contains(&index) {
            return Err(invalid(format!("band {} is used more than once", index)));
        }
        bands.push(index);
    }
    Ok(bands)
}

/// Reject an output path that names the input raster.
pub fn check_output_path(tool_name: &str, input: &Path, output: &Path) -> Result<(), ToolboxError> {
    if resolve(input) == resolve(output) {
        return Err(ToolboxError::InvalidParameters {
            tool: tool_name.to_string(),
            reason: format!("output {} is the input raster", output.display()),
        });
    }
    Ok(())
}

fn resolve(path: &Path) -> PathBuf {
    if let Ok(resolved) = path.canonicalize() {
        return resolved;
    }
    // Outputs usually do not exist yet
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) => parent
            .canonicalize()
            .map(|p| p.join(name))
            .unwrap_or_else(|_| path.to_path_buf()),
        _ => path.to_path_buf(),
    }
}

/// The built-in tool implementation backed by GDAL.
#[derive(Debug, Clone, Default)]
pub struct Toolbox {
    converter: RasterConverter,
}

impl Toolbox {
    pub fn new(converter: RasterConverter) -> Self {
        Self { converter }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(RasterConverter::from_config(config))
    }

    fn compute(&self, tool: Tool, dataset: &Dataset, bands: &[usize]) -> gdal::errors::Result<Array2<f32>> {
        let arrays = bands
            .iter()
            .map(|&index| read_masked(dataset, index))
            .collect::<gdal::errors::Result<Vec<_>>>()?;

        Ok(match tool {
            Tool::Ndvi => ndvi(arrays[0].view(), arrays[1].view()),
            Tool::Exg => exg(arrays[0].view(), arrays[1].view(), arrays[2].view()),
            Tool::Vari => vari(arrays[0].view(), arrays[1].view(), arrays[2].view()),
        })
    }
}

impl ToolRunner for Toolbox {
    fn run(
        &self,
        tool_name: &str,
        input: &Path,
        output: &Path,
        params: &ToolParams,
    ) -> Result<ToolOutput, ToolboxError> {
        let tool = Tool::from_name(tool_name)
            .ok_or_else(|| ToolboxError::UnsupportedTool(tool_name.to_string()))?;
        check_output_path(tool_name, input, output)?;
        let execution = |reason: String| ToolboxError::Execution {
            tool: tool.name().to_string(),
            reason,
        };
        let start = Instant::now();

        let dataset = open_raster(input).map_err(|e| execution(e.to_string()))?;
        let bands = resolve_bands(tool, params, dataset.raster_count() as usize)?;
        let result = self
            .compute(tool, &dataset, &bands)
            .map_err(|e| execution(format!("reading {}: {}", input.display(), e)))?;

        let out_dir = upload_dir(output);
        std::fs::create_dir_all(&out_dir)
            .map_err(|e| execution(format!("creating {}: {}", out_dir.display(), e)))?;
        let work = tempfile::Builder::new()
            .prefix(".tool-")
            .tempdir_in(&out_dir)
            .map_err(|e| execution(format!("creating work dir in {}: {}", out_dir.display(), e)))?;

        let staged = work.path().join(format!("{}.tif", output_stem(output)));
        write_index(&staged, &dataset, &result)
            .map_err(|e| execution(format!("writing {}: {}", staged.display(), e)))?;
        drop(dataset);

        let product = self.converter.convert(&staged)?;
        std::fs::rename(&product.path, output)
            .map_err(|e| execution(format!("moving result to {}: {}", output.display(), e)))?;

        let properties = match product.properties {
            ProductProperties::Raster(props) => props,
            ProductProperties::PointCloud(_) => {
                return Err(execution("tool output is not a raster".to_string()));
            }
        };
        let style = properties
            .bands
            .first()
            .map(|band| StyleSettings::from_stats(&band.stats))
            .unwrap_or_else(|| StyleSettings::single_band(-1.0, 1.0));

        tracing::info!(
            "{} on {} -> {} in {:.1}s",
            tool,
            input.display(),
            output.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(ToolOutput {
            path: output.to_path_buf(),
            properties,
            style,
        })
    }
}

/// Read a band as `f64` with nodata replaced by NaN.
fn read_masked(dataset: &Dataset, index: usize) -> gdal::errors::Result<Array2<f64>> {
    let (width, height) = dataset.raster_size();
    let band = dataset.rasterband(index)?;
    let nodata = band.no_data_value();
    let buffer = band.read_as::<f64>((0, 0), (width, height), (width, height), None)?;

    let values: Vec<f64> = buffer
        .data()
        .iter()
        .map(|&v| if nodata == Some(v) { f64::NAN } else { v })
        .collect();
    Array2::from_shape_vec((height, width), values)
        .map_err(|e| gdal::errors::GdalError::BadArgument(e.to_string()))
}

/// Write a single-band `f32` GeoTIFF georeferenced like `like`.
fn write_index(path: &Path, like: &Dataset, data: &Array2<f32>) -> gdal::errors::Result<()> {
    let (height, width) = data.dim();
    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut dataset = driver.create_with_band_type::<f32, _>(path, width, height, 1)?;

    if let Ok(transform) = like.geo_transform() {
        dataset.set_geo_transform(&transform)?;
    }
    if let Ok(srs) = like.spatial_ref() {
        dataset.set_spatial_ref(&srs)?;
    }

    let mut band = dataset.rasterband(1)?;
    band.set_no_data_value(Some(NODATA as f64))?;
    let values: Vec<f32> = data.iter().copied().collect();
    band.write((0, 0), (width, height), &mut Buffer::new((width, height), values))?;
    Ok(())
}
