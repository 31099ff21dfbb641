//! Metadata bundles extracted during conversion (STAC-style properties).

use serde::{Deserialize, Serialize};

/// Format-specific metadata stored on a data product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProductProperties {
    Raster(RasterProperties),
    PointCloud(PointCloudProperties),
}

impl ProductProperties {
    pub fn as_raster(&self) -> Option<&RasterProperties> {
        match self {
            ProductProperties::Raster(r) => Some(r),
            ProductProperties::PointCloud(_) => None,
        }
    }

    pub fn as_point_cloud(&self) -> Option<&PointCloudProperties> {
        match self {
            ProductProperties::PointCloud(p) => Some(p),
            ProductProperties::Raster(_) => None,
        }
    }
}

/// Per-band statistics and encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandInfo {
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodata: Option<f64>,
    pub stats: BandStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BandStats {
    pub minimum: f64,
    pub maximum: f64,
    pub mean: f64,
    pub stddev: f64,
}

/// Raster acquisition characteristics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterProperties {
    #[serde(rename = "proj:epsg", default, skip_serializing_if = "Option::is_none")]
    pub epsg: Option<u32>,

    #[serde(rename = "proj:wkt2", default, skip_serializing_if = "Option::is_none")]
    pub wkt: Option<String>,

    /// `[rows, cols]`
    #[serde(rename = "proj:shape")]
    pub shape: [usize; 2],

    /// GDAL-ordered affine: `[origin_x, pixel_w, rot, origin_y, rot, pixel_h]`
    #[serde(rename = "proj:transform")]
    pub transform: [f64; 6],

    /// WGS84 footprint `[west, south, east, north]`, when the CRS is known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bbox: Option<[f64; 4]>,

    #[serde(rename = "raster:bands")]
    pub bands: Vec<BandInfo>,

    pub driver: String,
}

impl RasterProperties {
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// Ground sample distance along x in CRS units.
    pub fn resolution(&self) -> (f64, f64) {
        (self.transform[1].abs(), self.transform[5].abs())
    }
}

/// Point-cloud header summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointCloudProperties {
    /// e.g. `"1.4"`
    pub las_version: String,
    pub point_format: u8,
    pub point_count: u64,
    /// `[min_x, min_y, min_z, max_x, max_y, max_z]` in native coordinates
    pub bounds: [f64; 6],
    pub scale: [f64; 3],
    pub offset: [f64; 3],
    pub compressed: bool,
    pub copc: bool,
}

impl PointCloudProperties {
    pub fn extent_xy(&self) -> (f64, f64) {
        (self.bounds[3] - self.bounds[0], self.bounds[4] - self.bounds[1])
    }
}
