//! Coordinate Reference System utilities.
//!
//! Raster metadata carries the native footprint of a product plus, when the
//! CRS has an EPSG code, a WGS84 bounding box for catalog search.
//!
//! ## Coordinate order convention:
//!
//! - Bounds arrays: `[min_x, min_y, max_x, max_y]` = `[west, south, east, north]`
//! - For WGS84: `[min_lon, min_lat, max_lon, max_lat]`
//! - Geotransforms follow GDAL: `[origin_x, pixel_w, row_rot, origin_y, col_rot, pixel_h]`

/// Common CRS codes used throughout the pipeline.
pub mod codes {
    /// WGS84 geographic coordinate system (lon/lat in degrees).
    pub const WGS84: &str = "EPSG:4326";

    /// EPSG number of WGS84.
    pub const WGS84_EPSG: u32 = 4326;
}

use anyhow::{Context, Result};
use proj::Proj;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

/// Bounds in a specific CRS: [min_x, min_y, max_x, max_y]
pub type Bounds = [f64; 4];

/// GDAL affine geotransform.
pub type GeoTransform = [f64; 6];

/// Edge samples used when projecting a footprint to WGS84.
const BBOX_EDGE_SAMPLES: usize = 21;

/// Cache for Proj transformations.
///
/// Creating Proj objects is expensive, so we cache them by (source, target) CRS pair.
/// Proj handles cannot leave their thread; keep one cache per thread.
#[derive(Default)]
pub struct ProjCache {
    cache: RefCell<HashMap<(String, String), Rc<Proj>>>,
}

thread_local! {
    static THREAD_CACHE: ProjCache = ProjCache::new();
}

impl ProjCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with the calling thread's cache.
    pub fn with_thread_cache<T>(f: impl FnOnce(&ProjCache) -> T) -> T {
        THREAD_CACHE.with(f)
    }

    /// Get or create a Proj transformation between two CRS.
    pub fn get(&self, from_crs: &str, to_crs: &str) -> Result<Rc<Proj>> {
        let key = (from_crs.to_string(), to_crs.to_string());

        if let Some(proj) = self.cache.borrow().get(&key) {
            return Ok(proj.clone());
        }

        let proj = Proj::new_known_crs(from_crs, to_crs, None)
            .with_context(|| format!("Failed to create projection from {} to {}", from_crs, to_crs))?;

        let proj = Rc::new(proj);
        self.cache.borrow_mut().insert(key, proj.clone());

        Ok(proj)
    }

    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Format an EPSG number as a PROJ authority string.
pub fn epsg_code(epsg: u32) -> String {
    format!("EPSG:{}", epsg)
}

/// Native footprint of a raster from its geotransform and `(cols, rows)` size.
///
/// All four corners are pushed through the affine transform, so rotated and
/// south-up rasters still produce ordered bounds.
pub fn geotransform_bounds(gt: &GeoTransform, size: (usize, usize)) -> Bounds {
    let (cols, rows) = (size.0 as f64, size.1 as f64);
    let corner = |px: f64, py: f64| (gt[0] + px * gt[1] + py * gt[2], gt[3] + px * gt[4] + py * gt[5]);

    let corners = [corner(0.0, 0.0), corner(cols, 0.0), corner(cols, rows), corner(0.0, rows)];

    let mut bounds = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    for (x, y) in corners {
        bounds[0] = bounds[0].min(x);
        bounds[1] = bounds[1].min(y);
        bounds[2] = bounds[2].max(x);
        bounds[3] = bounds[3].max(y);
    }
    bounds
}

/// Transform bounds with edge sampling for better accuracy.
///
/// Samples points along edges to handle non-linear projections. Points
/// that fail to project are skipped; an error is returned only if none do.
pub fn transform_bounds_with_densification(
    bounds: &Bounds,
    from_crs: &str,
    to_crs: &str,
    cache: &ProjCache,
    n_samples: usize,
) -> Result<Bounds> {
    if from_crs == to_crs {
        return Ok(*bounds);
    }

    let proj = cache.get(from_crs, to_crs)?;
    let n_samples = n_samples.max(1);

    let mut out = [f64::MAX, f64::MAX, f64::MIN, f64::MIN];
    let mut projected = 0usize;

    for i in 0..=n_samples {
        let t = i as f64 / n_samples as f64;
        let x = bounds[0] + t * (bounds[2] - bounds[0]);
        let y = bounds[1] + t * (bounds[3] - bounds[1]);

        for point in [(x, bounds[1]), (x, bounds[3]), (bounds[0], y), (bounds[2], y)] {
            if let Ok((tx, ty)) = proj.convert(point) {
                extend(&mut out, tx, ty);
                projected += 1;
            }
        }
    }

    if projected == 0 {
        anyhow::bail!("No edge point of {:?} could be projected from {} to {}", bounds, from_crs, to_crs);
    }
    Ok(out)
}

/// WGS84 bounding box of a raster footprint in the CRS `EPSG:<epsg>`.
pub fn wgs84_bbox(native: &Bounds, epsg: u32, cache: &ProjCache) -> Result<Bounds> {
    transform_bounds_with_densification(
        native,
        &epsg_code(epsg),
        codes::WGS84,
        cache,
        BBOX_EDGE_SAMPLES,
    )
}

fn extend(bounds: &mut Bounds, x: f64, y: f64) {
    bounds[0] = bounds[0].min(x);
    bounds[1] = bounds[1].min(y);
    bounds[2] = bounds[2].max(x);
    bounds[3] = bounds[3].max(y);
}
