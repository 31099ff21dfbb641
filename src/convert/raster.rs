//! Raster normalization to Cloud-Optimized GeoTIFF using GDAL.

use super::{
    cog_output_path, move_into_place, output_stem, work_dir, ConvertError, ConvertedProduct,
    Converter, COG_SUFFIX,
};
use crate::config::ConversionConfig;
use crate::crs::{geotransform_bounds, wgs84_bbox, GeoTransform, ProjCache};
use crate::model::{BandInfo, BandStats, ProductProperties, RasterProperties};
use gdal::cpl::CslStringList;
use gdal::raster::RasterBand;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager, Metadata};
use std::path::Path;
use std::time::Instant;

/// Rows read per request when scanning a band for statistics.
const STATS_STRIP_ROWS: usize = 256;

const IDENTITY_TRANSFORM: GeoTransform = [0.0, 1.0, 0.0, 0.0, 0.0, 1.0];

/// COG creation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CogOptions {
    pub compression: String,
    pub block_size: usize,
    pub overview_resampling: String,
}

impl Default for CogOptions {
    fn default() -> Self {
        Self::from(&ConversionConfig::default())
    }
}

impl From<&ConversionConfig> for CogOptions {
    fn from(config: &ConversionConfig) -> Self {
        Self {
            compression: config.compression.to_uppercase(),
            block_size: config.block_size,
            overview_resampling: config.overview_resampling.to_uppercase(),
        }
    }
}

impl CogOptions {
    fn creation_options(&self) -> gdal::errors::Result<CslStringList> {
        let mut options = CslStringList::new();
        options.set_name_value("COMPRESS", &self.compression)?;
        options.set_name_value("BLOCKSIZE", &self.block_size.to_string())?;
        options.set_name_value("OVERVIEW_RESAMPLING", &self.overview_resampling)?;
        options.set_name_value("BIGTIFF", "IF_SAFER")?;
        if self.compression == "DEFLATE" || self.compression == "LZW" || self.compression == "ZSTD" {
            options.set_name_value("PREDICTOR", "YES")?;
        }
        Ok(options)
    }
}

/// Converts GDAL-readable rasters to COG.
#[derive(Debug, Clone, Default)]
pub struct RasterConverter {
    options: CogOptions,
}

impl RasterConverter {
    pub fn new(options: CogOptions) -> Self {
        Self { options }
    }

    pub fn from_config(config: &ConversionConfig) -> Self {
        Self::new(CogOptions::from(config))
    }

    /// Metadata of a raster without converting it.
    pub fn inspect(&self, path: &Path) -> Result<RasterProperties, ConvertError> {
        let dataset = open_raster(path)?;
        raster_properties(&dataset, path)
    }

    fn write_cog(&self, dataset: &Dataset, dest: &Path) -> Result<(), ConvertError> {
        let encode = |e: gdal::errors::GdalError| ConvertError::Encode {
            path: dest.to_path_buf(),
            reason: e.to_string(),
        };

        let driver = DriverManager::get_driver_by_name("COG").map_err(encode)?;
        let options = self.options.creation_options().map_err(encode)?;
        let output = dataset.create_copy(&driver, dest, &options).map_err(encode)?;
        // Closing the handle flushes the file
        drop(output);

        if !dest.exists() {
            return Err(ConvertError::Encode {
                path: dest.to_path_buf(),
                reason: "COG driver reported success but wrote nothing".to_string(),
            });
        }
        Ok(())
    }
}

impl Converter for RasterConverter {
    fn convert(&self, input: &Path) -> Result<ConvertedProduct, ConvertError> {
        let start = Instant::now();
        let dataset = open_raster(input)?;
        let properties = raster_properties(&dataset, input)?;

        if is_cog(&dataset) {
            tracing::info!("{} is already a COG, skipping re-encode", input.display());
            return Ok(ConvertedProduct {
                path: input.to_path_buf(),
                properties: ProductProperties::Raster(properties),
                passthrough: true,
            });
        }

        let work = work_dir(input)?;
        let staged = work.path().join(format!("{}{}", output_stem(input), COG_SUFFIX));
        self.write_cog(&dataset, &staged)?;
        drop(dataset);

        let final_path = cog_output_path(input);
        move_into_place(&staged, &final_path)?;

        tracing::info!(
            "Converted {} ({}x{}, {} bands) to {} in {:.1}s",
            input.display(),
            properties.shape[1],
            properties.shape[0],
            properties.band_count(),
            final_path.display(),
            start.elapsed().as_secs_f64()
        );

        Ok(ConvertedProduct {
            path: final_path,
            properties: ProductProperties::Raster(properties),
            passthrough: false,
        })
    }
}

/// Open a raster, classifying failures for the caller.
pub(crate) fn open_raster(path: &Path) -> Result<Dataset, ConvertError> {
    if !path.exists() {
        return Err(ConvertError::Unreadable {
            path: path.to_path_buf(),
            reason: "file does not exist".to_string(),
        });
    }
    let dataset = Dataset::open(path).map_err(|e| ConvertError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    if dataset.raster_count() as usize == 0 {
        return Err(ConvertError::Unsupported {
            path: path.to_path_buf(),
            reason: "dataset has no raster bands".to_string(),
        });
    }
    Ok(dataset)
}

/// True when `dataset` already has a cloud-optimized layout.
///
/// GDAL reports `LAYOUT=COG` for files written by its COG driver. Other
/// tiled GeoTIFFs qualify when they fit in a single tile or carry internal
/// overviews.
pub fn is_cog(dataset: &Dataset) -> bool {
    if dataset
        .metadata_item("LAYOUT", "IMAGE_STRUCTURE")
        .is_some_and(|layout| layout.eq_ignore_ascii_case("COG"))
    {
        return true;
    }

    if dataset.driver().short_name() != "GTiff" {
        return false;
    }

    let Ok(band) = dataset.rasterband(1) else {
        return false;
    };
    let (block_w, block_h) = band.block_size();
    let (width, height) = dataset.raster_size();

    // Strips span the full width and are rarely square
    let tiled = block_w % 16 == 0 && block_h % 16 == 0 && (block_w != width || block_w == block_h);
    if !tiled {
        return false;
    }

    let single_tile = width <= block_w && height <= block_h;
    let has_overviews = band.overview_count().map(|n| n > 0).unwrap_or(false);
    single_tile || has_overviews
}

/// Extract the metadata bundle of an open raster.
pub fn raster_properties(dataset: &Dataset, path: &Path) -> Result<RasterProperties, ConvertError> {
    let (cols, rows) = dataset.raster_size();
    let transform = dataset.geo_transform().unwrap_or(IDENTITY_TRANSFORM);

    let srs = dataset.spatial_ref().ok();
    let epsg = srs.as_ref().and_then(epsg_of);
    let wkt = srs
        .as_ref()
        .and_then(|s| s.to_wkt().ok())
        .filter(|w| !w.is_empty());

    let bbox = epsg.and_then(|code| {
        let native = geotransform_bounds(&transform, (cols, rows));
        match ProjCache::with_thread_cache(|cache| wgs84_bbox(&native, code, cache)) {
            Ok(bbox) => Some(bbox),
            Err(e) => {
                tracing::warn!("Could not compute WGS84 bbox for {}: {:#}", path.display(), e);
                None
            }
        }
    });

    let band_count = dataset.raster_count() as usize;
    let mut bands = Vec::with_capacity(band_count);
    for index in 1..=band_count {
        let unreadable = |e: gdal::errors::GdalError| ConvertError::Unreadable {
            path: path.to_path_buf(),
            reason: format!("band {}: {}", index, e),
        };
        let band = dataset.rasterband(index).map_err(unreadable)?;
        let nodata = band.no_data_value();
        let stats = band_stats(&band, (cols, rows), nodata).map_err(unreadable)?;
        bands.push(BandInfo {
            data_type: band.band_type().name(),
            nodata,
            stats,
        });
    }

    Ok(RasterProperties {
        epsg,
        wkt,
        shape: [rows, cols],
        transform,
        bbox,
        bands,
        driver: dataset.driver().short_name(),
    })
}

fn epsg_of(srs: &SpatialRef) -> Option<u32> {
    if let (Ok(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
        if name.eq_ignore_ascii_case("EPSG") && code > 0 {
            return Some(code as u32);
        }
    }

    let mut candidate = srs.clone();
    candidate.auto_identify_epsg().ok()?;
    let code = candidate.auth_code().ok()?;
    (code > 0).then_some(code as u32)
}

/// Exact statistics over valid pixels, scanned in row strips.
///
/// A band with no valid pixels reports zeros.
pub(crate) fn band_stats(
    band: &RasterBand,
    size: (usize, usize),
    nodata: Option<f64>,
) -> gdal::errors::Result<BandStats> {
    let (cols, rows) = size;
    let mut acc = StatsAccumulator::default();

    let mut row = 0;
    while row < rows {
        let n = STATS_STRIP_ROWS.min(rows - row);
        let buffer = band.read_as::<f64>((0, row as isize), (cols, n), (cols, n), None)?;
        for &value in buffer.data() {
            if is_valid(value, nodata) {
                acc.push(value);
            }
        }
        row += n;
    }

    Ok(acc.finish())
}

pub(crate) fn is_valid(value: f64, nodata: Option<f64>) -> bool {
    !value.is_nan() && nodata.map_or(true, |nd| value != nd)
}

/// Welford's online mean and variance.
#[derive(Debug, Default)]
pub(crate) struct StatsAccumulator {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl StatsAccumulator {
    pub(crate) fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub(crate) fn finish(&self) -> BandStats {
        if self.count == 0 {
            return BandStats { minimum: 0.0, maximum: 0.0, mean: 0.0, stddev: 0.0 };
        }
        BandStats {
            minimum: self.min,
            maximum: self.max,
            mean: self.mean,
            stddev: (self.m2 / self.count as f64).sqrt(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::convert::is_work_dir;

    fn read_band_u8(path: &Path, index: usize) -> Vec<u8> {
        let dataset = Dataset::open(path).unwrap();
        let (w, h) = dataset.raster_size();
        let band = dataset.rasterband(index).unwrap();
        band.read_as::<u8>((0, 0), (w, h), (w, h), None).unwrap().data().to_vec()
    }

    #[test]
    fn test_stats_accumulator() {
        let mut acc = StatsAccumulator::default();
        for v in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            acc.push(v);
        }
        let stats = acc.finish();
        assert_eq!(stats.minimum, 2.0);
        assert_eq!(stats.maximum, 9.0);
        assert!((stats.mean - 5.0).abs() < 1e-12);
        assert!((stats.stddev - 2.0).abs() < 1e-12);

        let empty = StatsAccumulator::default().finish();
        assert_eq!(empty.maximum, 0.0);
    }

    #[test]
    fn test_is_valid() {
        assert!(is_valid(1.0, None));
        assert!(!is_valid(f64::NAN, None));
        assert!(!is_valid(-9999.0, Some(-9999.0)));
        assert!(is_valid(0.0, Some(-9999.0)));
    }

    #[test]
    fn test_striped_geotiff_is_reencoded() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ortho.tif");
        // Width is not a multiple of 16, so strips can never look like tiles
        let size = (70, 50);
        let ramp = ramp(size);
        write_gtiff(&input, size, &[ramp.clone(), ramp.clone(), ramp.clone()], Some(32610), None);

        let before = Dataset::open(&input).unwrap();
        assert!(!is_cog(&before));
        drop(before);

        let product = RasterConverter::default().convert(&input).unwrap();
        assert!(!product.passthrough);
        assert_eq!(product.path, dir.path().join("ortho.cog.tif"));
        assert!(input.exists());

        let output = Dataset::open(&product.path).unwrap();
        assert!(is_cog(&output));
        assert_eq!(output.raster_size(), size);
        assert_eq!(output.spatial_ref().unwrap().auth_code().unwrap(), 32610);
        drop(output);
        assert_eq!(read_band_u8(&product.path, 2), ramp);

        let props = product.properties.as_raster().unwrap();
        assert_eq!(props.epsg, Some(32610));
        assert_eq!(props.shape, [50, 70]);
        assert_eq!(props.transform, UTM_TRANSFORM);
        assert_eq!(props.band_count(), 3);
        assert_eq!(props.bands[0].data_type, "Byte");
        assert_eq!(props.bands[0].stats.minimum, 0.0);
        assert_eq!(props.bands[0].stats.maximum, 255.0);
        assert_eq!(props.driver, "GTiff");
        let bbox = props.bbox.unwrap();
        assert!(bbox[0] < bbox[2] && bbox[1] < bbox[3]);
        assert!(bbox[0] > -122.0 && bbox[2] < -121.5);
        // Inspecting again on this thread reuses the projection
        assert_eq!(RasterConverter::default().inspect(&input).unwrap().bbox, Some(bbox));
        assert!(ProjCache::with_thread_cache(|cache| cache.len()) >= 1);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| is_work_dir(p))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_cog_input_is_passthrough() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("source.tif");
        let size = (32, 32);
        write_gtiff(&source, size, &[ramp(size)], Some(32610), None);

        let cog = dir.path().join("dsm.cog.tif");
        let converter = RasterConverter::default();
        let dataset = Dataset::open(&source).unwrap();
        converter.write_cog(&dataset, &cog).unwrap();
        drop(dataset);

        let product = converter.convert(&cog).unwrap();
        assert!(product.passthrough);
        assert_eq!(product.path, cog);
        assert_eq!(product.properties.as_raster().unwrap().band_count(), 1);
    }

    #[test]
    fn test_nodata_excluded_from_stats() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("dsm.tif");
        let data: Vec<f32> = vec![-9999.0, 10.0, 20.0, -9999.0, 30.0, 40.0];
        write_gtiff(&input, (3, 2), &[data], None, Some(-9999.0));

        let props = RasterConverter::default().inspect(&input).unwrap();
        let band = &props.bands[0];
        assert_eq!(band.nodata, Some(-9999.0));
        assert_eq!(band.data_type, "Float32");
        assert_eq!(band.stats.minimum, 10.0);
        assert_eq!(band.stats.maximum, 40.0);
        assert_eq!(band.stats.mean, 25.0);
        assert!(props.epsg.is_none());
        assert!(props.bbox.is_none());
    }

    #[test]
    fn test_unreadable_input() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("broken.tif");
        std::fs::write(&input, b"this is not a tiff").unwrap();

        let err = RasterConverter::default().convert(&input).unwrap_err();
        assert!(matches!(err, ConvertError::Unreadable { .. }));
        assert!(!dir.path().join("broken.cog.tif").exists());

        let err = RasterConverter::default().convert(&dir.path().join("missing.tif")).unwrap_err();
        assert!(matches!(err, ConvertError::Unreadable { .. }));
    }

    #[test]
    fn test_cog_options() {
        let config = ConversionConfig {
            compression: "zstd".to_string(),
            ..Default::default()
        };
        let options = CogOptions::from(&config);
        assert_eq!(options.compression, "ZSTD");
        assert_eq!(options.block_size, 512);
        assert!(options.creation_options().is_ok());
    }
}
