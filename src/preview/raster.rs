//! Raster previews rendered with GDAL.

use super::{PreviewError, PreviewRenderer};
use crate::convert::raster::is_valid;
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, ResampleAlg};
use gdal::{Dataset, DriverManager};
use std::path::Path;

/// Stretches up to three bands to an RGBA PNG.
///
/// One or two band rasters are drawn in grey from band 1. Pixels that are
/// nodata in any drawn band are transparent.
#[derive(Debug, Default, Clone, Copy)]
pub struct RasterPreviewRenderer;

/// Preview dimensions with the longest side scaled to `max_size`.
pub fn preview_size(size: (usize, usize), max_size: usize) -> (usize, usize) {
    let (width, height) = size;
    let longest = width.max(height).max(1);
    let scale = max_size as f64 / longest as f64;
    let scaled = |v: usize| ((v as f64 * scale).round() as usize).max(1);
    (scaled(width), scaled(height))
}

impl PreviewRenderer for RasterPreviewRenderer {
    fn render(&self, input: &Path, output: &Path, max_size: usize) -> Result<(), PreviewError> {
        let unreadable = |reason: String| PreviewError::Unreadable {
            path: input.to_path_buf(),
            reason,
        };

        let dataset = Dataset::open(input).map_err(|e| unreadable(e.to_string()))?;
        let band_count = dataset.raster_count() as usize;
        if band_count == 0 {
            return Err(unreadable("no raster bands".to_string()));
        }

        let size = dataset.raster_size();
        let out_size = preview_size(size, max_size);
        let drawn: Vec<usize> = if band_count >= 3 { vec![1, 2, 3] } else { vec![1] };

        let mut channels = Vec::with_capacity(drawn.len());
        for index in drawn {
            let band = dataset.rasterband(index).map_err(|e| unreadable(e.to_string()))?;
            let nodata = band.no_data_value();
            let buffer = band
                .read_as::<f64>((0, 0), size, out_size, Some(ResampleAlg::Average))
                .map_err(|e| unreadable(format!("band {}: {}", index, e)))?;
            channels.push((buffer.data().to_vec(), nodata));
        }

        let rgba = compose_rgba(&channels);
        write_png(output, out_size, rgba).map_err(|e| PreviewError::Render {
            path: output.to_path_buf(),
            reason: e.to_string(),
        })
    }
}

/// Linear min/max stretch of each channel to 8 bits plus an alpha band.
fn compose_rgba(channels: &[(Vec<f64>, Option<f64>)]) -> [Vec<u8>; 4] {
    let len = channels.first().map_or(0, |(values, _)| values.len());

    let mut alpha = vec![255u8; len];
    for (values, nodata) in channels {
        for (a, &v) in alpha.iter_mut().zip(values) {
            if !is_valid(v, *nodata) {
                *a = 0;
            }
        }
    }

    let stretched: Vec<Vec<u8>> = channels
        .iter()
        .map(|(values, nodata)| stretch(values, *nodata))
        .collect();

    let (red, green, blue) = match stretched.as_slice() {
        [r, g, b, ..] => (r.clone(), g.clone(), b.clone()),
        [grey] => (grey.clone(), grey.clone(), grey.clone()),
        _ => (vec![0; len], vec![0; len], vec![0; len]),
    };
    [red, green, blue, alpha]
}

fn stretch(values: &[f64], nodata: Option<f64>) -> Vec<u8> {
    let (min, max) = values
        .iter()
        .filter(|&&v| is_valid(v, nodata))
        .fold((f64::MAX, f64::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));

    let range = max - min;
    values
        .iter()
        .map(|&v| {
            if !is_valid(v, nodata) {
                0
            } else if range <= 0.0 {
                255
            } else {
                ((v - min) / range * 255.0).round().clamp(0.0, 255.0) as u8
            }
        })
        .collect()
}

/// Build an in-memory RGBA dataset and copy it out through the PNG driver.
fn write_png(output: &Path, size: (usize, usize), rgba: [Vec<u8>; 4]) -> gdal::errors::Result<()> {
    let mem_driver = DriverManager::get_driver_by_name("MEM")?;
    let mut dataset = mem_driver.create_with_band_type::<u8, _>("", size.0, size.1, 4)?;

    for (index, data) in rgba.into_iter().enumerate() {
        let mut band = dataset.rasterband(index + 1)?;
        band.write((0, 0), size, &mut Buffer::new(size, data))?;
    }

    let png_driver = DriverManager::get_driver_by_name("PNG")?;
    let png = dataset.create_copy(&png_driver, output, &CslStringList::new())?;
    drop(png);
    Ok(())
}
