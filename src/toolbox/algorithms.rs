//! Band-math vegetation indices.
//!
//! Inputs are `f64` bands where invalid pixels are NaN. Outputs are `f32`
//! with [`NODATA`] wherever an input is invalid or the index is undefined.

use ndarray::{Array2, ArrayView2, Zip};

/// Output nodata value for every tool.
pub const NODATA: f32 = -9999.0;

/// Normalized Difference Vegetation Index: `(nir - red) / (nir + red)`.
pub fn ndvi(red: ArrayView2<f64>, nir: ArrayView2<f64>) -> Array2<f32> {
    let mut out = Array2::from_elem(red.dim(), NODATA);
    Zip::from(&mut out)
        .and(&red)
        .and(&nir)
        .par_for_each(|o, &r, &n| {
            let denom = n + r;
            if r.is_finite() && n.is_finite() && denom != 0.0 {
                *o = ((n - r) / denom) as f32;
            }
        });
    out
}

/// Excess Green on chromatic coordinates: `2g - r - b` where each channel
/// is divided by `r + g + b`.
pub fn exg(red: ArrayView2<f64>, green: ArrayView2<f64>, blue: ArrayView2<f64>) -> Array2<f32> {
    let mut out = Array2::from_elem(red.dim(), NODATA);
    Zip::from(&mut out)
        .and(&red)
        .and(&green)
        .and(&blue)
        .par_for_each(|o, &r, &g, &b| {
            let total = r + g + b;
            if total.is_finite() && total != 0.0 {
                let (rn, gn, bn) = (r / total, g / total, b / total);
                *o = (2.0 * gn - rn - bn) as f32;
            }
        });
    out
}

/// Visible Atmospherically Resistant Index: `(g - r) / (g + r - b)`.
pub fn vari(red: ArrayView2<f64>, green: ArrayView2<f64>, blue: ArrayView2<f64>) -> Array2<f32> {
    let mut out = Array2::from_elem(red.dim(), NODATA);
    Zip::from(&mut out)
        .and(&red)
        .and(&green)
        .and(&blue)
        .par_for_each(|o, &r, &g, &b| {
            let denom = g + r - b;
            if r.is_finite() && g.is_finite() && b.is_finite() && denom != 0.0 {
                *o = ((g - r) / denom) as f32;
            }
        });
    out
}
