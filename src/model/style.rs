//! Default visualization styles derived from raster statistics.

use super::properties::{BandStats, RasterProperties};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How pixel values are stretched onto the color ramp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StretchMode {
    MinMax,
    MeanStdDev,
    UserDefined,
}

/// Style for a single-band raster rendered through a color ramp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SingleBandStyle {
    pub color_ramp: String,
    pub mode: StretchMode,
    pub mean_std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub user_min: f64,
    pub user_max: f64,
}

/// Stretch applied to one RGB channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelStyle {
    /// 1-based band index feeding this channel
    pub id: usize,
    pub min: f64,
    pub max: f64,
    pub user_min: f64,
    pub user_max: f64,
}

/// Style for an RGB composite of three bands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiBandStyle {
    pub mode: StretchMode,
    pub mean_std_dev: f64,
    pub red: ChannelStyle,
    pub green: ChannelStyle,
    pub blue: ChannelStyle,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StyleSettings {
    SingleBand(SingleBandStyle),
    MultiBand(MultiBandStyle),
}

const DEFAULT_COLOR_RAMP: &str = "spectral";
const DEFAULT_STD_DEVS: f64 = 2.0;

impl StyleSettings {
    /// Single-band style stretched between `min` and `max`.
    pub fn single_band(min: f64, max: f64) -> Self {
        StyleSettings::SingleBand(SingleBandStyle {
            color_ramp: DEFAULT_COLOR_RAMP.to_string(),
            mode: StretchMode::MinMax,
            mean_std_dev: DEFAULT_STD_DEVS,
            min,
            max,
            user_min: min,
            user_max: max,
        })
    }

    /// Default symbology for a raster: RGB composite of bands 1-3 when the
    /// raster has at least three bands, otherwise a color ramp over band 1.
    pub fn default_for(props: &RasterProperties) -> Self {
        if props.bands.len() >= 3 {
            let channel = |id: usize| {
                let stats = props.bands[id - 1].stats;
                ChannelStyle {
                    id,
                    min: stats.minimum,
                    max: stats.maximum,
                    user_min: stats.minimum,
                    user_max: stats.maximum,
                }
            };
            return StyleSettings::MultiBand(MultiBandStyle {
                mode: StretchMode::MinMax,
                mean_std_dev: DEFAULT_STD_DEVS,
                red: channel(1),
                green: channel(2),
                blue: channel(3),
            });
        }

        match props.bands.first() {
            Some(band) => Self::from_stats(&band.stats),
            None => Self::single_band(0.0, 255.0),
        }
    }

    pub fn from_stats(stats: &BandStats) -> Self {
        Self::single_band(stats.minimum, stats.maximum)
    }
}

/// A style persisted for one user and one data product.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStyle {
    pub id: Uuid,
    pub data_product_id: Uuid,
    pub user_id: Uuid,
    pub settings: StyleSettings,
}
