//! Format conversion into cloud-optimized products.
//!
//! Rasters are normalized to Cloud-Optimized GeoTIFF with GDAL, point clouds
//! to Cloud-Optimized Point Cloud with an external indexing tool. Inputs that
//! already have the target layout are passed through untouched.
//!
//! Outputs are built inside a hidden working directory next to the input and
//! renamed into place, so a reader never observes a half-written file.

pub mod las;
mod point_cloud;
pub(crate) mod raster;

pub use point_cloud::PointCloudConverter;
pub use raster::{CogOptions, RasterConverter};

use crate::model::ProductProperties;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Suffix of standardized raster outputs.
pub const COG_SUFFIX: &str = ".cog.tif";

/// Suffix of standardized point-cloud outputs.
pub const COPC_SUFFIX: &str = ".copc.laz";

const WORK_DIR_PREFIX: &str = ".convert-";

/// Conversion failure, one variant per failure class.
#[derive(Debug, thiserror::Error)]
pub enum ConvertError {
    #[error("cannot read {}: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("unsupported input {}: {reason}", .path.display())]
    Unsupported { path: PathBuf, reason: String },

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

    #[error("{tool} finished without producing {}", .path.display())]
    MissingOutput { tool: String, path: PathBuf },

    #[error("failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {}: {reason}", .path.display())]
    Encode { path: PathBuf, reason: String },
}

/// A standardized product ready to be recorded on its data product.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedProduct {
    /// Location of the standardized file.
    pub path: PathBuf,
    pub properties: ProductProperties,
    /// True when the input already had the target layout and was not rewritten.
    pub passthrough: bool,
}

/// Normalizes one input file.
pub trait Converter: Send + Sync {
    fn convert(&self, input: &Path) -> Result<ConvertedProduct, ConvertError>;
}

/// File name of `path` with standardized suffixes and one plain extension removed.
///
/// `a.cog.tif`, `a.copc.laz`, `a.tif` and `a.laz` all map to `a`.
pub fn output_stem(path: &Path) -> String {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    for suffix in [COG_SUFFIX, COPC_SUFFIX] {
        if let Some(stem) = name.strip_suffix(suffix) {
            if !stem.is_empty() {
                return stem.to_string();
            }
        }
    }

    match name.rfind('.') {
        Some(idx) if idx > 0 => name[..idx].to_string(),
        _ => name,
    }
}

/// Directory owned by the upload containing `path`.
pub fn upload_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Final location of the COG produced from `input`.
pub fn cog_output_path(input: &Path) -> PathBuf {
    upload_dir(input).join(format!("{}{}", output_stem(input), COG_SUFFIX))
}

/// Final location of the COPC produced from `input`.
pub fn copc_output_path(input: &Path) -> PathBuf {
    upload_dir(input).join(format!("{}{}", output_stem(input), COPC_SUFFIX))
}

/// Create a hidden working directory beside `input`; removed on drop.
pub(crate) fn work_dir(input: &Path) -> Result<TempDir, ConvertError> {
    let parent = upload_dir(input);
    tempfile::Builder::new()
        .prefix(WORK_DIR_PREFIX)
        .tempdir_in(&parent)
        .map_err(|source| ConvertError::Write { path: parent, source })
}

/// Atomically move a finished output into its final location.
pub(crate) fn move_into_place(from: &Path, to: &Path) -> Result<(), ConvertError> {
    std::fs::rename(from, to).map_err(|source| ConvertError::Write {
        path: to.to_path_buf(),
        source,
    })
}

/// True when `path` is a converter working directory.
pub fn is_work_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(WORK_DIR_PREFIX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_stem() {
        assert_eq!(output_stem(Path::new("/u/a/ortho.tif")), "ortho");
        assert_eq!(output_stem(Path::new("/u/a/ortho.cog.tif")), "ortho");
        assert_eq!(output_stem(Path::new("/u/a/scan.copc.laz")), "scan");
        assert_eq!(output_stem(Path::new("/u/a/scan.laz")), "scan");
        assert_eq!(output_stem(Path::new("/u/a/flight.2024.las")), "flight.2024");
        assert_eq!(output_stem(Path::new("noext")), "noext");
        assert_eq!(output_stem(Path::new(".cog.tif")), ".cog");
    }

    #[test]
    fn test_output_paths() {
        assert_eq!(cog_output_path(Path::new("/u/a/dsm.tif")), PathBuf::from("/u/a/dsm.cog.tif"));
        assert_eq!(
            copc_output_path(Path::new("/u/a/points.las")),
            PathBuf::from("/u/a/points.copc.laz")
        );
        assert_eq!(upload_dir(Path::new("bare.tif")), PathBuf::from("."));
    }

    #[test]
    fn test_work_dir_is_hidden_child() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("ortho.tif");
        let work = work_dir(&input).unwrap();
        assert_eq!(work.path().parent().unwrap(), dir.path());
        assert!(is_work_dir(work.path()));

        let kept = work.path().to_path_buf();
        drop(work);
        assert!(!kept.exists());
    }

    #[test]
    fn test_move_into_place_missing_source() {
        let dir = tempfile::tempdir().unwrap();
        let err = move_into_place(&dir.path().join("nope"), &dir.path().join("out")).unwrap_err();
        assert!(matches!(err, ConvertError::Write { .. }));
    }

    #[test]
    fn test_error_messages() {
        let err = ConvertError::ToolFailed {
            tool: "untwine".to_string(),
            exit_code: Some(2),
            stderr: "bad input".to_string(),
        };
        assert_eq!(err.to_string(), "untwine exited with status 2: bad input");

        let err = ConvertError::ToolFailed {
            tool: "untwine".to_string(),
            exit_code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("signal"));
    }
}
