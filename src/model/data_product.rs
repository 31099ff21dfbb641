//! Data product records.

use super::properties::ProductProperties;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// One servable geospatial file plus its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataProduct {
    pub id: Uuid,
    pub flight_id: Uuid,
    /// Free-form tag such as `ortho`, `dsm` or `point_cloud`.
    pub data_type: String,
    pub filepath: PathBuf,
    pub original_filename: String,
    #[serde(default)]
    pub stac_properties: Option<ProductProperties>,
}

/// Values for creating a placeholder data product before processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewDataProduct {
    pub flight_id: Uuid,
    pub data_type: String,
    pub filepath: PathBuf,
    pub original_filename: String,
}

/// Partial update of a data product. `None` fields are left unchanged;
/// `stac_properties: Some(None)` clears the stored properties.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataProductPatch {
    pub filepath: Option<PathBuf>,
    pub stac_properties: Option<Option<ProductProperties>>,
}

impl DataProductPatch {
    /// Patch that puts `product`'s file and metadata back as they were.
    pub fn restore(product: &DataProduct) -> Self {
        Self {
            filepath: Some(product.filepath.clone()),
            stac_properties: Some(product.stac_properties.clone()),
        }
    }

    pub fn apply(&self, product: &mut DataProduct) {
        if let Some(filepath) = &self.filepath {
            product.filepath = filepath.clone();
        }
        if let Some(props) = &self.stac_properties {
            product.stac_properties = props.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PointCloudProperties;

    #[test]
    fn test_restore_clears_properties() {
        let mut product = DataProduct {
            id: Uuid::new_v4(),
            flight_id: Uuid::new_v4(),
            data_type: "ortho".to_string(),
            filepath: PathBuf::from("/uploads/a/raw.tif"),
            original_filename: "raw.tif".to_string(),
            stac_properties: None,
        };
        let prior = product.clone();

        let props = ProductProperties::PointCloud(PointCloudProperties {
            las_version: "1.4".to_string(),
            point_format: 6,
            point_count: 1,
            bounds: [0.0, 0.0, 0.0, 1.0, 1.0, 1.0],
            scale: [0.01; 3],
            offset: [0.0; 3],
            compressed: true,
            copc: true,
        });
        DataProductPatch {
            filepath: Some(PathBuf::from("/uploads/a/raw.copc.laz")),
            stac_properties: Some(Some(props)),
        }
        .apply(&mut product);
        assert!(product.stac_properties.is_some());

        DataProductPatch::restore(&prior).apply(&mut product);
        assert_eq!(product, prior);

        // Empty patch leaves everything alone
        DataProductPatch::default().apply(&mut product);
        assert_eq!(product, prior);
    }
}
