//! Read-time projection of data products.
//!
//! The stored [`DataProduct`] never carries its URL, job status or the
//! viewer's style. Those are joined in here, at query time, into a separate
//! [`DataProductView`].

use super::data_product::DataProduct;
use super::job::JobStatus;
use super::style::StyleSettings;
use crate::config::StorageConfig;
use crate::store::{DataStore, StoreError};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataProductView {
    #[serde(flatten)]
    pub product: DataProduct,
    /// Public URL; `None` when the file lives outside the upload root.
    pub url: Option<String>,
    /// Status of the most recent job for this product.
    pub status: Option<JobStatus>,
    pub user_style: Option<StyleSettings>,
}

/// Build the public URL for a file under the upload root.
pub fn product_url(filepath: &Path, upload_root: &Path, static_url: &str) -> Option<String> {
    let relative = filepath.strip_prefix(upload_root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(format!("{}/{}", static_url.trim_end_matches('/'), parts.join("/")))
}

fn compose(
    store: &dyn DataStore,
    product: DataProduct,
    user_id: Uuid,
    storage: &StorageConfig,
) -> Result<DataProductView, StoreError> {
    let status = store.find_job_for_data_product(product.id)?.map(|job| job.status);
    let user_style = store
        .get_user_style(product.id, user_id)?
        .map(|style| style.settings);
    let url = product_url(&product.filepath, &storage.upload_dir, &storage.static_url);

    Ok(DataProductView {
        product,
        url,
        status,
        user_style,
    })
}

/// Enriched view of one data product as seen by `user_id`.
pub fn data_product_view(
    store: &dyn DataStore,
    data_product_id: Uuid,
    user_id: Uuid,
    storage: &StorageConfig,
) -> Result<Option<DataProductView>, StoreError> {
    match store.get_data_product(data_product_id)? {
        Some(product) => compose(store, product, user_id, storage).map(Some),
        None => Ok(None),
    }
}

/// Enriched views of every data product in a flight.
pub fn flight_views(
    store: &dyn DataStore,
    flight_id: Uuid,
    user_id: Uuid,
    storage: &StorageConfig,
) -> Result<Vec<DataProductView>, StoreError> {
    store
        .list_data_products_by_flight(flight_id)?
        .into_iter()
        .map(|product| compose(store, product, user_id, storage))
        .collect()
}
