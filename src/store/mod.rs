//! Data store interface for jobs, data products and user styles.
//!
//! The pipeline never owns durable state. Everything it reads or writes goes
//! through [`DataStore`], which is implemented by:
//!
//! - [`MemoryStore`]: concurrent in-process maps, used in tests and embedding
//! - [`SqliteStore`]: a SQLite file, used by the CLI

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{
    DataProduct, DataProductPatch, Job, JobPatch, NewDataProduct, NewJob, StyleSettings,
    UserStyle,
};
use uuid::Uuid;

/// Failure reported by a data store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Synchronous request/response access to persisted records.
///
/// Implementations must be safe to share between concurrently running tasks;
/// the pipeline guarantees that no two tasks mutate the same job row.
pub trait DataStore: Send + Sync {
    fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Apply `patch` and return the updated record.
    fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError>;

    /// Most recently started job attached to a data product.
    fn find_job_for_data_product(&self, data_product_id: Uuid) -> Result<Option<Job>, StoreError>;

    fn get_data_product(&self, id: Uuid) -> Result<Option<DataProduct>, StoreError>;

    fn create_data_product(&self, product: NewDataProduct) -> Result<DataProduct, StoreError>;

    fn update_data_product(
        &self,
        id: Uuid,
        patch: DataProductPatch,
    ) -> Result<DataProduct, StoreError>;

    fn list_data_products_by_flight(&self, flight_id: Uuid) -> Result<Vec<DataProduct>, StoreError>;

    fn create_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
        settings: StyleSettings,
    ) -> Result<UserStyle, StoreError>;

    fn get_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserStyle>, StoreError>;
}
