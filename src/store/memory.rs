//! In-process data store backed by concurrent maps.

use super::{DataStore, StoreError};
use crate::model::{
    DataProduct, DataProductPatch, Job, JobPatch, NewDataProduct, NewJob, StyleSettings,
    UserStyle,
};
use dashmap::DashMap;
use uuid::Uuid;

/// Data store holding every record in memory.
#[derive(Default)]
pub struct MemoryStore {
    jobs: DashMap<Uuid, Job>,
    data_products: DashMap<Uuid, DataProduct>,
    /// Keyed by (data_product_id, user_id)
    user_styles: DashMap<(Uuid, Uuid), UserStyle>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a job with a caller-chosen id (used by upload collaborators
    /// and tests that need a known id).
    pub fn insert_job(&self, job: Job) {
        self.jobs.insert(job.id, job);
    }

    pub fn insert_data_product(&self, product: DataProduct) {
        self.data_products.insert(product.id, product);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn user_style_count(&self) -> usize {
        self.user_styles.len()
    }
}

impl DataStore for MemoryStore {
    fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(&id).map(|j| j.clone()))
    }

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let job = Job {
            id: Uuid::new_v4(),
            data_product_id: job.data_product_id,
            name: job.name,
            state: job.state,
            status: job.status,
            start_time: job.start_time,
            end_time: None,
        };
        self.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let mut entry = self
            .jobs
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "job", id })?;
        patch.apply(entry.value_mut());
        Ok(entry.clone())
    }

    fn find_job_for_data_product(&self, data_product_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .iter()
            .filter(|j| j.data_product_id == data_product_id)
            .max_by_key(|j| j.start_time)
            .map(|j| j.clone()))
    }

    fn get_data_product(&self, id: Uuid) -> Result<Option<DataProduct>, StoreError> {
        Ok(self.data_products.get(&id).map(|p| p.clone()))
    }

    fn create_data_product(&self, product: NewDataProduct) -> Result<DataProduct, StoreError> {
        let product = DataProduct {
            id: Uuid::new_v4(),
            flight_id: product.flight_id,
            data_type: product.data_type,
            filepath: product.filepath,
            original_filename: product.original_filename,
            stac_properties: None,
        };
        self.data_products.insert(product.id, product.clone());
        Ok(product)
    }

    fn update_data_product(
        &self,
        id: Uuid,
        patch: DataProductPatch,
    ) -> Result<DataProduct, StoreError> {
        let mut entry = self
            .data_products
            .get_mut(&id)
            .ok_or(StoreError::NotFound { entity: "data product", id })?;
        patch.apply(entry.value_mut());
        Ok(entry.clone())
    }

    fn list_data_products_by_flight(&self, flight_id: Uuid) -> Result<Vec<DataProduct>, StoreError> {
        let mut products: Vec<DataProduct> = self
            .data_products
            .iter()
            .filter(|p| p.flight_id == flight_id)
            .map(|p| p.clone())
            .collect();
        products.sort_by(|a, b| a.original_filename.cmp(&b.original_filename));
        Ok(products)
    }

    fn create_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
        settings: StyleSettings,
    ) -> Result<UserStyle, StoreError> {
        // An existing style keeps its id
        let mut entry = self
            .user_styles
            .entry((data_product_id, user_id))
            .or_insert_with(|| UserStyle {
                id: Uuid::new_v4(),
                data_product_id,
                user_id,
                settings: settings.clone(),
            });
        entry.settings = settings;
        Ok(entry.clone())
    }

    fn get_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserStyle>, StoreError> {
        Ok(self.user_styles.get(&(data_product_id, user_id)).map(|s| s.clone()))
    }
}
