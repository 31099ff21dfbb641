//! SQLite-backed data store.

use super::{DataStore, StoreError};
use crate::model::{
    DataProduct, DataProductPatch, Job, JobPatch, JobState, JobStatus, NewDataProduct, NewJob,
    ProductProperties, StyleSettings, UserStyle,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS jobs (
        id              TEXT PRIMARY KEY,
        data_product_id TEXT NOT NULL,
        name            TEXT NOT NULL,
        state           TEXT NOT NULL,
        status          TEXT NOT NULL,
        start_time      TEXT NOT NULL,
        end_time        TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_jobs_data_product
        ON jobs(data_product_id, start_time DESC);

    CREATE TABLE IF NOT EXISTS data_products (
        id                TEXT PRIMARY KEY,
        flight_id         TEXT NOT NULL,
        data_type         TEXT NOT NULL,
        filepath          TEXT NOT NULL,
        original_filename TEXT NOT NULL,
        stac_properties   TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_data_products_flight
        ON data_products(flight_id);

    CREATE TABLE IF NOT EXISTS user_styles (
        id              TEXT PRIMARY KEY,
        data_product_id TEXT NOT NULL,
        user_id         TEXT NOT NULL,
        settings        TEXT NOT NULL,
        UNIQUE (data_product_id, user_id)
    );
";

/// Data store persisted in a single SQLite database.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a database file and ensure the schema exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// In-memory database, used in tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a job with a caller-chosen id.
    pub fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        self.lock().execute(
            "INSERT INTO jobs (id, data_product_id, name, state, status, start_time, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                job.id.to_string(),
                job.data_product_id.to_string(),
                job.name,
                job.state.as_str(),
                job.status.as_str(),
                job.start_time.to_rfc3339(),
                job.end_time.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Insert a data product with a caller-chosen id.
    pub fn insert_data_product(&self, product: &DataProduct) -> Result<(), StoreError> {
        let props = product
            .stac_properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.lock().execute(
            "INSERT INTO data_products (id, flight_id, data_type, filepath, original_filename, stac_properties)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                product.id.to_string(),
                product.flight_id.to_string(),
                product.data_type,
                path_to_text(&product.filepath),
                product.original_filename,
                props,
            ],
        )?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn query_job(conn: &Connection, id: Uuid) -> Result<Option<Job>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, data_product_id, name, state, status, start_time, end_time
                 FROM jobs WHERE id = ?1",
                params![id.to_string()],
                RawJob::from_row,
            )
            .optional()?;
        row.map(RawJob::into_job).transpose()
    }

    fn query_data_product(conn: &Connection, id: Uuid) -> Result<Option<DataProduct>, StoreError> {
        let row = conn
            .query_row(
                "SELECT id, flight_id, data_type, filepath, original_filename, stac_properties
                 FROM data_products WHERE id = ?1",
                params![id.to_string()],
                RawDataProduct::from_row,
            )
            .optional()?;
        row.map(RawDataProduct::into_data_product).transpose()
    }
}

fn path_to_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Corrupt(format!("invalid uuid '{}': {}", s, e)))
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("invalid timestamp '{}': {}", s, e)))
}

/// Job row as stored, before validation.
struct RawJob {
    id: String,
    data_product_id: String,
    name: String,
    state: String,
    status: String,
    start_time: String,
    end_time: Option<String>,
}

impl RawJob {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            data_product_id: row.get(1)?,
            name: row.get(2)?,
            state: row.get(3)?,
            status: row.get(4)?,
            start_time: row.get(5)?,
            end_time: row.get(6)?,
        })
    }

    fn into_job(self) -> Result<Job, StoreError> {
        let state = JobState::parse(&self.state)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job state '{}'", self.state)))?;
        let status = JobStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown job status '{}'", self.status)))?;
        Ok(Job {
            id: parse_uuid(&self.id)?,
            data_product_id: parse_uuid(&self.data_product_id)?,
            name: self.name,
            state,
            status,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
        })
    }
}

struct RawDataProduct {
    id: String,
    flight_id: String,
    data_type: String,
    filepath: String,
    original_filename: String,
    stac_properties: Option<String>,
}

impl RawDataProduct {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            flight_id: row.get(1)?,
            data_type: row.get(2)?,
            filepath: row.get(3)?,
            original_filename: row.get(4)?,
            stac_properties: row.get(5)?,
        })
    }

    fn into_data_product(self) -> Result<DataProduct, StoreError> {
        let stac_properties = self
            .stac_properties
            .as_deref()
            .map(serde_json::from_str::<ProductProperties>)
            .transpose()?;
        Ok(DataProduct {
            id: parse_uuid(&self.id)?,
            flight_id: parse_uuid(&self.flight_id)?,
            data_type: self.data_type,
            filepath: PathBuf::from(self.filepath),
            original_filename: self.original_filename,
            stac_properties,
        })
    }
}

impl DataStore for SqliteStore {
    fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Self::query_job(&self.lock(), id)
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
        self.insert_job(&job)?;
        Ok(job)
    }

    fn update_job(&self, id: Uuid, patch: JobPatch) -> Result<Job, StoreError> {
        let conn = self.lock();
        let mut job = Self::query_job(&conn, id)?.ok_or(StoreError::NotFound { entity: "job", id })?;
        patch.apply(&mut job);
        conn.execute(
            "UPDATE jobs SET state = ?1, status = ?2, end_time = ?3 WHERE id = ?4",
            params![
                job.state.as_str(),
                job.status.as_str(),
                job.end_time.map(|t| t.to_rfc3339()),
                id.to_string(),
            ],
        )?;
        Ok(job)
    }

    fn find_job_for_data_product(&self, data_product_id: Uuid) -> Result<Option<Job>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, data_product_id, name, state, status, start_time, end_time
                 FROM jobs WHERE data_product_id = ?1
                 ORDER BY start_time DESC LIMIT 1",
                params![data_product_id.to_string()],
                RawJob::from_row,
            )
            .optional()?;
        row.map(RawJob::into_job).transpose()
    }

    fn get_data_product(&self, id: Uuid) -> Result<Option<DataProduct>, StoreError> {
        Self::query_data_product(&self.lock(), id)
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
        self.insert_data_product(&product)?;
        Ok(product)
    }

    fn update_data_product(
        &self,
        id: Uuid,
        patch: DataProductPatch,
    ) -> Result<DataProduct, StoreError> {
        let conn = self.lock();
        let mut product = Self::query_data_product(&conn, id)?
            .ok_or(StoreError::NotFound { entity: "data product", id })?;
        patch.apply(&mut product);
        let props = product
            .stac_properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "UPDATE data_products SET filepath = ?1, stac_properties = ?2 WHERE id = ?3",
            params![path_to_text(&product.filepath), props, id.to_string()],
        )?;
        Ok(product)
    }

    fn list_data_products_by_flight(&self, flight_id: Uuid) -> Result<Vec<DataProduct>, StoreError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, flight_id, data_type, filepath, original_filename, stac_properties
             FROM data_products WHERE flight_id = ?1
             ORDER BY original_filename",
        )?;
        let rows = stmt
            .query_map(params![flight_id.to_string()], RawDataProduct::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawDataProduct::into_data_product).collect()
    }

    fn create_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
        settings: StyleSettings,
    ) -> Result<UserStyle, StoreError> {
        let json = serde_json::to_string(&settings)?;
        // On conflict the existing row keeps its id
        let id: String = self.lock().query_row(
            "INSERT INTO user_styles (id, data_product_id, user_id, settings)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(data_product_id, user_id) DO UPDATE SET settings = excluded.settings
             RETURNING id",
            params![
                Uuid::new_v4().to_string(),
                data_product_id.to_string(),
                user_id.to_string(),
                json,
            ],
            |row| row.get(0),
        )?;
        Ok(UserStyle {
            id: parse_uuid(&id)?,
            data_product_id,
            user_id,
            settings,
        })
    }

    fn get_user_style(
        &self,
        data_product_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<UserStyle>, StoreError> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, settings FROM user_styles WHERE data_product_id = ?1 AND user_id = ?2",
                params![data_product_id.to_string(), user_id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        match row {
            Some((id, settings)) => Ok(Some(UserStyle {
                id: parse_uuid(&id)?,
                data_product_id,
                user_id,
                settings: serde_json::from_str(&settings)?,
            })),
            None => Ok(None),
        }
    }
}
