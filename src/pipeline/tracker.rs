//! Job lifecycle bookkeeping over a [`DataStore`].
//!
//! Every transition re-reads the persisted job first, so a stale copy held by
//! the caller can never move a completed job.

use crate::model::{Job, JobPatch, JobPhase, JobState, JobStatus, NewJob};
use crate::store::{DataStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("job {id} is already completed ({phase})")]
    AlreadyCompleted { id: Uuid, phase: JobPhase },

    #[error("job {id} cannot move from {from} to {to}")]
    IllegalTransition { id: Uuid, from: JobPhase, to: JobPhase },

    #[error("job {id} has an invalid state pair {state}/{status}")]
    Corrupt {
        id: Uuid,
        state: JobState,
        status: JobStatus,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Creates jobs and moves them through their phases.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn DataStore>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }

    /// Create a `PENDING/WAITING` job for a data product.
    pub fn create(&self, data_product_id: Uuid, name: &str) -> Result<Job, JobError> {
        let job = self.store.create_job(NewJob::pending(data_product_id, name))?;
        tracing::debug!(job_id = %job.id, "Created job {}", job.name);
        Ok(job)
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Job>, JobError> {
        Ok(self.store.get_job(id)?)
    }

    /// Move to `STARTED/INPROGRESS`. Repeating it on a started job is a no-op.
    pub fn mark_started(&self, job: &Job) -> Result<Job, JobError> {
        self.transition(job.id, JobPhase::InProgress)
    }

    pub fn mark_succeeded(&self, job: &Job) -> Result<Job, JobError> {
        self.transition(job.id, JobPhase::Succeeded)
    }

    pub fn mark_failed(&self, job: &Job) -> Result<Job, JobError> {
        self.transition(job.id, JobPhase::Failed)
    }

    fn transition(&self, id: Uuid, next: JobPhase) -> Result<Job, JobError> {
        let current = self.store.get_job(id)?.ok_or(JobError::NotFound(id))?;
        let phase = current.phase().ok_or(JobError::Corrupt {
            id,
            state: current.state,
            status: current.status,
        })?;

        if phase.is_terminal() {
            return Err(JobError::AlreadyCompleted { id, phase });
        }
        if phase == next {
            return Ok(current);
        }
        if !phase.can_transition_to(next) {
            return Err(JobError::IllegalTransition { id, from: phase, to: next });
        }

        let mut patch = JobPatch::phase(next);
        if next.is_terminal() {
            // Clock skew between writers must not yield end < start
            patch = patch.with_end_time(Utc::now().max(current.start_time));
        }

        let updated = self.store.update_job(id, patch)?;
        tracing::debug!(job_id = %id, "Job {} moved {} -> {}", updated.name, phase, next);
        Ok(updated)
    }
}
