//! Job records and the phase state machine.
//!
//! A job is stored as a `(state, status)` pair. Only four pairs are valid and
//! they are modelled as [`JobPhase`]:
//!
//! ```text
//! PENDING/WAITING ──▶ STARTED/INPROGRESS ──▶ COMPLETED/SUCCESS
//!        │                    │
//!        └────────────────────┴─────────────▶ COMPLETED/FAILED
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle level of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobState {
    Pending,
    Started,
    Completed,
}

/// Outcome of a job within its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Waiting,
    #[serde(rename = "INPROGRESS")]
    InProgress,
    Success,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "PENDING",
            JobState::Started => "STARTED",
            JobState::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(JobState::Pending),
            "STARTED" => Some(JobState::Started),
            "COMPLETED" => Some(JobState::Completed),
            _ => None,
        }
    }
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::InProgress => "INPROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "WAITING" => Some(JobStatus::Waiting),
            "INPROGRESS" => Some(JobStatus::InProgress),
            "SUCCESS" => Some(JobStatus::Success),
            "FAILED" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One of the four valid `(state, status)` combinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPhase {
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl JobPhase {
    /// Map a stored pair onto a phase. Returns `None` for pairs that the
    /// state machine never produces (e.g. `PENDING/SUCCESS`).
    pub fn from_pair(state: JobState, status: JobStatus) -> Option<Self> {
        match (state, status) {
            (JobState::Pending, JobStatus::Waiting) => Some(JobPhase::Waiting),
            (JobState::Started, JobStatus::InProgress) => Some(JobPhase::InProgress),
            (JobState::Completed, JobStatus::Success) => Some(JobPhase::Succeeded),
            (JobState::Completed, JobStatus::Failed) => Some(JobPhase::Failed),
            _ => None,
        }
    }

    pub fn pair(&self) -> (JobState, JobStatus) {
        match self {
            JobPhase::Waiting => (JobState::Pending, JobStatus::Waiting),
            JobPhase::InProgress => (JobState::Started, JobStatus::InProgress),
            JobPhase::Succeeded => (JobState::Completed, JobStatus::Success),
            JobPhase::Failed => (JobState::Completed, JobStatus::Failed),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobPhase::Succeeded | JobPhase::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in `InProgress` is allowed so that a repeated start is a no-op.
    /// Failure may be entered from either non-terminal phase; success only
    /// from `InProgress`.
    pub fn can_transition_to(&self, next: JobPhase) -> bool {
        matches!(
            (self, next),
            (JobPhase::Waiting, JobPhase::InProgress)
                | (JobPhase::InProgress, JobPhase::InProgress)
                | (JobPhase::InProgress, JobPhase::Succeeded)
                | (JobPhase::InProgress, JobPhase::Failed)
                | (JobPhase::Waiting, JobPhase::Failed)
        )
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, status) = self.pair();
        write!(f, "{}/{}", state, status)
    }
}

/// A persisted processing job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub data_product_id: Uuid,
    pub name: String,
    pub state: JobState,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
}

impl Job {
    /// Current phase, or `None` if the stored pair is corrupt.
    pub fn phase(&self) -> Option<JobPhase> {
        JobPhase::from_pair(self.state, self.status)
    }

    pub fn is_completed(&self) -> bool {
        self.state == JobState::Completed
    }
}

/// Values for creating a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub data_product_id: Uuid,
    pub state: JobState,
    pub status: JobStatus,
    pub start_time: DateTime<Utc>,
}

impl NewJob {
    /// A fresh `PENDING/WAITING` job stamped with the current time.
    pub fn pending(data_product_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_product_id,
            state: JobState::Pending,
            status: JobStatus::Waiting,
            start_time: Utc::now(),
        }
    }
}

/// Partial update of a job record. `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobPatch {
    pub state: Option<JobState>,
    pub status: Option<JobStatus>,
    pub end_time: Option<DateTime<Utc>>,
}

impl JobPatch {
    pub fn phase(phase: JobPhase) -> Self {
        let (state, status) = phase.pair();
        Self {
            state: Some(state),
            status: Some(status),
            end_time: None,
        }
    }

    pub fn with_end_time(mut self, end_time: DateTime<Utc>) -> Self {
        self.end_time = Some(end_time);
        self
    }

    pub fn apply(&self, job: &mut Job) {
        if let Some(state) = self.state {
            job.state = state;
        }
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(end_time) = self.end_time {
            job.end_time = Some(end_time);
        }
    }
}
