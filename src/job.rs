//! The job model: one requested book analysis and its lifecycle record.

use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque unique identifier for a [`Job`].
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The priority class of a job.
///
/// Determines queue position only: expedited items are inserted at the head
/// of the pending list, batch items at the tail. Already-running work is
/// never preempted.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Batch,
    Expedited,
}

/// Lifecycle state of a job.
///
/// Transitions: `Queued → Processing → {Completed | Failed}`. Failed jobs may
/// be administratively resubmitted, which resets them to `Queued`.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

/// A persisted analysis job.
///
/// Created by the orchestrator at submission time. Status and timestamps are
/// mutated only through [`JobUpdate`] patches; all timestamp fields are set
/// by the store, never trusted from caller input.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub title: String,
    pub author: String,
    pub genre: String,
    pub purpose: String,
    pub audience: String,
    pub priority: Priority,
    pub status: JobStatus,
    pub cost: f64,
    pub error_message: Option<String>,
    pub result_location: Option<String>,
    pub idempotency_key: Option<String>,
    pub webhook_url: Option<String>,
    pub processing_time_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// The fields required to create a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub purpose: String,
    pub audience: String,
    pub priority: Priority,
    pub cost: f64,
    pub idempotency_key: Option<String>,
    pub webhook_url: Option<String>,
}

/// A partial update to a persisted job.
///
/// `None` leaves a field untouched; `Some(None)` clears a nullable field.
/// Use the named constructors for the standard lifecycle transitions.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub error_message: Option<Option<String>>,
    pub result_location: Option<Option<String>>,
    pub processing_time_ms: Option<Option<i64>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
}

impl JobUpdate {
    /// Marks the job as picked up by a worker.
    pub fn processing(started_at: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Processing),
            started_at: Some(Some(started_at)),
            ..Default::default()
        }
    }

    /// Marks the job as successfully completed.
    pub fn completed(result_location: String, processing_time_ms: i64) -> Self {
        Self {
            status: Some(JobStatus::Completed),
            result_location: Some(Some(result_location)),
            processing_time_ms: Some(Some(processing_time_ms)),
            completed_at: Some(Some(Utc::now())),
            error_message: Some(None),
            ..Default::default()
        }
    }

    /// Marks the job as terminally failed with the given error message.
    pub fn failed(error_message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(Some(error_message.into())),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        }
    }

    /// Resets the job to `Queued`, clearing the previous attempt's state.
    ///
    /// Used both by administrative retries and by the recovery sweep when
    /// re-admitting a stranded job.
    pub fn requeued() -> Self {
        Self {
            status: Some(JobStatus::Queued),
            error_message: Some(None),
            result_location: Some(None),
            processing_time_ms: Some(None),
            started_at: Some(None),
            completed_at: Some(None),
        }
    }
}
