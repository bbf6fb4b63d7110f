//! Durable storage contract for jobs and webhook delivery records.
//!
//! The store is the single source of truth for durable state. Implementations
//! must serialize concurrent updates to the same job id (no lost updates) and
//! must serve status-filtered reads from a consistent snapshot: the recovery
//! sweep's `processing` query and the queue's updates race, and a half-applied
//! row must never be observed.
//!
//! [`memory::InMemoryStore`] is a correct reference implementation. A
//! relational implementation is a drop-in for the same trait; for
//! correctness and performance it needs a uniqueness constraint on the
//! idempotency key and an index on the job status column.

use async_trait::async_trait;
use chrono::TimeDelta;
use thiserror::Error;

use crate::{
    job::{Job, JobId, JobStatus, JobUpdate, NewJob},
    webhook::{DeliveryId, DeliveryUpdate, NewDelivery, WebhookDelivery},
};

pub mod memory;

#[async_trait]
pub trait JobStore: Clone + Send + Sync + 'static {
    /// Creates a new job with status from `new` and store-assigned id and
    /// timestamps.
    ///
    /// Fails with [`StoreError::Validation`] if required fields are missing.
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError>;

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Applies a partial update, bumping `updated_at`.
    ///
    /// Returns `None` for an unknown id rather than an error; callers must
    /// check.
    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, StoreError>;

    /// Lists jobs ordered newest-created-first.
    async fn list_jobs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError>;

    async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, StoreError>;

    /// Looks up a job by its idempotency key.
    ///
    /// Keys are unique: a second submission with the same key must be handed
    /// the existing job unchanged.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError>;

    /// Jobs stuck in `Processing` whose `started_at` is older than
    /// `stale_after`, presumed orphaned by a crashed worker.
    async fn stranded_jobs(&self, stale_after: TimeDelta) -> Result<Vec<Job>, StoreError>;

    async fn create_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery, StoreError>;

    async fn delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError>;

    async fn update_delivery(
        &self,
        id: DeliveryId,
        update: DeliveryUpdate,
    ) -> Result<Option<WebhookDelivery>, StoreError>;

    /// Deliveries still pending with fewer than `max_attempts` attempts,
    /// oldest first.
    async fn pending_deliveries(&self, max_attempts: u32)
        -> Result<Vec<WebhookDelivery>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("store in bad state")]
    BadState,
}
