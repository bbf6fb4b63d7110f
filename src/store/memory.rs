//! A simple in-memory implementation of the [`JobStore`] trait.
//!
//! Suitable for tests and single-process deployments; all state is lost on
//! restart (the recovery sweep exists for stores that do survive one).

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};

use super::{JobStore, StoreError};
use crate::{
    job::{Job, JobId, JobStatus, JobUpdate, NewJob},
    webhook::{DeliveryId, DeliveryStatus, DeliveryUpdate, NewDelivery, WebhookDelivery},
};

#[derive(Clone, Debug, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    deliveries: Arc<RwLock<Vec<WebhookDelivery>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn deliveries_for_job(&self, job_id: JobId) -> Vec<WebhookDelivery> {
        self.deliveries
            .read()
            .unwrap()
            .iter()
            .filter(|delivery| delivery.job_id == job_id)
            .cloned()
            .collect()
    }
}

fn validate(new: &NewJob) -> Result<(), StoreError> {
    if new.title.trim().is_empty() {
        return Err(StoreError::Validation("title must not be empty".to_owned()));
    }
    if new.author.trim().is_empty() {
        return Err(StoreError::Validation("author must not be empty".to_owned()));
    }
    Ok(())
}

fn apply_job_update(job: &mut Job, update: JobUpdate) {
    if let Some(status) = update.status {
        job.status = status;
    }
    if let Some(error_message) = update.error_message {
        job.error_message = error_message;
    }
    if let Some(result_location) = update.result_location {
        job.result_location = result_location;
    }
    if let Some(processing_time_ms) = update.processing_time_ms {
        job.processing_time_ms = processing_time_ms;
    }
    if let Some(started_at) = update.started_at {
        job.started_at = started_at;
    }
    if let Some(completed_at) = update.completed_at {
        job.completed_at = completed_at;
    }
    job.updated_at = Utc::now();
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, new: NewJob) -> Result<Job, StoreError> {
        validate(&new)?;
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if let Some(key) = new.idempotency_key.as_deref() {
            if jobs
                .iter()
                .any(|job| job.idempotency_key.as_deref() == Some(key))
            {
                return Err(StoreError::Validation(format!(
                    "idempotency key already in use: {key}"
                )));
            }
        }
        let now = Utc::now();
        let job = Job {
            id: JobId::new(),
            title: new.title,
            author: new.author,
            genre: new.genre,
            purpose: new.purpose,
            audience: new.audience,
            priority: new.priority,
            status: JobStatus::Queued,
            cost: new.cost,
            error_message: None,
            result_location: None,
            idempotency_key: new.idempotency_key,
            webhook_url: new.webhook_url,
            processing_time_ms: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };
        jobs.push(job.clone());
        Ok(job)
    }

    async fn job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn update_job(&self, id: JobId, update: JobUpdate) -> Result<Option<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let Some(job) = jobs.iter_mut().find(|job| job.id == id) else {
            return Ok(None);
        };
        apply_job_update(job, update);
        Ok(Some(job.clone()))
    }

    async fn list_jobs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        let mut matching = jobs
            .iter()
            .filter(|job| status.map_or(true, |status| job.status == status))
            .cloned()
            .collect::<Vec<_>>();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching.into_iter().skip(offset).take(limit).collect())
    }

    async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter()
            .filter(|job| status.map_or(true, |status| job.status == status))
            .count() as u64)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.idempotency_key.as_deref() == Some(key))
            .cloned())
    }

    async fn stranded_jobs(&self, stale_after: TimeDelta) -> Result<Vec<Job>, StoreError> {
        let cutoff = Utc::now() - stale_after;
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| {
                job.status == JobStatus::Processing
                    && job.started_at.is_some_and(|started| started < cutoff)
            })
            .cloned()
            .collect())
    }

    async fn create_delivery(&self, new: NewDelivery) -> Result<WebhookDelivery, StoreError> {
        let mut deliveries = self.deliveries.write().map_err(|_| StoreError::BadState)?;
        let delivery = WebhookDelivery {
            id: DeliveryId::new(),
            job_id: new.job_id,
            url: new.url,
            event: new.event,
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_attempt_at: None,
            created_at: Utc::now(),
        };
        deliveries.push(delivery.clone());
        Ok(delivery)
    }

    async fn delivery(&self, id: DeliveryId) -> Result<Option<WebhookDelivery>, StoreError> {
        Ok(self
            .deliveries
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|delivery| delivery.id == id)
            .cloned())
    }

    async fn update_delivery(
        &self,
        id: DeliveryId,
        update: DeliveryUpdate,
    ) -> Result<Option<WebhookDelivery>, StoreError> {
        let mut deliveries = self.deliveries.write().map_err(|_| StoreError::BadState)?;
        let Some(delivery) = deliveries.iter_mut().find(|delivery| delivery.id == id) else {
            return Ok(None);
        };
        if let Some(status) = update.status {
            delivery.status = status;
        }
        if let Some(attempts) = update.attempts {
            delivery.attempts = attempts;
        }
        if let Some(last_attempt_at) = update.last_attempt_at {
            delivery.last_attempt_at = Some(last_attempt_at);
        }
        Ok(Some(delivery.clone()))
    }

    async fn pending_deliveries(
        &self,
        max_attempts: u32,
    ) -> Result<Vec<WebhookDelivery>, StoreError> {
        let deliveries = self.deliveries.read().map_err(|_| StoreError::BadState)?;
        let mut pending = deliveries
            .iter()
            .filter(|delivery| {
                delivery.status == DeliveryStatus::Pending && delivery.attempts < max_attempts
            })
            .cloned()
            .collect::<Vec<_>>();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }
}
