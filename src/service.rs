//! The analysis service: ties the store, queue, analyzer, and webhook
//! dispatcher together.
//!
//! The service owns all durable state transitions. The queue only ever sees
//! an opaque operation per job plus a discard handler; when the queue drops a
//! job as permanently failed, the handler (installed here) records the
//! failure and fires the failure webhook.

use std::{sync::Arc, time::Duration};

use chrono::Utc;
use thiserror::Error;

use crate::{
    analyzer::{AnalysisRequest, BookAnalyzer, ProviderError},
    job::{Job, JobId, JobStatus, JobUpdate, NewJob, Priority},
    queue::{DiscardHandler, Operation, ProcessingQueue, QueueConfig, QueueError, QueueStatus},
    recovery::RecoveryConfig,
    store::{JobStore, StoreError},
    webhook::{EventType, RetryLoopHandle, WebhookConfig, WebhookDispatcher, WebhookError},
};

/// One book analysis submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub title: String,
    pub author: String,
    pub genre: String,
    pub purpose: String,
    pub audience: String,
    pub priority: Priority,
    pub idempotency_key: Option<String>,
    pub webhook_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Cost in dollars charged for a batch-priority analysis.
    pub batch_cost: f64,
    /// Cost in dollars charged for an expedited analysis.
    pub expedited_cost: f64,
    /// Delay between re-enqueues in bulk retry and recovery passes, so a
    /// large batch doesn't land on the provider at once.
    pub retry_pacing: Duration,
    pub queue: QueueConfig,
    pub webhook: WebhookConfig,
    pub recovery: RecoveryConfig,
}

impl ServiceConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            batch_cost: 0.03,
            expedited_cost: 0.06,
            retry_pacing: Duration::from_millis(100),
            queue: QueueConfig::default(),
            webhook: WebhookConfig::new(webhook_secret),
            recovery: RecoveryConfig::default(),
        }
    }

    fn cost_for(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Batch => self.batch_cost,
            Priority::Expedited => self.expedited_cost,
        }
    }
}

/// Outcome of a bulk retry pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrySummary {
    pub retried: usize,
    pub errors: usize,
}

pub struct AnalysisService<S: JobStore> {
    pub(crate) store: S,
    pub(crate) analyzer: Arc<dyn BookAnalyzer>,
    pub(crate) webhooks: WebhookDispatcher<S>,
    pub(crate) queue: ProcessingQueue,
    pub(crate) config: Arc<ServiceConfig>,
    retry_loop: Arc<std::sync::Mutex<Option<RetryLoopHandle>>>,
}

impl<S: JobStore> Clone for AnalysisService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            analyzer: Arc::clone(&self.analyzer),
            webhooks: self.webhooks.clone(),
            queue: self.queue.clone(),
            config: Arc::clone(&self.config),
            retry_loop: Arc::clone(&self.retry_loop),
        }
    }
}

impl<S: JobStore> AnalysisService<S> {
    /// Builds the service and spawns its background loops: the queue's
    /// admission loop and the webhook retry scan.
    pub fn start(
        store: S,
        analyzer: Arc<dyn BookAnalyzer>,
        config: ServiceConfig,
    ) -> Result<Self, ServiceError> {
        let webhooks = WebhookDispatcher::new(store.clone(), config.webhook.clone())?;
        let on_discard: DiscardHandler = Arc::new({
            let store = store.clone();
            let webhooks = webhooks.clone();
            move |job_id, error| {
                let store = store.clone();
                let webhooks = webhooks.clone();
                Box::pin(async move {
                    match store
                        .update_job(job_id, JobUpdate::failed(error.to_string()))
                        .await
                    {
                        Ok(Some(job)) => webhooks.notify(&job, EventType::Failed).await,
                        Ok(None) => {
                            tracing::warn!(%job_id, "Discarded job no longer in store")
                        }
                        Err(store_error) => {
                            tracing::error!(?store_error, %job_id, "Failed to record job failure")
                        }
                    }
                })
            }
        });
        let queue = ProcessingQueue::start(config.queue.clone(), on_discard);
        let retry_loop = webhooks.start_retry_loop();
        Ok(Self {
            store,
            analyzer,
            webhooks,
            queue,
            config: Arc::new(config),
            retry_loop: Arc::new(std::sync::Mutex::new(Some(retry_loop))),
        })
    }

    /// Accepts a new analysis, persists it as `Queued`, and enqueues it.
    ///
    /// When the request carries an idempotency key already seen, the original
    /// job is returned unchanged and nothing is enqueued.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job, ServiceError> {
        if let Some(key) = request.idempotency_key.as_deref() {
            if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                tracing::debug!(
                    job_id = %existing.id,
                    idempotency_key = key,
                    "Returning existing job for repeated submission"
                );
                return Ok(existing);
            }
        }
        let cost = self.config.cost_for(request.priority);
        let created = self
            .store
            .create_job(NewJob {
                title: request.title,
                author: request.author,
                genre: request.genre,
                purpose: request.purpose,
                audience: request.audience,
                priority: request.priority,
                cost,
                idempotency_key: request.idempotency_key.clone(),
                webhook_url: request.webhook_url,
            })
            .await;
        let job = match created {
            Ok(job) => job,
            Err(StoreError::Validation(message)) => {
                // A concurrent submission may have claimed the key between
                // the lookup above and the insert; the winner's job is the
                // answer either way.
                if let Some(key) = request.idempotency_key.as_deref() {
                    if let Some(existing) = self.store.find_by_idempotency_key(key).await? {
                        tracing::debug!(
                            job_id = %existing.id,
                            idempotency_key = key,
                            "Lost a submission race, returning existing job"
                        );
                        return Ok(existing);
                    }
                }
                return Err(StoreError::Validation(message).into());
            }
            Err(error) => return Err(error.into()),
        };
        tracing::info!(job_id = %job.id, priority = ?job.priority, cost, "Accepted analysis job");
        self.enqueue_job(&job);
        Ok(job)
    }

    pub async fn job(&self, id: JobId) -> Result<Job, ServiceError> {
        self.store.job(id).await?.ok_or(ServiceError::NotFound(id))
    }

    pub async fn list_jobs(
        &self,
        limit: usize,
        offset: usize,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, ServiceError> {
        Ok(self.store.list_jobs(limit, offset, status).await?)
    }

    pub async fn count_jobs(&self, status: Option<JobStatus>) -> Result<u64, ServiceError> {
        Ok(self.store.count_jobs(status).await?)
    }

    /// Resets one failed job to `Queued` and re-enqueues it.
    pub async fn retry(&self, id: JobId) -> Result<Job, ServiceError> {
        let job = self.job(id).await?;
        if job.status != JobStatus::Failed {
            return Err(ServiceError::InvalidState(id));
        }
        let job = self
            .store
            .update_job(id, JobUpdate::requeued())
            .await?
            .ok_or(ServiceError::NotFound(id))?;
        tracing::info!(job_id = %id, "Retrying failed job");
        self.enqueue_job(&job);
        Ok(job)
    }

    /// Re-enqueues failed jobs in bulk, pacing the enqueues.
    ///
    /// With `only_unexplained` set, only failed jobs without an error message
    /// are retried; those are jobs interrupted without ever recording a
    /// failure, typically by a crash or redeploy mid-processing.
    pub async fn retry_all_failed(
        &self,
        only_unexplained: bool,
    ) -> Result<RetrySummary, ServiceError> {
        const PAGE: usize = 100;
        let mut failed = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .store
                .list_jobs(PAGE, offset, Some(JobStatus::Failed))
                .await?;
            let len = page.len();
            failed.extend(page);
            if len < PAGE {
                break;
            }
            offset += PAGE;
        }
        if only_unexplained {
            failed.retain(|job| job.error_message.is_none());
        }

        let mut summary = RetrySummary::default();
        for job in failed {
            match self.retry(job.id).await {
                Ok(_) => summary.retried += 1,
                Err(error) => {
                    tracing::error!(?error, job_id = %job.id, "Failed to retry job");
                    summary.errors += 1;
                }
            }
            tokio::time::sleep(self.config.retry_pacing).await;
        }
        tracing::info!(
            retried = summary.retried,
            errors = summary.errors,
            only_unexplained,
            "Bulk retry pass finished"
        );
        Ok(summary)
    }

    pub fn pause_queue(&self) {
        self.queue.pause();
    }

    pub fn resume_queue(&self) {
        self.queue.resume();
    }

    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.queue.set_max_concurrency(max_concurrency);
    }

    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// Stops the admission and webhook retry loops. In-flight operations are
    /// allowed to finish.
    pub async fn graceful_shutdown(&self) -> Result<(), ServiceError> {
        self.queue.graceful_shutdown().await?;
        let retry_loop = self
            .retry_loop
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(retry_loop) = retry_loop {
            retry_loop.graceful_shutdown().await?;
        }
        Ok(())
    }

    pub(crate) fn enqueue_job(&self, job: &Job) {
        self.queue
            .enqueue(job.id, job.priority, self.operation_for(job));
    }

    fn operation_for(&self, job: &Job) -> Operation {
        let service = self.clone();
        let job_id = job.id;
        let request = AnalysisRequest::from(job);
        Arc::new(move || {
            let service = service.clone();
            let request = request.clone();
            Box::pin(async move { service.process(job_id, request).await })
        })
    }

    /// One processing attempt. Provider failures are returned to the queue
    /// for classification; durable state is only written here for pickup and
    /// success, and by the discard handler for permanent failure.
    async fn process(&self, job_id: JobId, request: AnalysisRequest) -> Result<(), ProviderError> {
        let started_at = Utc::now();
        self.store
            .update_job(job_id, JobUpdate::processing(started_at))
            .await
            .map_err(ProviderError::other)?;

        let outcome = self.analyzer.analyze(&request).await?;

        let elapsed_ms = (Utc::now() - started_at).num_milliseconds();
        tracing::info!(
            %job_id,
            input_tokens = outcome.usage.input_tokens,
            output_tokens = outcome.usage.output_tokens,
            elapsed_ms,
            "Analysis completed"
        );
        let updated = self
            .store
            .update_job(
                job_id,
                JobUpdate::completed(result_location(job_id), elapsed_ms),
            )
            .await
            .map_err(ProviderError::other)?;
        match updated {
            Some(job) => self.webhooks.notify(&job, EventType::Completed).await,
            None => tracing::warn!(%job_id, "Completed job no longer in store"),
        }
        Ok(())
    }
}

/// Where a completed job's documents are served from.
pub fn result_location(id: JobId) -> String {
    format!("/api/v1/analyses/{id}/documents")
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {0} is not in a retryable state")]
    InvalidState(JobId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Webhook(#[from] WebhookError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}
