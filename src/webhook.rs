//! Signed webhook notifications for terminal job states.
//!
//! Each notification is recorded as a [`WebhookDelivery`] and attempted
//! immediately. Failed attempts are retried on an exponential backoff
//! schedule up to a cap, after which the delivery is terminally failed. A
//! periodic [`WebhookDispatcher::process_retries`] pass re-attempts any
//! delivery still pending, so retries survive a process restart. Delivery is
//! at-least-once: receivers must deduplicate on the delivery id.
//!
//! Payloads are signed with HMAC-SHA256 over the exact JSON body; the hex
//! signature travels in the `X-Signature` header and the event type in
//! `X-Event`. Dispatch failures are recorded on the delivery and never
//! propagate to the job processing flow.

use std::{fmt::Display, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
    backoff::{BackoffStrategy, Exponential, Strategy},
    job::{Job, JobId, JobStatus},
    store::JobStore,
};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Signature";
pub const EVENT_HEADER: &str = "X-Event";
const USER_AGENT: &str = concat!("bindery-webhook/", env!("CARGO_PKG_VERSION"));

/// Opaque unique identifier for a [`WebhookDelivery`].
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub struct DeliveryId(Uuid);

impl DeliveryId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Display for DeliveryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The terminal job state being notified.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize)]
pub enum EventType {
    #[serde(rename = "analysis.completed")]
    Completed,
    #[serde(rename = "analysis.failed")]
    Failed,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "analysis.completed",
            Self::Failed => "analysis.failed",
        }
    }
}

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash)]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

/// One notification record tied to a job.
///
/// Attempt counts only ever increase; once the status is `Sent`, or `Failed`
/// with the attempt cap reached, no further attempts are scheduled.
#[derive(Debug, Clone)]
pub struct WebhookDelivery {
    pub id: DeliveryId,
    pub job_id: JobId,
    pub url: String,
    pub event: EventType,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub job_id: JobId,
    pub url: String,
    pub event: EventType,
}

/// A partial update to a delivery record.
#[derive(Debug, Clone, Default)]
pub struct DeliveryUpdate {
    pub status: Option<DeliveryStatus>,
    pub attempts: Option<u32>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

impl DeliveryUpdate {
    fn attempted(status: DeliveryStatus, attempts: u32) -> Self {
        Self {
            status: Some(status),
            attempts: Some(attempts),
            last_attempt_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared secret for HMAC-SHA256 payload signatures.
    pub secret: String,
    /// Attempt cap after which a delivery is terminally failed.
    pub max_attempts: u32,
    /// Timeout for each outbound POST.
    pub request_timeout: Duration,
    /// Interval of the pending-delivery safety-net scan.
    pub retry_interval: Duration,
    /// Schedule for per-delivery retries.
    pub retry_backoff: BackoffStrategy<Exponential>,
}

impl WebhookConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            max_attempts: 5,
            request_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(60),
            retry_backoff: BackoffStrategy::exponential(TimeDelta::seconds(2))
                .with_max(TimeDelta::seconds(32)),
        }
    }
}

/// The wire payload POSTed to the target url.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookPayload {
    pub event: EventType,
    pub job: JobPayload,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub id: JobId,
    pub book: BookRef,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct BookRef {
    pub title: String,
    pub author: String,
}

impl WebhookPayload {
    fn new(job: &Job, event: EventType) -> Self {
        Self {
            event,
            job: JobPayload {
                id: job.id,
                book: BookRef {
                    title: job.title.clone(),
                    author: job.author.clone(),
                },
                status: job.status,
                result_location: job.result_location.clone(),
                error_message: job.error_message.clone(),
                completed_at: job.completed_at.unwrap_or_else(Utc::now),
            },
            timestamp: Utc::now(),
        }
    }
}

enum Message {
    Terminate,
}

/// Handle to the periodic retry scan spawned by
/// [`WebhookDispatcher::start_retry_loop`].
pub struct RetryLoopHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
}

impl RetryLoopHandle {
    pub async fn graceful_shutdown(mut self) -> Result<(), WebhookError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| WebhookError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| WebhookError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct WebhookDispatcher<S: JobStore> {
    store: S,
    client: reqwest::Client,
    mac: HmacSha256,
    config: Arc<WebhookConfig>,
}

impl<S: JobStore> WebhookDispatcher<S> {
    pub fn new(store: S, config: WebhookConfig) -> Result<Self, WebhookError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|error| WebhookError::Configuration(error.to_string()))?;
        let mac = HmacSha256::new_from_slice(config.secret.as_bytes())
            .map_err(|error| WebhookError::Configuration(error.to_string()))?;
        Ok(Self {
            store,
            client,
            mac,
            config: Arc::new(config),
        })
    }

    /// Records and immediately attempts a notification for the job's
    /// terminal state. No-op if the job has no target url.
    pub async fn notify(&self, job: &Job, event: EventType) {
        let Some(url) = job.webhook_url.clone() else {
            return;
        };
        let delivery = match self
            .store
            .create_delivery(NewDelivery {
                job_id: job.id,
                url,
                event,
            })
            .await
        {
            Ok(delivery) => delivery,
            Err(error) => {
                tracing::error!(?error, job_id = %job.id, "Failed to record webhook delivery");
                return;
            }
        };
        self.attempt_delivery(delivery.id).await;
    }

    /// Attempts one delivery. A 2xx response marks it sent; anything else
    /// (including network errors) is counted and retried per the backoff
    /// schedule. Safe to call on already-terminal deliveries.
    pub async fn attempt_delivery(&self, id: DeliveryId) {
        let delivery = match self.store.delivery(id).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                tracing::warn!(delivery_id = %id, "Webhook delivery not found");
                return;
            }
            Err(error) => {
                tracing::error!(?error, delivery_id = %id, "Failed to load webhook delivery");
                return;
            }
        };
        if delivery.status != DeliveryStatus::Pending
            || delivery.attempts >= self.config.max_attempts
        {
            return;
        }
        let job = match self.store.job(delivery.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(
                    delivery_id = %id,
                    job_id = %delivery.job_id,
                    "Job for webhook delivery not found"
                );
                return;
            }
            Err(error) => {
                tracing::error!(?error, delivery_id = %id, "Failed to load job for delivery");
                return;
            }
        };

        let payload = WebhookPayload::new(&job, delivery.event);
        let body = match serde_json::to_vec(&payload) {
            Ok(body) => body,
            Err(error) => {
                tracing::error!(?error, delivery_id = %id, "Failed to encode webhook payload");
                self.handle_failure(id, delivery.attempts + 1).await;
                return;
            }
        };
        let signature = self.sign(&body);

        let response = self
            .client
            .post(&delivery.url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, signature)
            .header(EVENT_HEADER, delivery.event.as_str())
            .body(body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(delivery_id = %id, "Webhook delivered");
                self.record_update(
                    id,
                    DeliveryUpdate::attempted(DeliveryStatus::Sent, delivery.attempts + 1),
                )
                .await;
            }
            Ok(response) => {
                tracing::warn!(
                    delivery_id = %id,
                    status = response.status().as_u16(),
                    "Webhook delivery failed"
                );
                self.handle_failure(id, delivery.attempts + 1).await;
            }
            Err(error) => {
                tracing::warn!(?error, delivery_id = %id, "Webhook delivery error");
                self.handle_failure(id, delivery.attempts + 1).await;
            }
        }
    }

    async fn handle_failure(&self, id: DeliveryId, attempts: u32) {
        if attempts >= self.config.max_attempts {
            tracing::warn!(delivery_id = %id, attempts, "Webhook delivery failed terminally");
            self.record_update(id, DeliveryUpdate::attempted(DeliveryStatus::Failed, attempts))
                .await;
            return;
        }
        self.record_update(id, DeliveryUpdate::attempted(DeliveryStatus::Pending, attempts))
            .await;

        let delay = self
            .config
            .retry_backoff
            .backoff(attempts.min(u16::MAX.into()) as u16)
            .to_std()
            .unwrap_or_default();
        tracing::debug!(
            delivery_id = %id,
            attempts,
            max_attempts = self.config.max_attempts,
            ?delay,
            "Scheduling webhook retry"
        );
        tokio::spawn({
            let dispatcher = self.clone();
            async move {
                tokio::time::sleep(delay).await;
                dispatcher.attempt_delivery_boxed(id).await;
            }
        });
    }

    // Boxed so the retry task's future doesn't recursively contain itself
    // (attempt_delivery -> handle_failure -> spawned retry).
    fn attempt_delivery_boxed(&self, id: DeliveryId) -> BoxFuture<'_, ()> {
        Box::pin(self.attempt_delivery(id))
    }

    async fn record_update(&self, id: DeliveryId, update: DeliveryUpdate) {
        match self.store.update_delivery(id, update).await {
            Ok(Some(_)) => {}
            Ok(None) => tracing::warn!(delivery_id = %id, "Webhook delivery vanished mid-update"),
            Err(error) => {
                tracing::error!(?error, delivery_id = %id, "Failed to update webhook delivery");
            }
        }
    }

    /// Re-attempts every delivery still pending under the attempt cap.
    ///
    /// Intended to run on a fixed interval as a safety net independent of the
    /// scheduled per-delivery retries, so a process crash doesn't lose
    /// in-flight retries. Safe to call repeatedly; terminal deliveries are
    /// never re-attempted.
    pub async fn process_retries(&self) {
        let pending = match self.store.pending_deliveries(self.config.max_attempts).await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(?error, "Failed to scan pending webhook deliveries");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        tracing::debug!(count = pending.len(), "Processing pending webhook deliveries");
        for delivery in pending {
            self.attempt_delivery(delivery.id).await;
        }
    }

    /// Spawns the periodic [`WebhookDispatcher::process_retries`] scan.
    pub fn start_retry_loop(&self) -> RetryLoopHandle {
        let (sender, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn({
            let dispatcher = self.clone();
            async move {
                let mut interval = tokio::time::interval(dispatcher.config.retry_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first tick completes immediately.
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = interval.tick() => dispatcher.process_retries().await,
                        _ = rx.recv() => break,
                    }
                }
                tracing::debug!("Shutting down webhook retry loop");
            }
        });
        RetryLoopHandle {
            sender,
            handle: Some(handle),
        }
    }

    /// Hex HMAC-SHA256 signature of the payload under the shared secret.
    pub fn sign(&self, payload: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Verifies a hex signature against the payload in constant time.
    pub fn verify(&self, payload: &[u8], signature_hex: &str) -> bool {
        timing_safe_eq(self.sign(payload).as_bytes(), signature_hex.as_bytes())
    }
}

/// Constant-time comparison to avoid leaking the expected signature through
/// timing analysis.
fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (a_byte, b_byte) in a.iter().zip(b.iter()) {
        result |= a_byte ^ b_byte;
    }
    result == 0
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("failed to configure webhook client: {0}")]
    Configuration(String),
    #[error("failed to gracefully shut down the retry loop")]
    GracefulShutdownFailed,
}
