//! The bounded-concurrency processing queue.
//!
//! A fixed-interval admission loop moves pending items into execution while
//! the number of in-flight operations stays under the concurrency ceiling.
//! Expedited items jump the pending line; running work is never preempted.
//! Provider failures are classified per [`ProviderError`] and handled with
//! error-specific cooldown and retry policy; items that exhaust their retries
//! (or fail unclassifiably) are handed to the injected discard handler, which
//! owns the store-side `failed` transition.
//!
//! The queue owns only its in-memory pending list, running set, and cooldown
//! window; it never touches durable job state.

use std::{
    collections::{HashSet, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::future::BoxFuture;
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

use crate::{
    analyzer::ProviderError,
    job::{JobId, Priority},
};

/// The executable unit of work wrapped by a queue item.
///
/// Must be re-invokable: the same operation runs again on each retry.
pub type Operation = Arc<dyn Fn() -> BoxFuture<'static, Result<(), ProviderError>> + Send + Sync>;

/// Invoked when an item is dropped as permanently failed.
pub type DiscardHandler = Arc<dyn Fn(JobId, ProviderError) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Ceiling on concurrently executing operations.
    pub max_concurrency: usize,
    /// Granularity of the admission loop.
    pub tick_interval: Duration,
    /// Retries per item before it is dropped as permanently failed.
    pub max_retries: u16,
    /// Global admission cooldown after a rate-limit signal.
    pub rate_limit_cooldown: Duration,
    /// Shorter global cooldown after a transient overload.
    pub overload_cooldown: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            tick_interval: Duration::from_secs(1),
            max_retries: 3,
            rate_limit_cooldown: Duration::from_secs(60),
            overload_cooldown: Duration::from_secs(30),
        }
    }
}

/// Point-in-time queue introspection.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct QueueStatus {
    pub pending_count: usize,
    pub processing_count: usize,
    pub max_concurrency: usize,
}

struct QueueItem {
    job_id: JobId,
    priority: Priority,
    retry_count: u16,
    operation: Operation,
}

struct QueueState {
    pending: VecDeque<QueueItem>,
    running: HashSet<JobId>,
    max_concurrency: usize,
    cooldown_until: Option<Instant>,
}

enum Message {
    Terminate,
}

struct AdmissionHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: JoinHandle<()>,
}

enum Placement {
    Front,
    Back,
}

struct QueueCore {
    config: QueueConfig,
    state: Mutex<QueueState>,
    on_discard: DiscardHandler,
    paused: AtomicBool,
}

#[derive(Clone)]
pub struct ProcessingQueue {
    core: Arc<QueueCore>,
    admission: Arc<Mutex<Option<AdmissionHandle>>>,
}

impl ProcessingQueue {
    /// Creates the queue and spawns its admission loop.
    pub fn start(config: QueueConfig, on_discard: DiscardHandler) -> Self {
        let core = Arc::new(QueueCore {
            state: Mutex::new(QueueState {
                pending: VecDeque::new(),
                running: HashSet::new(),
                max_concurrency: config.max_concurrency,
                cooldown_until: None,
            }),
            config,
            on_discard,
            paused: AtomicBool::new(false),
        });

        let (sender, mut rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn({
            let core = Arc::clone(&core);
            async move {
                let mut interval = tokio::time::interval(core.config.tick_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => QueueCore::admit_next(&core),
                        _ = rx.recv() => break,
                    }
                }
                tracing::debug!("Shutting down queue admission loop");
            }
        });

        Self {
            core,
            admission: Arc::new(Mutex::new(Some(AdmissionHandle { sender, handle }))),
        }
    }

    /// Adds a job to the pending list.
    ///
    /// Idempotent per job id: if the job is already queued or currently
    /// processing the call is a logged no-op, so no job can ever have two
    /// concurrent executions.
    pub fn enqueue(&self, job_id: JobId, priority: Priority, operation: Operation) {
        let mut state = self.core.state();
        if state.running.contains(&job_id)
            || state.pending.iter().any(|item| item.job_id == job_id)
        {
            tracing::warn!(%job_id, "Job already queued or processing, skipping enqueue");
            return;
        }
        let item = QueueItem {
            job_id,
            priority,
            retry_count: 0,
            operation,
        };
        match priority {
            Priority::Expedited => state.pending.push_front(item),
            Priority::Batch => state.pending.push_back(item),
        }
        tracing::debug!(
            %job_id,
            ?priority,
            pending = state.pending.len(),
            processing = state.running.len(),
            "Queued job"
        );
    }

    /// Stops admitting new work. Idempotent; running operations finish.
    pub fn pause(&self) {
        self.core.paused.store(true, Ordering::Relaxed);
        tracing::debug!("Queue admission paused");
    }

    /// Restarts admission after [`ProcessingQueue::pause`]. Idempotent.
    pub fn resume(&self) {
        self.core.paused.store(false, Ordering::Relaxed);
        tracing::debug!("Queue admission resumed");
    }

    /// Updates the concurrency ceiling for future admissions.
    ///
    /// Does not preempt already-running work.
    pub fn set_max_concurrency(&self, max_concurrency: usize) {
        self.core.state().max_concurrency = max_concurrency;
        tracing::debug!(max_concurrency, "Updated concurrency ceiling");
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.core.state();
        QueueStatus {
            pending_count: state.pending.len(),
            processing_count: state.running.len(),
            max_concurrency: state.max_concurrency,
        }
    }

    /// Stops the admission loop; in-flight operations are allowed to finish.
    pub async fn graceful_shutdown(&self) -> Result<(), QueueError> {
        let Some(admission) = self.admission.lock().unwrap_or_else(PoisonError::into_inner).take()
        else {
            return Ok(());
        };
        admission
            .sender
            .send(Message::Terminate)
            .map_err(|_| QueueError::GracefulShutdownFailed)?;
        admission
            .handle
            .await
            .map_err(|_| QueueError::GracefulShutdownFailed)
    }
}

impl QueueCore {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One admission attempt: dequeues the head of the pending list and
    /// begins execution, provided capacity allows and no cooldown is active.
    fn admit_next(core: &Arc<Self>) {
        if core.paused.load(Ordering::Relaxed) {
            return;
        }
        let item = {
            let mut state = core.state();
            if let Some(until) = state.cooldown_until {
                if Instant::now() < until {
                    tracing::trace!(remaining = ?(until - Instant::now()), "Cooldown active");
                    return;
                }
                state.cooldown_until = None;
            }
            if state.running.len() >= state.max_concurrency {
                return;
            }
            let Some(item) = state.pending.pop_front() else {
                return;
            };
            state.running.insert(item.job_id);
            tracing::debug!(
                job_id = %item.job_id,
                processing = state.running.len(),
                max_concurrency = state.max_concurrency,
                "Starting job"
            );
            item
        };
        tokio::spawn({
            let core = Arc::clone(core);
            async move {
                let job_id = item.job_id;
                match (item.operation)().await {
                    Ok(()) => {
                        core.state().running.remove(&job_id);
                        tracing::debug!(%job_id, "Job finished");
                    }
                    Err(error) => core.handle_error(item, error).await,
                }
            }
        });
    }

    async fn handle_error(&self, item: QueueItem, error: ProviderError) {
        let job_id = item.job_id;
        match &error {
            ProviderError::RateLimited(_) => {
                tracing::warn!(%job_id, ?error, "Rate limited, activating cooldown");
                self.begin_cooldown(self.config.rate_limit_cooldown);
                self.requeue_or_discard(item, error, Placement::Front).await;
            }
            ProviderError::Overloaded(_) => {
                tracing::warn!(%job_id, ?error, "Provider overloaded, activating cooldown");
                self.begin_cooldown(self.config.overload_cooldown);
                self.requeue_or_discard(item, error, Placement::Back).await;
            }
            ProviderError::Exhausted(_) => {
                // Operator-actionable: nothing will succeed until credits are
                // restored, so hold the item and stop admissions until an
                // external resume().
                tracing::error!(%job_id, ?error, "Provider resources exhausted, pausing queue");
                let mut state = self.state();
                state.running.remove(&job_id);
                state.pending.push_front(item);
                drop(state);
                self.paused.store(true, Ordering::Relaxed);
            }
            ProviderError::Other(_) => {
                self.state().running.remove(&job_id);
                tracing::error!(%job_id, ?error, "Job failed, discarding");
                (self.on_discard)(job_id, error).await;
            }
        }
    }

    fn begin_cooldown(&self, duration: Duration) {
        self.state().cooldown_until = Some(Instant::now() + duration);
    }

    async fn requeue_or_discard(
        &self,
        mut item: QueueItem,
        error: ProviderError,
        placement: Placement,
    ) {
        let job_id = item.job_id;
        // The state lock must be released before awaiting the discard
        // handler, so the decision is made in an inner scope.
        let requeued = {
            let mut state = self.state();
            state.running.remove(&job_id);
            if item.retry_count < self.config.max_retries {
                item.retry_count += 1;
                tracing::warn!(
                    %job_id,
                    retry = item.retry_count,
                    max_retries = self.config.max_retries,
                    "Requeued job for retry"
                );
                match placement {
                    Placement::Front => state.pending.push_front(item),
                    Placement::Back => state.pending.push_back(item),
                }
                true
            } else {
                false
            }
        };
        if !requeued {
            tracing::error!(%job_id, "Job exceeded max retries, discarding");
            (self.on_discard)(job_id, error).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("failed to gracefully shut down the admission loop")]
    GracefulShutdownFailed,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::{sync::watch, time};

    use super::*;

    fn noop_discard() -> (DiscardHandler, Arc<Mutex<Vec<(JobId, ProviderError)>>>) {
        let discarded = Arc::new(Mutex::new(Vec::new()));
        let handler: DiscardHandler = Arc::new({
            let discarded = Arc::clone(&discarded);
            move |job_id, error| {
                let discarded = Arc::clone(&discarded);
                Box::pin(async move {
                    discarded.lock().unwrap().push((job_id, error));
                })
            }
        });
        (handler, discarded)
    }

    fn counting_operation(counter: Arc<AtomicUsize>) -> Operation {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    fn failing_operation(
        counter: Arc<AtomicUsize>,
        error: ProviderError,
    ) -> Operation {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            let error = error.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(error)
            })
        })
    }

    /// Blocks until the watch flips to true, tracking peak concurrency.
    fn gated_operation(
        release: watch::Receiver<bool>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> Operation {
        Arc::new(move || {
            let mut release = release.clone();
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            Box::pin(async move {
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                while !*release.borrow() {
                    release.changed().await.unwrap();
                }
                current.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn ticks(n: u64) {
        for _ in 0..n {
            time::advance(Duration::from_secs(1)).await;
        }
    }

    fn test_config() -> QueueConfig {
        QueueConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_ceiling_respected() {
        let (handler, _) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let (release_tx, release_rx) = watch::channel(false);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..10 {
            queue.enqueue(
                JobId::new(),
                Priority::Batch,
                gated_operation(release_rx.clone(), Arc::clone(&current), Arc::clone(&peak)),
            );
        }

        ticks(12).await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        let status = queue.status();
        assert_eq!(status.processing_count, 3);
        assert_eq!(status.pending_count, 7);
        assert_eq!(status.max_concurrency, 3);

        release_tx.send(true).unwrap();
        ticks(12).await;
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(queue.status().pending_count, 0);
        assert_eq!(queue.status().processing_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expedited_jumps_pending_line() {
        let (handler, _) = noop_discard();
        let queue = ProcessingQueue::start(
            QueueConfig {
                max_concurrency: 1,
                ..test_config()
            },
            handler,
        );
        let order = Arc::new(Mutex::new(Vec::new()));
        let recording = |label: &'static str| -> Operation {
            let order = Arc::clone(&order);
            Arc::new(move || {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push(label);
                    Ok(())
                })
            })
        };

        queue.enqueue(JobId::new(), Priority::Batch, recording("batch-1"));
        queue.enqueue(JobId::new(), Priority::Batch, recording("batch-2"));
        queue.enqueue(JobId::new(), Priority::Batch, recording("batch-3"));
        queue.enqueue(JobId::new(), Priority::Expedited, recording("expedited"));

        ticks(6).await;

        assert_eq!(
            *order.lock().unwrap(),
            vec!["expedited", "batch-1", "batch-2", "batch-3"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_enqueue_is_skipped() {
        let (handler, _) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let (release_tx, release_rx) = watch::channel(false);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let duplicate_runs = Arc::new(AtomicUsize::new(0));

        let job_id = JobId::new();
        queue.enqueue(
            job_id,
            Priority::Batch,
            gated_operation(release_rx, Arc::clone(&current), Arc::clone(&peak)),
        );
        // Still pending.
        queue.enqueue(
            job_id,
            Priority::Batch,
            counting_operation(Arc::clone(&duplicate_runs)),
        );

        ticks(2).await;
        assert_eq!(queue.status().processing_count, 1);

        // Now processing.
        queue.enqueue(
            job_id,
            Priority::Expedited,
            counting_operation(Arc::clone(&duplicate_runs)),
        );

        release_tx.send(true).unwrap();
        ticks(4).await;

        assert_eq!(duplicate_runs.load(Ordering::SeqCst), 0);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status().pending_count, 0);
        assert_eq!(queue.status().processing_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_retries_then_discards() {
        let (handler, discarded) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let attempts = Arc::new(AtomicUsize::new(0));
        let bystander_attempts = Arc::new(AtomicUsize::new(0));

        let job_id = JobId::new();
        queue.enqueue(
            job_id,
            Priority::Batch,
            failing_operation(
                Arc::clone(&attempts),
                ProviderError::RateLimited("429".to_owned()),
            ),
        );
        queue.enqueue(
            JobId::new(),
            Priority::Batch,
            counting_operation(Arc::clone(&bystander_attempts)),
        );

        // First attempt, then a 60s cooldown during which nothing is admitted.
        ticks(2).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        ticks(30).await;
        assert_eq!(bystander_attempts.load(Ordering::SeqCst), 0);

        // 3 retries + initial attempt, each behind its own cooldown.
        ticks(250).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        let discarded = discarded.lock().unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].0, job_id);
        assert_matches::assert_matches!(discarded[0].1, ProviderError::RateLimited(_));
    }

    #[tokio::test(start_paused = true)]
    async fn overload_requeues_at_tail() {
        let (handler, _) = noop_discard();
        let queue = ProcessingQueue::start(
            QueueConfig {
                max_concurrency: 1,
                overload_cooldown: Duration::from_secs(5),
                ..test_config()
            },
            handler,
        );
        let order = Arc::new(Mutex::new(Vec::new()));

        let overloaded_once = {
            let order = Arc::clone(&order);
            let failed = Arc::new(AtomicBool::new(false));
            let operation: Operation = Arc::new(move || {
                let order = Arc::clone(&order);
                let failed = Arc::clone(&failed);
                Box::pin(async move {
                    order.lock().unwrap().push("flaky");
                    if failed.swap(true, Ordering::SeqCst) {
                        Ok(())
                    } else {
                        Err(ProviderError::Overloaded("500".to_owned()))
                    }
                })
            });
            operation
        };
        let steady: Operation = {
            let order = Arc::clone(&order);
            Arc::new(move || {
                let order = Arc::clone(&order);
                Box::pin(async move {
                    order.lock().unwrap().push("steady");
                    Ok(())
                })
            })
        };

        queue.enqueue(JobId::new(), Priority::Batch, overloaded_once);
        queue.enqueue(JobId::new(), Priority::Batch, steady);

        ticks(20).await;

        // The overloaded item goes to the back of the line after failing.
        assert_eq!(*order.lock().unwrap(), vec!["flaky", "steady", "flaky"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_pauses_queue_until_resumed() {
        let (handler, discarded) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let attempts = Arc::new(AtomicUsize::new(0));

        queue.enqueue(
            JobId::new(),
            Priority::Batch,
            failing_operation(
                Arc::clone(&attempts),
                ProviderError::Exhausted("credit balance too low".to_owned()),
            ),
        );

        ticks(2).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        // Paused: the item is held at the head but never admitted.
        ticks(120).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(queue.status().pending_count, 1);
        assert!(discarded.lock().unwrap().is_empty());

        queue.resume();
        ticks(2).await;
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_discard_without_retry() {
        let (handler, discarded) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let attempts = Arc::new(AtomicUsize::new(0));

        let job_id = JobId::new();
        queue.enqueue(
            job_id,
            Priority::Batch,
            failing_operation(
                Arc::clone(&attempts),
                ProviderError::Other("invalid request".to_owned()),
            ),
        );

        ticks(5).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_eq!(discarded.lock().unwrap().len(), 1);
        assert_eq!(queue.status().pending_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn set_max_concurrency_applies_to_future_admissions() {
        let (handler, _) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let (release_tx, release_rx) = watch::channel(false);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        queue.set_max_concurrency(1);
        for _ in 0..4 {
            queue.enqueue(
                JobId::new(),
                Priority::Batch,
                gated_operation(release_rx.clone(), Arc::clone(&current), Arc::clone(&peak)),
            );
        }

        ticks(6).await;
        assert_eq!(queue.status().processing_count, 1);

        release_tx.send(true).unwrap();
        ticks(6).await;
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn graceful_shutdown_stops_admissions() {
        let (handler, _) = noop_discard();
        let queue = ProcessingQueue::start(test_config(), handler);
        let attempts = Arc::new(AtomicUsize::new(0));

        queue.graceful_shutdown().await.unwrap();
        // Idempotent.
        queue.graceful_shutdown().await.unwrap();

        queue.enqueue(
            JobId::new(),
            Priority::Batch,
            counting_operation(Arc::clone(&attempts)),
        );
        ticks(5).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 0);
        assert_eq!(queue.status().pending_count, 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn retries_and_discard_complete_on_a_multi_thread_runtime() {
        let (handler, discarded) = noop_discard();
        let queue = ProcessingQueue::start(
            QueueConfig {
                tick_interval: Duration::from_millis(2),
                rate_limit_cooldown: Duration::from_millis(5),
                max_retries: 1,
                ..QueueConfig::default()
            },
            handler,
        );
        let attempts = Arc::new(AtomicUsize::new(0));

        let job_id = JobId::new();
        queue.enqueue(
            job_id,
            Priority::Batch,
            failing_operation(
                Arc::clone(&attempts),
                ProviderError::RateLimited("429".to_owned()),
            ),
        );

        for _ in 0..500 {
            if !discarded.lock().unwrap().is_empty() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        let discarded = discarded.lock().unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].0, job_id);
    }
}
