//! Startup recovery of jobs stranded mid-processing.
//!
//! A job stuck in `Processing` whose `started_at` is older than the stale
//! threshold was orphaned by a crashed or redeployed worker; its in-memory
//! queue entry is gone and nothing will ever finish it. The sweep runs once
//! at startup, after the queue's loops are up, and re-admits each stranded
//! job from its persisted fields.

use std::time::Duration;

use chrono::TimeDelta;

use crate::{
    job::JobUpdate,
    service::{AnalysisService, ServiceError},
    store::JobStore,
};

#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// How long a job may sit in `Processing` before it is presumed stranded.
    pub stale_after: TimeDelta,
    /// Delay between re-enqueues, so a large recovery batch doesn't land on
    /// the provider at once.
    pub pacing: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stale_after: TimeDelta::minutes(30),
            pacing: Duration::from_millis(100),
        }
    }
}

impl<S: JobStore> AnalysisService<S> {
    /// Requeues every stranded job and returns how many were recovered.
    ///
    /// Fresh `Processing` jobs are left alone: with a shared store they may
    /// legitimately belong to another live worker.
    pub async fn recover_stranded(&self) -> Result<usize, ServiceError> {
        let stranded = self
            .store
            .stranded_jobs(self.config.recovery.stale_after)
            .await?;
        if stranded.is_empty() {
            tracing::debug!("No stranded jobs to recover");
            return Ok(0);
        }
        tracing::warn!(count = stranded.len(), "Recovering stranded jobs");

        let mut recovered = 0;
        for job in stranded {
            match self.store.update_job(job.id, JobUpdate::requeued()).await? {
                Some(job) => {
                    tracing::info!(
                        job_id = %job.id,
                        started_at = ?job.started_at,
                        "Requeued stranded job"
                    );
                    self.enqueue_job(&job);
                    recovered += 1;
                }
                None => tracing::warn!(job_id = %job.id, "Stranded job vanished mid-recovery"),
            }
            tokio::time::sleep(self.config.recovery.pacing).await;
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::{
        analyzer::test::MockAnalyzer,
        job::JobStatus,
        service::tests::{service, submit_request, wait_for_status},
    };

    #[tokio::test]
    async fn stale_processing_jobs_are_requeued_and_finish() {
        let (service, store) = service(MockAnalyzer::default());
        service.pause_queue();

        let stale = service.submit(submit_request()).await.unwrap();
        let fresh = service.submit(submit_request()).await.unwrap();
        store
            .update_job(
                stale.id,
                JobUpdate::processing(Utc::now() - TimeDelta::minutes(40)),
            )
            .await
            .unwrap();
        store
            .update_job(fresh.id, JobUpdate::processing(Utc::now()))
            .await
            .unwrap();

        let recovered = service.recover_stranded().await.unwrap();
        assert_eq!(recovered, 1);

        let requeued = service.job(stale.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Queued);
        assert!(requeued.started_at.is_none());

        // Fresh processing work is untouched.
        assert_eq!(
            service.job(fresh.id).await.unwrap().status,
            JobStatus::Processing
        );

        service.resume_queue();
        wait_for_status(&service, stale.id, JobStatus::Completed).await;
    }

    #[tokio::test]
    async fn recovery_with_nothing_stranded_is_a_no_op() {
        let (service, _) = service(MockAnalyzer::default());

        let job = service.submit(submit_request()).await.unwrap();
        wait_for_status(&service, job.id, JobStatus::Completed).await;

        assert_eq!(service.recover_stranded().await.unwrap(), 0);
    }
}
