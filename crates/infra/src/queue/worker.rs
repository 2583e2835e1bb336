//! Broker consumer: claims queued jobs and runs them through a handler.
//!
//! The computation itself lives outside this crate; a worker process injects
//! it as a [`JobHandler`]. While a job runs the worker watches for a stop
//! command for its key and abandons the handler when one arrives.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use esprr_core::JobKey;

use super::client::{QueueError, WorkerQueue};
use super::types::{JobPayload, ABANDONED_JOB_DETAIL};

/// Error raised by a handler. The message stays broker-side.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct JobFailure(pub String);

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Computes system data for one job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, payload: &JobPayload) -> Result<(), JobFailure>;
}

#[async_trait]
impl<F> JobHandler for F
where
    F: Fn(&JobPayload) -> Result<(), JobFailure> + Send + Sync,
{
    async fn run(&self, payload: &JobPayload) -> Result<(), JobFailure> {
        self(payload)
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct JobWorkerConfig {
    /// How long to wait before polling an empty queue again
    pub poll_interval: Duration,
    /// Name for logging
    pub name: String,
}

impl Default for JobWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            name: "system-data-worker".to_string(),
        }
    }
}

impl JobWorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded(JobKey),
    Failed(JobKey),
    TimedOut(JobKey),
    /// Stopped while running, or removed before its result was recorded.
    Cancelled(JobKey),
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_timed_out: u64,
    pub jobs_cancelled: u64,
    pub claim_errors: u64,
}

impl WorkerStats {
    fn record(&mut self, outcome: &JobOutcome) {
        self.jobs_processed += 1;
        match outcome {
            JobOutcome::Succeeded(_) => self.jobs_succeeded += 1,
            JobOutcome::Failed(_) => self.jobs_failed += 1,
            JobOutcome::TimedOut(_) => self.jobs_timed_out += 1,
            JobOutcome::Cancelled(_) => self.jobs_cancelled += 1,
        }
    }
}

/// Polls the broker for queued jobs and runs them one at a time.
pub struct JobWorker<Q, H> {
    queue: Q,
    handler: H,
    config: JobWorkerConfig,
}

impl<Q, H> JobWorker<Q, H>
where
    Q: WorkerQueue,
    H: JobHandler,
{
    pub fn new(queue: Q, handler: H, config: JobWorkerConfig) -> Self {
        Self {
            queue,
            handler,
            config,
        }
    }

    /// Claim and run a single job. `None` when the queue is empty.
    pub async fn work_one(&self) -> Result<Option<JobOutcome>, QueueError> {
        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        debug!(worker = %self.config.name, job_key = %job.key, "claimed job");

        let run = tokio::time::timeout(job.options.timeout, self.handler.run(&job.payload));
        let stop = async {
            if let Err(e) = self.queue.stop_requested(&job.key).await {
                warn!(job_key = %job.key, error = %e, "cannot watch for stop commands");
                std::future::pending::<()>().await;
            }
        };
        let result = tokio::select! {
            result = run => result,
            () = stop => {
                info!(worker = %self.config.name, job_key = %job.key, "job stopped on request");
                return Ok(Some(JobOutcome::Cancelled(job.key.clone())));
            }
        };

        let (applied, outcome) = match result {
            Ok(Ok(())) => (
                self.queue.complete(&job.key).await?,
                JobOutcome::Succeeded(job.key.clone()),
            ),
            Ok(Err(failure)) => {
                debug!(job_key = %job.key, error = %failure, "job failed");
                (
                    self.queue.fail(&job.key, &failure.0).await?,
                    JobOutcome::Failed(job.key.clone()),
                )
            }
            Err(_) => {
                warn!(job_key = %job.key, timeout = ?job.options.timeout, "job timed out");
                (
                    self.queue.fail(&job.key, ABANDONED_JOB_DETAIL).await?,
                    JobOutcome::TimedOut(job.key.clone()),
                )
            }
        };

        if !applied {
            debug!(job_key = %job.key, "job was removed while running");
            return Ok(Some(JobOutcome::Cancelled(job.key)));
        }
        Ok(Some(outcome))
    }

    /// Work until `cancel` fires. The job in progress is always finished.
    pub async fn run(&self, cancel: CancellationToken) -> WorkerStats {
        info!(worker = %self.config.name, "job worker started");
        let mut stats = WorkerStats::default();

        while !cancel.is_cancelled() {
            let idle = match self.work_one().await {
                Ok(Some(outcome)) => {
                    stats.record(&outcome);
                    false
                }
                Ok(None) => true,
                Err(e) => {
                    stats.claim_errors += 1;
                    error!(worker = %self.config.name, error = %e, "failed to process job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(
            worker = %self.config.name,
            processed = stats.jobs_processed,
            "job worker stopped"
        );
        stats
    }
}
