//! Reconciler: keeps broker jobs consistent with the storage status snapshot.
//!
//! Each step reads a fresh snapshot and fresh broker state right before it
//! decides anything, so a step never acts on data another step already
//! changed. Decisions come from the pure functions in [`plan`].

pub mod plan;

use std::collections::HashSet;

use tracing::{debug, info, instrument, warn};

use esprr_core::JobKey;

use crate::queue::{JobOptions, QueueClient, QueueError, Registry};
use crate::storage::{ComputeManagement, FailureReport, StorageError};

pub use plan::{FailurePlan, GENERIC_FAILURE_MESSAGE};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failed-registry classification after orphans were removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailureEvaluation {
    /// Uncaught worker failures to record in storage.
    pub reports: Vec<FailureReport>,
    /// Failed keys to drop from the broker once the reports are committed
    /// (the reported ones and the superseded ones).
    pub settled: Vec<JobKey>,
    /// Orphaned failed keys that were removed during evaluation.
    pub orphaned: Vec<JobKey>,
}

/// Result of cleaning up the failed registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupOutcome {
    pub reported: Vec<FailureReport>,
    /// Failed keys removed from the broker, orphans included.
    pub discarded: Vec<JobKey>,
}

/// Applies reconciliation decisions to the broker and storage.
#[derive(Debug, Clone)]
pub struct Reconciler<Q, S> {
    queue: Q,
    store: S,
    options: JobOptions,
}

impl<Q, S> Reconciler<Q, S>
where
    Q: QueueClient,
    S: ComputeManagement,
{
    pub fn new(queue: Q, store: S) -> Self {
        Self {
            queue,
            store,
            options: JobOptions::default(),
        }
    }

    /// Limits applied to jobs this reconciler creates.
    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn current_keys(&self) -> Result<HashSet<JobKey>, QueueError> {
        Ok(self
            .queue
            .tracked_jobs()
            .await?
            .into_iter()
            .map(|tracked| tracked.key)
            .collect())
    }

    /// Enqueue a job for every entry that is queued or has a changed
    /// definition and has no job in any registry. Existing jobs are never
    /// overwritten. Returns the keys submitted.
    #[instrument(skip(self), err)]
    pub async fn add_missing_jobs(&self) -> Result<Vec<JobKey>, ReconcileError> {
        let status = self.store.list_status().await?;
        let current = self.current_keys().await?;

        let mut enqueued = Vec::new();
        for (key, payload) in plan::plan_missing_jobs(&current, &status) {
            debug!(
                job_key = %key,
                system_id = %payload.system_id,
                dataset = %payload.dataset,
                "enqueueing missing job"
            );
            self.queue.create_if_absent(&key, &payload, &self.options).await?;
            enqueued.push(key);
        }

        if !enqueued.is_empty() {
            info!(count = enqueued.len(), "enqueued missing jobs");
        }
        Ok(enqueued)
    }

    /// Cancel and remove every broker job that has no snapshot entry or whose
    /// results are complete and current, running or not. Returns the keys
    /// removed.
    #[instrument(skip(self), err)]
    pub async fn remove_invalid_jobs(&self) -> Result<Vec<JobKey>, ReconcileError> {
        let status = self.store.list_status().await?;
        let current = self.queue.tracked_jobs().await?;

        let invalid = plan::plan_invalid_jobs(current.iter().map(|t| &t.key), &status);
        for key in &invalid {
            debug!(job_key = %key, "removing invalid job");
            self.queue.cancel_and_remove(key).await?;
        }

        if !invalid.is_empty() {
            info!(count = invalid.len(), "removed invalid jobs");
        }
        Ok(invalid)
    }

    /// Classify the failed registry.
    ///
    /// Orphaned failures are removed right away. Genuine failures come back as
    /// reports; nothing is written to storage here.
    #[instrument(skip(self), err)]
    pub async fn evaluate_failed_jobs(&self) -> Result<FailureEvaluation, ReconcileError> {
        let status = self.store.list_status().await?;
        let failed = self.queue.registry_keys(Registry::Failed).await?;

        let plan = plan::plan_failed_jobs(&failed, &status);
        for key in &plan.orphaned {
            debug!(job_key = %key, "removing orphaned failed job");
            self.queue.cancel_and_remove(key).await?;
        }

        let settled = plan.settled_keys().cloned().collect();
        Ok(FailureEvaluation {
            reports: plan.reports.into_iter().map(|(_, report)| report).collect(),
            settled,
            orphaned: plan.orphaned,
        })
    }

    /// Report genuine failures, then drop the settled failed jobs so their
    /// keys can be enqueued again.
    ///
    /// Nothing is dropped unless the whole report batch committed.
    #[instrument(skip(self), err)]
    pub async fn cleanup_failed_jobs(&self) -> Result<CleanupOutcome, ReconcileError> {
        let evaluation = self.evaluate_failed_jobs().await?;

        if !evaluation.reports.is_empty() {
            self.store.report_failures(&evaluation.reports).await?;
            info!(count = evaluation.reports.len(), "reported failed jobs");
        }

        for key in &evaluation.settled {
            match self.queue.fetch(key).await {
                Ok(Some(job)) => debug!(
                    job_key = %key,
                    failure = job.failure.as_deref().unwrap_or(""),
                    "discarding failed job"
                ),
                Ok(None) => {}
                Err(e) => warn!(job_key = %key, error = %e, "failed to read failed job detail"),
            }
            self.queue.cancel_and_remove(key).await?;
        }

        let mut discarded = evaluation.orphaned;
        discarded.extend(evaluation.settled);
        Ok(CleanupOutcome {
            reported: evaluation.reports,
            discarded,
        })
    }
}
