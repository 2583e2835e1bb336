//! The sync loop: repeatedly drives the reconciler on a fixed interval.
//!
//! ```text
//! Idle -> AddMissing -> RemoveInvalid -> CleanupFailed -> Idle
//!   \                                                      |
//!    `-------------------- sleep(interval) <---------------'
//! ```
//!
//! Cancellation is checked only at the top of a cycle. The sleep between
//! cycles ends early on cancellation; a step that is already running is never
//! interrupted.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use esprr_core::JobKey;

use crate::queue::QueueClient;
use crate::reconcile::{ReconcileError, Reconciler};
use crate::storage::{ComputeManagement, FailureReport};

/// Where the loop is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    AddMissing,
    RemoveInvalid,
    CleanupFailed,
    Stopped,
}

/// What to do when a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Log it, skip the rest of the cycle and try again next cycle.
    #[default]
    Retry,
    /// Stop the loop and return the error.
    Abort,
}

/// What one cycle changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub enqueued: Vec<JobKey>,
    pub removed: Vec<JobKey>,
    pub reported: Vec<FailureReport>,
    pub discarded: Vec<JobKey>,
}

impl CycleReport {
    pub fn is_quiet(&self) -> bool {
        self.enqueued.is_empty()
            && self.removed.is_empty()
            && self.reported.is_empty()
            && self.discarded.is_empty()
    }
}

/// Totals returned when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncSummary {
    pub cycles: u64,
    pub failed_cycles: u64,
}

/// Drives a [`Reconciler`] until cancelled.
pub struct SyncLoop<Q, S> {
    reconciler: Reconciler<Q, S>,
    interval: Duration,
    error_policy: ErrorPolicy,
    state: SyncState,
}

impl<Q, S> SyncLoop<Q, S>
where
    Q: QueueClient,
    S: ComputeManagement,
{
    pub fn new(reconciler: Reconciler<Q, S>, interval: Duration) -> Self {
        Self {
            reconciler,
            interval,
            error_policy: ErrorPolicy::default(),
            state: SyncState::Idle,
        }
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn reconciler(&self) -> &Reconciler<Q, S> {
        &self.reconciler
    }

    fn enter(&mut self, state: SyncState) {
        debug!(from = ?self.state, to = ?state, "sync state transition");
        self.state = state;
    }

    /// Run the three steps once. The state is back to `Idle` afterwards,
    /// whether or not a step failed.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, ReconcileError> {
        let result = self.steps().await;
        self.enter(SyncState::Idle);
        result
    }

    async fn steps(&mut self) -> Result<CycleReport, ReconcileError> {
        self.enter(SyncState::AddMissing);
        let enqueued = self.reconciler.add_missing_jobs().await?;

        self.enter(SyncState::RemoveInvalid);
        let removed = self.reconciler.remove_invalid_jobs().await?;

        self.enter(SyncState::CleanupFailed);
        let cleanup = self.reconciler.cleanup_failed_jobs().await?;

        Ok(CycleReport {
            enqueued,
            removed,
            reported: cleanup.reported,
            discarded: cleanup.discarded,
        })
    }

    /// Cycle until `cancel` fires, sleeping `interval` between cycles.
    ///
    /// Returns an error only under [`ErrorPolicy::Abort`].
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<SyncSummary, ReconcileError> {
        info!(interval = ?self.interval, policy = ?self.error_policy, "sync loop started");
        let mut summary = SyncSummary::default();

        loop {
            if cancel.is_cancelled() {
                break;
            }

            summary.cycles += 1;
            match self.run_cycle().await {
                Ok(report) if report.is_quiet() => {
                    debug!(cycle = summary.cycles, "sync cycle complete")
                }
                Ok(report) => info!(
                    cycle = summary.cycles,
                    enqueued = report.enqueued.len(),
                    removed = report.removed.len(),
                    reported = report.reported.len(),
                    discarded = report.discarded.len(),
                    "sync cycle complete"
                ),
                Err(e) => {
                    summary.failed_cycles += 1;
                    error!(cycle = summary.cycles, error = %e, "sync cycle failed");
                    if self.error_policy == ErrorPolicy::Abort {
                        self.enter(SyncState::Stopped);
                        return Err(e);
                    }
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        self.enter(SyncState::Stopped);
        info!(cycles = summary.cycles, failed = summary.failed_cycles, "sync loop stopped");
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use esprr_core::{DataStatus, Dataset, StatusSnapshotEntry, SystemId, UserId};

    use crate::queue::InMemoryQueue;
    use crate::storage::InMemoryComputeManagement;

    fn setup() -> (
        Arc<InMemoryQueue>,
        Arc<InMemoryComputeManagement>,
        SyncLoop<Arc<InMemoryQueue>, Arc<InMemoryComputeManagement>>,
    ) {
        let queue = InMemoryQueue::arc();
        let store = InMemoryComputeManagement::arc();
        let sync = SyncLoop::new(
            Reconciler::new(queue.clone(), store.clone()),
            Duration::from_secs(15),
        );
        (queue, store, sync)
    }

    fn queued_entry() -> StatusSnapshotEntry {
        StatusSnapshotEntry {
            system_id: SystemId::new(),
            dataset: Dataset::nsrdb_2019(),
            version: None,
            status: DataStatus::Queued,
            hash_changed: false,
            user: UserId::new("auth0|owner").unwrap(),
        }
    }

    #[tokio::test]
    async fn cycle_returns_to_idle() {
        let (queue, store, mut sync) = setup();
        let entry = queued_entry();
        store.upsert(entry.clone());

        assert_eq!(sync.state(), SyncState::Idle);
        let report = sync.run_cycle().await.unwrap();
        assert_eq!(report.enqueued, vec![entry.job_key()]);
        assert_eq!(sync.state(), SyncState::Idle);
        assert_eq!(queue.len(), 1);

        // Nothing left to do on the next pass.
        assert!(sync.run_cycle().await.unwrap().is_quiet());
    }

    #[tokio::test]
    async fn failed_cycle_returns_to_idle() {
        let (queue, _store, mut sync) = setup();
        queue.set_unavailable(true);
        assert!(sync.run_cycle().await.is_err());
        assert_eq!(sync.state(), SyncState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_before_start_runs_no_cycle() {
        let (_queue, _store, mut sync) = setup();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = sync.run(cancel).await.unwrap();
        assert_eq!(summary.cycles, 0);
        assert_eq!(sync.state(), SyncState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn runs_on_interval_until_cancelled() {
        let (queue, store, mut sync) = setup();
        let cancel = CancellationToken::new();

        let stopper = {
            let cancel = cancel.clone();
            let store = store.clone();
            async move {
                // First cycle runs at t=0, the second at t=15s.
                tokio::time::sleep(Duration::from_secs(5)).await;
                store.upsert(queued_entry());
                tokio::time::sleep(Duration::from_secs(20)).await;
                cancel.cancel();
            }
        };

        let (summary, ()) = tokio::join!(sync.run(cancel.clone()), stopper);
        let summary = summary.unwrap();

        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.failed_cycles, 0);
        assert_eq!(queue.len(), 1);
        assert_eq!(sync.state(), SyncState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_policy_keeps_going() {
        let (queue, store, mut sync) = setup();
        store.upsert(queued_entry());
        queue.set_unavailable(true);
        let cancel = CancellationToken::new();

        let healer = {
            let cancel = cancel.clone();
            let queue = queue.clone();
            async move {
                tokio::time::sleep(Duration::from_secs(20)).await;
                queue.set_unavailable(false);
                tokio::time::sleep(Duration::from_secs(20)).await;
                cancel.cancel();
            }
        };

        let (summary, ()) = tokio::join!(sync.run(cancel.clone()), healer);
        let summary = summary.unwrap();

        // Cycles at 0s and 15s fail, 30s succeeds.
        assert_eq!(summary.cycles, 3);
        assert_eq!(summary.failed_cycles, 2);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_stops_with_the_error() {
        let (queue, _store, sync) = setup();
        let mut sync = sync.with_error_policy(ErrorPolicy::Abort);
        queue.set_unavailable(true);

        let err = sync.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::Queue(_)));
        assert_eq!(sync.state(), SyncState::Stopped);
    }
}
