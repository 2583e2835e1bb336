//! Pure reconciliation decisions over (broker keys, status snapshot).
//!
//! Nothing here talks to the broker or storage; the reconciler feeds in what it
//! just read and applies what comes back.

use std::collections::{HashMap, HashSet};

use esprr_core::{JobKey, StatusSnapshotEntry};

use crate::queue::JobPayload;
use crate::storage::FailureReport;

/// Message stored against a computation whose job failed without recording
/// its own error. Worker details stay in the broker.
pub const GENERIC_FAILURE_MESSAGE: &str =
    r#"{"error": "Uncaught error while computing system data. Please try again later."}"#;

/// Snapshot entries indexed by their job key. Later duplicates win, here and
/// in every plan built on the snapshot.
pub fn index_by_key(
    status: &[StatusSnapshotEntry],
) -> HashMap<JobKey, &StatusSnapshotEntry> {
    status.iter().map(|entry| (entry.job_key(), entry)).collect()
}

/// Jobs to create: entries that want work and whose key the broker does not
/// hold in any registry. Of duplicate rows only the last one counts.
pub fn plan_missing_jobs(
    current: &HashSet<JobKey>,
    status: &[StatusSnapshotEntry],
) -> Vec<(JobKey, JobPayload)> {
    let latest = index_by_key(status);
    status
        .iter()
        .filter_map(|entry| {
            let key = entry.job_key();
            let is_latest = latest.get(&key).is_some_and(|last| std::ptr::eq(*last, entry));
            if !is_latest || !entry.needs_job() || current.contains(&key) {
                return None;
            }
            let payload =
                JobPayload::new(entry.system_id, entry.dataset.clone(), entry.user.clone());
            Some((key, payload))
        })
        .collect()
}

/// Jobs to cancel and remove: keys without a snapshot entry (including keys
/// this system never generated) and keys whose results are already complete
/// and current.
pub fn plan_invalid_jobs<'a, I>(current: I, status: &[StatusSnapshotEntry]) -> Vec<JobKey>
where
    I: IntoIterator<Item = &'a JobKey>,
{
    let valid = index_by_key(status);
    let mut seen = HashSet::new();
    current
        .into_iter()
        .filter(|key| match valid.get(*key) {
            None => true,
            Some(entry) => entry.is_settled(),
        })
        .filter(|key| seen.insert((*key).clone()))
        .cloned()
        .collect()
}

/// Classification of the failed registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FailurePlan {
    /// Genuine uncaught failures, to be written to storage.
    pub reports: Vec<(JobKey, FailureReport)>,
    /// Failed keys with no snapshot entry or that do not decode.
    pub orphaned: Vec<JobKey>,
    /// Failed keys whose entry moved on since the job was queued.
    pub stale: Vec<JobKey>,
}

impl FailurePlan {
    /// Keys to drop from the failed registry once reports are committed.
    pub fn settled_keys(&self) -> impl Iterator<Item = &JobKey> {
        self.reports.iter().map(|(key, _)| key).chain(self.stale.iter())
    }
}

/// Decide what to do with each failed job.
///
/// Only an entry that is still `queued` with an unchanged definition gets a
/// failure report: anything else means the failure was superseded.
pub fn plan_failed_jobs<'a, I>(failed: I, status: &[StatusSnapshotEntry]) -> FailurePlan
where
    I: IntoIterator<Item = &'a JobKey>,
{
    let valid = index_by_key(status);
    let mut seen = HashSet::new();
    let mut plan = FailurePlan::default();

    for key in failed {
        if !seen.insert(key.clone()) {
            continue;
        }
        if key.decompose().is_err() {
            plan.orphaned.push(key.clone());
            continue;
        }
        match valid.get(key) {
            None => plan.orphaned.push(key.clone()),
            Some(entry) if entry.failure_is_actionable() => {
                let report = FailureReport::new(
                    entry.system_id,
                    entry.dataset.clone(),
                    GENERIC_FAILURE_MESSAGE,
                );
                plan.reports.push((key.clone(), report));
            }
            Some(_) => plan.stale.push(key.clone()),
        }
    }

    plan
}
