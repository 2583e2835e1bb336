//! Computation statuses and the per-(system, dataset) status snapshot.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::id::{Dataset, SystemId, UserId};
use crate::job_key::JobKey;

/// Coarse state of a system-data computation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataStatus {
    /// Requested, not finished yet.
    #[serde(rename = "queued")]
    Queued,
    /// Requested and picked up by a worker. Never stored; derived from the
    /// broker when reporting status to users.
    #[serde(rename = "running")]
    Running,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "statistics missing")]
    StatisticsMissing,
    #[serde(rename = "timeseries missing")]
    TimeseriesMissing,
    #[serde(rename = "error")]
    Error,
}

impl DataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataStatus::Queued => "queued",
            DataStatus::Running => "running",
            DataStatus::Complete => "complete",
            DataStatus::StatisticsMissing => "statistics missing",
            DataStatus::TimeseriesMissing => "timeseries missing",
            DataStatus::Error => "error",
        }
    }

    /// Parse a status as reported by storage.
    ///
    /// Storage calls a freshly requested computation `prepared`; it is
    /// presented as `queued`. `running` is not a stored state.
    pub fn from_stored(value: &str) -> Result<Self, DomainError> {
        match value {
            "prepared" => Ok(DataStatus::Queued),
            "running" => Err(DomainError::unknown_status(value)),
            other => other.parse(),
        }
    }
}

impl core::fmt::Display for DataStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(DataStatus::Queued),
            "running" => Ok(DataStatus::Running),
            "complete" => Ok(DataStatus::Complete),
            "statistics missing" => Ok(DataStatus::StatisticsMissing),
            "timeseries missing" => Ok(DataStatus::TimeseriesMissing),
            "error" => Ok(DataStatus::Error),
            other => Err(DomainError::unknown_status(other)),
        }
    }
}

/// Desired/last-known state of one (system, dataset) computation.
///
/// Read fresh from storage on every reconciliation step and never mutated
/// in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshotEntry {
    pub system_id: SystemId,
    pub dataset: Dataset,
    /// Set by the worker that last computed results successfully.
    pub version: Option<String>,
    pub status: DataStatus,
    /// The system definition changed since the last successful computation.
    pub hash_changed: bool,
    /// Owner of the system; jobs run under this identity.
    pub user: UserId,
}

impl StatusSnapshotEntry {
    pub fn job_key(&self) -> JobKey {
        JobKey::generate(self.system_id, &self.dataset)
    }

    /// Work was requested and never ran, or results are stale.
    pub fn needs_job(&self) -> bool {
        self.status == DataStatus::Queued || self.hash_changed
    }

    /// Results are complete and still match the current definition.
    pub fn is_settled(&self) -> bool {
        self.status == DataStatus::Complete && !self.hash_changed
    }

    /// A failed job for this entry is an uncaught worker error only if nothing
    /// about the requested work changed since it was queued.
    pub fn failure_is_actionable(&self) -> bool {
        self.status == DataStatus::Queued && !self.hash_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(status: DataStatus, hash_changed: bool) -> StatusSnapshotEntry {
        StatusSnapshotEntry {
            system_id: SystemId::new(),
            dataset: Dataset::nsrdb_2019(),
            version: None,
            status,
            hash_changed,
            user: UserId::new("auth0|user").unwrap(),
        }
    }

    #[test]
    fn prepared_reads_as_queued() {
        assert_eq!(DataStatus::from_stored("prepared").unwrap(), DataStatus::Queued);
        assert_eq!(
            DataStatus::from_stored("statistics missing").unwrap(),
            DataStatus::StatisticsMissing
        );
        assert!(DataStatus::from_stored("running").is_err());
        assert!(DataStatus::from_stored("bogus").is_err());
    }

    #[test]
    fn serde_uses_spaced_names() {
        let json = serde_json::to_string(&DataStatus::TimeseriesMissing).unwrap();
        assert_eq!(json, "\"timeseries missing\"");
        let back: DataStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DataStatus::TimeseriesMissing);
    }

    #[test]
    fn entry_predicates() {
        assert!(entry(DataStatus::Queued, false).needs_job());
        assert!(entry(DataStatus::Complete, true).needs_job());
        assert!(!entry(DataStatus::Error, false).needs_job());

        assert!(entry(DataStatus::Complete, false).is_settled());
        assert!(!entry(DataStatus::Complete, true).is_settled());

        assert!(entry(DataStatus::Queued, false).failure_is_actionable());
        assert!(!entry(DataStatus::Queued, true).failure_is_actionable());
        assert!(!entry(DataStatus::Error, false).failure_is_actionable());
    }
}
