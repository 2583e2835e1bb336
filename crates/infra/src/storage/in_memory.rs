//! In-memory status store for tests/dev.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use esprr_core::{DataStatus, Dataset, StatusSnapshotEntry, SystemId};

use super::{ComputeManagement, FailureReport, StorageError};

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<(SystemId, Dataset), StatusSnapshotEntry>,
    errors: BTreeMap<(SystemId, Dataset), String>,
    unavailable: bool,
    rejecting_reports: bool,
}

/// In-memory stand-in for the manager view of storage.
#[derive(Debug, Default)]
pub struct InMemoryComputeManagement {
    state: RwLock<State>,
}

impl InMemoryComputeManagement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert or replace the entry for its (system, dataset).
    pub fn upsert(&self, entry: StatusSnapshotEntry) {
        if let Ok(mut state) = self.state.write() {
            state
                .entries
                .insert((entry.system_id, entry.dataset.clone()), entry);
        }
    }

    pub fn remove(&self, system_id: SystemId, dataset: &Dataset) {
        if let Ok(mut state) = self.state.write() {
            state.entries.remove(&(system_id, dataset.clone()));
        }
    }

    pub fn entry(&self, system_id: SystemId, dataset: &Dataset) -> Option<StatusSnapshotEntry> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.entries.get(&(system_id, dataset.clone())).cloned())
    }

    /// Message recorded by the last failure report, if any.
    pub fn error_message(&self, system_id: SystemId, dataset: &Dataset) -> Option<String> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.errors.get(&(system_id, dataset.clone())).cloned())
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.state.write() {
            state.unavailable = unavailable;
        }
    }

    /// Make failure reports fail while reads keep working.
    pub fn set_rejecting_reports(&self, rejecting: bool) {
        if let Ok(mut state) = self.state.write() {
            state.rejecting_reports = rejecting;
        }
    }
}

#[async_trait]
impl ComputeManagement for InMemoryComputeManagement {
    async fn list_status(&self) -> Result<Vec<StatusSnapshotEntry>, StorageError> {
        let state = self.state.read().map_err(|_| StorageError::Poisoned)?;
        if state.unavailable {
            return Err(StorageError::Connection("storage unavailable".to_string()));
        }
        Ok(state.entries.values().cloned().collect())
    }

    async fn report_failures(&self, reports: &[FailureReport]) -> Result<(), StorageError> {
        let mut state = self.state.write().map_err(|_| StorageError::Poisoned)?;
        if state.unavailable {
            return Err(StorageError::Connection("storage unavailable".to_string()));
        }
        if state.rejecting_reports {
            return Err(StorageError::Query {
                operation: "report_failure".to_string(),
                message: "report rejected".to_string(),
            });
        }
        for report in reports {
            let id = (report.system_id, report.dataset.clone());
            let Some(entry) = state.entries.get_mut(&id) else {
                continue;
            };
            entry.status = DataStatus::Error;
            state.errors.insert(id, report.message.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use esprr_core::UserId;

    fn entry(status: DataStatus) -> StatusSnapshotEntry {
        StatusSnapshotEntry {
            system_id: SystemId::new(),
            dataset: Dataset::nsrdb_2019(),
            version: None,
            status,
            hash_changed: false,
            user: UserId::new("auth0|owner").unwrap(),
        }
    }

    #[tokio::test]
    async fn report_marks_error_and_is_idempotent() {
        let store = InMemoryComputeManagement::new();
        let queued = entry(DataStatus::Queued);
        store.upsert(queued.clone());

        for _ in 0..2 {
            store
                .report_failure(queued.system_id, &queued.dataset, "failed")
                .await
                .unwrap();
        }

        let updated = store.entry(queued.system_id, &queued.dataset).unwrap();
        assert_eq!(updated.status, DataStatus::Error);
        assert_eq!(
            store.error_message(queued.system_id, &queued.dataset).as_deref(),
            Some("failed")
        );
    }

    #[tokio::test]
    async fn reports_for_missing_rows_are_ignored() {
        let store = InMemoryComputeManagement::new();
        store
            .report_failures(&[FailureReport::new(SystemId::new(), Dataset::nsrdb_2019(), "x")])
            .await
            .unwrap();
        assert!(store.list_status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = InMemoryComputeManagement::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_status().await,
            Err(StorageError::Connection(_))
        ));
    }
}
