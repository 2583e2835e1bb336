//! Storage side of reconciliation: the status snapshot and failure reports.
//!
//! The capability to read every user's computation status and to mark
//! computations failed is administrative. It is exposed only through
//! [`ComputeManagement`], which is implemented over manager credentials and is
//! never part of a per-user storage interface.

pub mod in_memory;
pub mod mysql;

use std::sync::Arc;

use async_trait::async_trait;

use esprr_core::{Dataset, StatusSnapshotEntry, SystemId};

pub use in_memory::InMemoryComputeManagement;
pub use mysql::MySqlComputeManagement;

/// An uncaught worker failure to be recorded against a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub system_id: SystemId,
    pub dataset: Dataset,
    pub message: String,
}

impl FailureReport {
    pub fn new(system_id: SystemId, dataset: Dataset, message: impl Into<String>) -> Self {
        Self {
            system_id,
            dataset,
            message: message.into(),
        }
    }
}

/// Storage error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("storage connection error: {0}")]
    Connection(String),

    #[error("query {operation} failed: {message}")]
    Query { operation: String, message: String },

    #[error("corrupt status row: {0}")]
    CorruptRow(String),

    #[error("storage state lock poisoned")]
    Poisoned,
}

/// Cross-user administrative access to computation status.
#[async_trait]
pub trait ComputeManagement: Send + Sync {
    /// One entry per (system, dataset), read in its own transaction.
    async fn list_status(&self) -> Result<Vec<StatusSnapshotEntry>, StorageError>;

    /// Mark each computation failed with its message, all in one transaction.
    ///
    /// Idempotent per report. Reports for computations that no longer exist
    /// are ignored.
    async fn report_failures(&self, reports: &[FailureReport]) -> Result<(), StorageError>;

    async fn report_failure(
        &self,
        system_id: SystemId,
        dataset: &Dataset,
        message: &str,
    ) -> Result<(), StorageError> {
        self.report_failures(&[FailureReport::new(system_id, dataset.clone(), message)])
            .await
    }
}

#[async_trait]
impl<T> ComputeManagement for Arc<T>
where
    T: ComputeManagement + ?Sized,
{
    async fn list_status(&self) -> Result<Vec<StatusSnapshotEntry>, StorageError> {
        (**self).list_status().await
    }

    async fn report_failures(&self, reports: &[FailureReport]) -> Result<(), StorageError> {
        (**self).report_failures(reports).await
    }

    async fn report_failure(
        &self,
        system_id: SystemId,
        dataset: &Dataset,
        message: &str,
    ) -> Result<(), StorageError> {
        (**self).report_failure(system_id, dataset, message).await
    }
}
