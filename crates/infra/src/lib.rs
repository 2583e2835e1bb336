//! Infrastructure layer: broker and storage adapters, reconciliation and the
//! sync loop.

pub mod config;
pub mod queue;
pub mod reconcile;
pub mod service;
pub mod storage;
pub mod sync;


pub use config::{ConfigError, SyncConfig};
pub use queue::{QueueClient, QueueError, WorkerQueue};
pub use reconcile::{ReconcileError, Reconciler};
pub use service::SystemDataJobs;
pub use storage::{ComputeManagement, FailureReport, StorageError};
pub use sync::{CycleReport, ErrorPolicy, SyncLoop, SyncState};
