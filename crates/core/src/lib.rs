//! `esprr-core`: vocabulary of the system-data job reconciliation core.
//!
//! This crate contains **pure** types only (no broker or storage concerns):
//! identifiers, job keys, computation statuses and status snapshot entries.

pub mod error;
pub mod id;
pub mod job_key;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::{Dataset, SystemId, UserId};
pub use job_key::{decompose_key, generate_key, JobKey, JobKeyError, KEY_SEPARATOR};
pub use status::{DataStatus, StatusSnapshotEntry};
