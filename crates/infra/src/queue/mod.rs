//! Job broker: the queue client used by the sync loop and the API layer, the
//! worker-side operations, and the adapters behind them.
//!
//! ## Components
//!
//! - `QueueClient`: fetch, create-if-absent, cancel/remove and registry paging
//! - `WorkerQueue`: claim/complete/fail for the consumer side
//! - `InMemoryQueue`: single-process broker for tests and development
//! - `RedisQueue`: Redis-backed broker (feature `redis`)
//! - `JobWorker`: runs claimed jobs through an injected `JobHandler`

pub mod client;
pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;
pub mod types;
pub mod worker;

pub use client::{QueueClient, QueueError, WorkerQueue};
pub use in_memory::InMemoryQueue;
#[cfg(feature = "redis")]
pub use self::redis::RedisQueue;
pub use types::{
    BrokerJob, JobOptions, JobPayload, Registry, RegistryCursor, RegistryPage, TrackedJob,
};
pub use worker::{JobFailure, JobHandler, JobOutcome, JobWorker, JobWorkerConfig, WorkerStats};
