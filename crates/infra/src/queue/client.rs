//! Broker client abstractions.

use std::sync::Arc;

use async_trait::async_trait;

use esprr_core::JobKey;

use super::types::{
    BrokerJob, JobOptions, JobPayload, Registry, RegistryCursor, RegistryPage, TrackedJob,
};

/// Broker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("broker connection error: {0}")]
    Connection(String),

    #[error("broker command error: {0}")]
    Command(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupt job record {key}: {reason}")]
    CorruptJob { key: String, reason: String },

    #[error("broker state lock poisoned")]
    Poisoned,
}

/// Operations the sync loop and the API layer perform against the broker.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Look up a job. `None` means it was never submitted (or already removed).
    async fn fetch(&self, key: &JobKey) -> Result<Option<BrokerJob>, QueueError>;

    /// Enqueue a job unless one with this key already exists.
    ///
    /// The check and the creation are one atomic broker operation, and the
    /// existing job (with its original payload) is returned when there is one.
    async fn create_if_absent(
        &self,
        key: &JobKey,
        payload: &JobPayload,
        options: &JobOptions,
    ) -> Result<BrokerJob, QueueError>;

    /// The job exists and a worker has picked it up.
    async fn is_started(&self, key: &JobKey) -> Result<bool, QueueError> {
        Ok(self.fetch(key).await?.is_some_and(|job| job.is_started()))
    }

    /// Ask any worker running the job to stop, then remove it everywhere.
    ///
    /// Removing a key the broker does not know is not an error.
    async fn cancel_and_remove(&self, key: &JobKey) -> Result<(), QueueError>;

    /// One page of the keys in `registry`, starting at `cursor`.
    ///
    /// Pages are offsets into the registry as it is when each page is read,
    /// so keys added or removed between pages can be skipped or repeated.
    /// Housekeeping (reaping abandoned jobs, pruning expired ones) runs only
    /// for the first page.
    async fn enumerate_registry(
        &self,
        registry: Registry,
        cursor: RegistryCursor,
    ) -> Result<RegistryPage, QueueError>;

    /// Every key in `registry`.
    async fn registry_keys(&self, registry: Registry) -> Result<Vec<JobKey>, QueueError> {
        let mut keys = Vec::new();
        let mut cursor = RegistryCursor::start();
        loop {
            let page = self.enumerate_registry(registry, cursor).await?;
            keys.extend(page.keys);
            match page.next {
                Some(next) => cursor = next,
                None => return Ok(keys),
            }
        }
    }

    /// Every key the broker tracks, with the registry it sits in.
    async fn tracked_jobs(&self) -> Result<Vec<TrackedJob>, QueueError> {
        let mut jobs = Vec::new();
        for registry in Registry::ALL {
            for key in self.registry_keys(registry).await? {
                jobs.push(TrackedJob { key, registry });
            }
        }
        Ok(jobs)
    }
}

/// Consumer-side broker operations.
#[async_trait]
pub trait WorkerQueue: Send + Sync {
    /// Move the oldest queued job to started and return it.
    async fn claim_next(&self) -> Result<Option<BrokerJob>, QueueError>;

    /// Mark a started job finished. Returns `false` if the job is no longer
    /// started (for example it was cancelled while running).
    async fn complete(&self, key: &JobKey) -> Result<bool, QueueError>;

    /// Mark a started job failed with an internal failure detail. Returns
    /// `false` if the job is no longer started.
    async fn fail(&self, key: &JobKey, detail: &str) -> Result<bool, QueueError>;

    /// Resolve once a stop command for `key` is published.
    ///
    /// Only commands published after the watch is established are seen. A
    /// job stopped earlier shows up as `complete`/`fail` returning `false`.
    async fn stop_requested(&self, key: &JobKey) -> Result<(), QueueError>;
}

#[async_trait]
impl<T> QueueClient for Arc<T>
where
    T: QueueClient + ?Sized,
{
    async fn fetch(&self, key: &JobKey) -> Result<Option<BrokerJob>, QueueError> {
        (**self).fetch(key).await
    }

    async fn create_if_absent(
        &self,
        key: &JobKey,
        payload: &JobPayload,
        options: &JobOptions,
    ) -> Result<BrokerJob, QueueError> {
        (**self).create_if_absent(key, payload, options).await
    }

    async fn is_started(&self, key: &JobKey) -> Result<bool, QueueError> {
        (**self).is_started(key).await
    }

    async fn cancel_and_remove(&self, key: &JobKey) -> Result<(), QueueError> {
        (**self).cancel_and_remove(key).await
    }

    async fn enumerate_registry(
        &self,
        registry: Registry,
        cursor: RegistryCursor,
    ) -> Result<RegistryPage, QueueError> {
        (**self).enumerate_registry(registry, cursor).await
    }

    async fn registry_keys(&self, registry: Registry) -> Result<Vec<JobKey>, QueueError> {
        (**self).registry_keys(registry).await
    }

    async fn tracked_jobs(&self) -> Result<Vec<TrackedJob>, QueueError> {
        (**self).tracked_jobs().await
    }
}

#[async_trait]
impl<T> WorkerQueue for Arc<T>
where
    T: WorkerQueue + ?Sized,
{
    async fn claim_next(&self) -> Result<Option<BrokerJob>, QueueError> {
        (**self).claim_next().await
    }

    async fn complete(&self, key: &JobKey) -> Result<bool, QueueError> {
        (**self).complete(key).await
    }

    async fn fail(&self, key: &JobKey, detail: &str) -> Result<bool, QueueError> {
        (**self).fail(key, detail).await
    }

    async fn stop_requested(&self, key: &JobKey) -> Result<(), QueueError> {
        (**self).stop_requested(key).await
    }
}
