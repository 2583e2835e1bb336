//! Entry points the API layer uses to request computations and report their
//! status.

use tracing::{debug, instrument};

use esprr_core::{DataStatus, Dataset, StatusSnapshotEntry, SystemId, UserId};

use crate::queue::{BrokerJob, JobOptions, JobPayload, QueueClient, QueueError};

/// API-facing view of system-data jobs.
///
/// Shares the job key space with the sync loop, so an on-demand request and
/// the loop can never create two jobs for one (system, dataset).
#[derive(Debug, Clone)]
pub struct SystemDataJobs<Q> {
    queue: Q,
    options: JobOptions,
}

impl<Q> SystemDataJobs<Q>
where
    Q: QueueClient,
{
    pub fn new(queue: Q) -> Self {
        Self {
            queue,
            options: JobOptions::default(),
        }
    }

    pub fn with_job_options(mut self, options: JobOptions) -> Self {
        self.options = options;
        self
    }

    /// Request a computation. Returns the existing job if there already is one.
    #[instrument(skip_all, fields(system_id = %system_id, dataset = %dataset), err)]
    pub async fn enqueue(
        &self,
        system_id: SystemId,
        dataset: &Dataset,
        user: &UserId,
    ) -> Result<BrokerJob, QueueError> {
        let payload = JobPayload::new(system_id, dataset.clone(), user.clone());
        let key = payload.key();
        let job = self.queue.create_if_absent(&key, &payload, &self.options).await?;
        debug!(job_key = %key, registry = %job.registry, "system data job requested");
        Ok(job)
    }

    /// A worker has picked up the computation.
    pub async fn is_running(
        &self,
        system_id: SystemId,
        dataset: &Dataset,
    ) -> Result<bool, QueueError> {
        self.queue
            .is_started(&esprr_core::generate_key(system_id, dataset))
            .await
    }

    /// Status as users should see it: `queued` becomes `running` once a
    /// worker has started the job.
    pub async fn reported_status(
        &self,
        entry: &StatusSnapshotEntry,
    ) -> Result<DataStatus, QueueError> {
        if entry.status == DataStatus::Queued
            && self.is_running(entry.system_id, &entry.dataset).await?
        {
            return Ok(DataStatus::Running);
        }
        Ok(entry.status)
    }
}
