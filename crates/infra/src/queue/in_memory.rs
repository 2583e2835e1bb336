//! In-memory broker for tests and development.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::debug;

use esprr_core::JobKey;

use super::client::{QueueClient, QueueError, WorkerQueue};
use super::types::{
    BrokerJob, JobOptions, JobPayload, Registry, RegistryCursor, RegistryPage,
    ABANDONED_JOB_DETAIL,
};

const DEFAULT_PAGE_SIZE: usize = 100;
const STOP_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct State {
    jobs: BTreeMap<JobKey, BrokerJob>,
    queue: VecDeque<JobKey>,
    stop_requests: Vec<JobKey>,
    clock_offset: chrono::Duration,
    unavailable: bool,
}

impl State {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }

    fn check_available(&self) -> Result<(), QueueError> {
        if self.unavailable {
            return Err(QueueError::Connection("broker unavailable".to_string()));
        }
        Ok(())
    }

    /// Started jobs past their deadline were abandoned by their worker.
    fn reap_abandoned(&mut self, now: DateTime<Utc>) {
        for job in self.jobs.values_mut() {
            if job.run_deadline().is_some_and(|deadline| deadline <= now) {
                debug!(job_key = %job.key, "moving abandoned job to failed registry");
                job.registry = Registry::Failed;
                job.ended_at = Some(now);
                job.failure = Some(ABANDONED_JOB_DETAIL.to_string());
            }
        }
    }

    fn prune_expired(&mut self, registry: Registry, now: DateTime<Utc>) {
        self.jobs.retain(|_, job| {
            job.registry != registry
                || !job.retention_deadline().is_some_and(|deadline| deadline <= now)
        });
    }
}

/// In-memory broker implementing both the client and the worker side.
#[derive(Debug)]
pub struct InMemoryQueue {
    state: Mutex<State>,
    stops: broadcast::Sender<JobKey>,
    page_size: usize,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        let (stops, _) = broadcast::channel(STOP_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            stops,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registry listings return at most `page_size` keys per page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, QueueError> {
        self.state.lock().map_err(|_| QueueError::Poisoned)
    }

    /// Keys a stop command was published for, in order.
    pub fn stop_requests(&self) -> Vec<JobKey> {
        self.lock()
            .map(|s| s.stop_requests.clone())
            .unwrap_or_default()
    }

    /// Number of job records held.
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.jobs.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every operation fail with a connection error.
    pub fn set_unavailable(&self, unavailable: bool) {
        if let Ok(mut state) = self.lock() {
            state.unavailable = unavailable;
        }
    }

    /// Shift the broker's clock forward.
    pub fn advance_clock(&self, by: chrono::Duration) {
        if let Ok(mut state) = self.lock() {
            state.clock_offset += by;
        }
    }
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueClient for InMemoryQueue {
    async fn fetch(&self, key: &JobKey) -> Result<Option<BrokerJob>, QueueError> {
        let state = self.lock()?;
        state.check_available()?;
        Ok(state.jobs.get(key).cloned())
    }

    async fn create_if_absent(
        &self,
        key: &JobKey,
        payload: &JobPayload,
        options: &JobOptions,
    ) -> Result<BrokerJob, QueueError> {
        let mut state = self.lock()?;
        state.check_available()?;
        if let Some(existing) = state.jobs.get(key) {
            return Ok(existing.clone());
        }

        let job = BrokerJob::queued(key.clone(), payload.clone(), *options, state.now());
        state.jobs.insert(key.clone(), job.clone());
        state.queue.push_back(key.clone());
        Ok(job)
    }

    async fn cancel_and_remove(&self, key: &JobKey) -> Result<(), QueueError> {
        let mut state = self.lock()?;
        state.check_available()?;
        state.stop_requests.push(key.clone());
        state.queue.retain(|queued| queued != key);
        state.jobs.remove(key);
        drop(state);
        // No receivers just means no worker is watching.
        let _ = self.stops.send(key.clone());
        Ok(())
    }

    async fn enumerate_registry(
        &self,
        registry: Registry,
        cursor: RegistryCursor,
    ) -> Result<RegistryPage, QueueError> {
        let mut state = self.lock()?;
        state.check_available()?;
        let now = state.now();
        if cursor == RegistryCursor::start() {
            match registry {
                Registry::Failed => {
                    state.reap_abandoned(now);
                    state.prune_expired(Registry::Failed, now);
                }
                Registry::Finished => state.prune_expired(Registry::Finished, now),
                _ => {}
            }
        }

        let offset = usize::try_from(cursor.0).unwrap_or(usize::MAX);
        let matching: Vec<&JobKey> = state
            .jobs
            .values()
            .filter(|job| job.registry == registry)
            .map(|job| &job.key)
            .collect();
        let keys: Vec<JobKey> = matching
            .iter()
            .skip(offset)
            .take(self.page_size)
            .map(|key| (*key).clone())
            .collect();
        let consumed = offset.saturating_add(keys.len());
        let next = (consumed < matching.len()).then(|| RegistryCursor(consumed as u64));
        Ok(RegistryPage { keys, next })
    }
}

#[async_trait]
impl WorkerQueue for InMemoryQueue {
    async fn claim_next(&self) -> Result<Option<BrokerJob>, QueueError> {
        let mut state = self.lock()?;
        state.check_available()?;
        let now = state.now();
        while let Some(key) = state.queue.pop_front() {
            if let Some(job) = state.jobs.get_mut(&key) {
                if job.registry != Registry::Queued {
                    continue;
                }
                job.registry = Registry::Started;
                job.started_at = Some(now);
                return Ok(Some(job.clone()));
            }
        }
        Ok(None)
    }

    async fn complete(&self, key: &JobKey) -> Result<bool, QueueError> {
        let mut state = self.lock()?;
        state.check_available()?;
        let now = state.now();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };
        if job.registry != Registry::Started {
            return Ok(false);
        }
        if job.options.result_ttl.is_zero() {
            state.jobs.remove(key);
        } else {
            job.registry = Registry::Finished;
            job.ended_at = Some(now);
        }
        Ok(true)
    }

    async fn fail(&self, key: &JobKey, detail: &str) -> Result<bool, QueueError> {
        let mut state = self.lock()?;
        state.check_available()?;
        let now = state.now();
        let Some(job) = state.jobs.get_mut(key) else {
            return Ok(false);
        };
        if job.registry != Registry::Started {
            return Ok(false);
        }
        job.registry = Registry::Failed;
        job.ended_at = Some(now);
        job.failure = Some(detail.to_string());
        Ok(true)
    }

    async fn stop_requested(&self, key: &JobKey) -> Result<(), QueueError> {
        let mut stops = self.stops.subscribe();
        loop {
            match stops.recv().await {
                Ok(stopped) if stopped == *key => return Ok(()),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(job_key = %key, missed, "stop watch lagged");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(QueueError::Connection("stop channel closed".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use esprr_core::{Dataset, SystemId, UserId};

    fn payload(dataset: &str) -> JobPayload {
        JobPayload::new(
            SystemId::new(),
            Dataset::new(dataset).unwrap(),
            UserId::new("auth0|owner").unwrap(),
        )
    }

    async fn enqueue(queue: &InMemoryQueue, dataset: &str) -> JobKey {
        let payload = payload(dataset);
        let key = payload.key();
        queue
            .create_if_absent(&key, &payload, &JobOptions::default())
            .await
            .unwrap();
        key
    }

    #[tokio::test]
    async fn create_if_absent_keeps_first_payload() {
        let queue = InMemoryQueue::new();
        let first = payload("NSRDB_2019");
        let key = first.key();
        let mut second = first.clone();
        second.user = UserId::new("auth0|someone-else").unwrap();

        let a = queue.create_if_absent(&key, &first, &JobOptions::default()).await.unwrap();
        let b = queue.create_if_absent(&key, &second, &JobOptions::default()).await.unwrap();

        assert_eq!(a, b);
        assert_eq!(b.payload, first);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn worker_lifecycle_moves_between_registries() {
        let queue = InMemoryQueue::new();
        let ok = enqueue(&queue, "a").await;
        let bad = enqueue(&queue, "b").await;

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.key, ok);
        assert!(queue.is_started(&ok).await.unwrap());
        assert!(queue.complete(&ok).await.unwrap());
        // Zero result retention deletes the job.
        assert_eq!(queue.fetch(&ok).await.unwrap(), None);

        queue.claim_next().await.unwrap().unwrap();
        assert!(queue.fail(&bad, "boom").await.unwrap());
        assert_eq!(queue.registry_keys(Registry::Failed).await.unwrap(), vec![bad.clone()]);
        let failed = queue.fetch(&bad).await.unwrap().unwrap();
        assert_eq!(failed.failure.as_deref(), Some("boom"));

        assert_eq!(queue.claim_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn completing_a_cancelled_job_is_a_no_op() {
        let queue = InMemoryQueue::new();
        let key = enqueue(&queue, "a").await;
        queue.claim_next().await.unwrap().unwrap();
        queue.cancel_and_remove(&key).await.unwrap();

        assert!(!queue.complete(&key).await.unwrap());
        assert!(!queue.fail(&key, "late").await.unwrap());
        assert!(queue.is_empty());
        assert_eq!(queue.stop_requests(), vec![key]);
    }

    #[tokio::test]
    async fn cancelled_queued_job_is_never_claimed() {
        let queue = InMemoryQueue::new();
        let key = enqueue(&queue, "a").await;
        queue.cancel_and_remove(&key).await.unwrap();
        assert_eq!(queue.claim_next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn paging_is_restartable() {
        let queue = InMemoryQueue::new().with_page_size(2);
        for i in 0..5 {
            enqueue(&queue, &i.to_string()).await;
        }

        let first = queue
            .enumerate_registry(Registry::Queued, RegistryCursor::start())
            .await
            .unwrap();
        assert_eq!(first.keys.len(), 2);
        let cursor = first.next.unwrap();

        let again = queue.enumerate_registry(Registry::Queued, cursor).await.unwrap();
        let repeat = queue.enumerate_registry(Registry::Queued, cursor).await.unwrap();
        assert_eq!(again, repeat);

        assert_eq!(queue.registry_keys(Registry::Queued).await.unwrap().len(), 5);
        assert_eq!(queue.tracked_jobs().await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn abandoned_jobs_are_reaped_into_failed() {
        let queue = InMemoryQueue::new();
        let key = enqueue(&queue, "a").await;
        queue.claim_next().await.unwrap().unwrap();

        assert!(queue.registry_keys(Registry::Failed).await.unwrap().is_empty());
        queue.advance_clock(chrono::Duration::minutes(11));

        assert_eq!(queue.registry_keys(Registry::Failed).await.unwrap(), vec![key.clone()]);
        let job = queue.fetch(&key).await.unwrap().unwrap();
        assert_eq!(job.failure.as_deref(), Some(ABANDONED_JOB_DETAIL));
    }

    #[tokio::test]
    async fn expired_failures_are_pruned() {
        let queue = InMemoryQueue::new();
        let payload = payload("a");
        let key = payload.key();
        let options = JobOptions::default().with_failure_ttl(Duration::from_secs(60));
        queue.create_if_absent(&key, &payload, &options).await.unwrap();
        queue.claim_next().await.unwrap().unwrap();
        queue.fail(&key, "boom").await.unwrap();

        queue.advance_clock(chrono::Duration::minutes(2));
        assert!(queue.registry_keys(Registry::Failed).await.unwrap().is_empty());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn housekeeping_runs_only_on_the_first_page() {
        let queue = InMemoryQueue::new().with_page_size(1);
        let failed = enqueue(&queue, "NSRDB_2019").await;
        let running = enqueue(&queue, "NSRDB_2020").await;
        queue.claim_next().await.unwrap().unwrap();
        queue.fail(&failed, "boom").await.unwrap();
        queue.claim_next().await.unwrap().unwrap();

        let first = queue
            .enumerate_registry(Registry::Failed, RegistryCursor::start())
            .await
            .unwrap();
        assert_eq!(first.keys, vec![failed.clone()]);
        assert_eq!(first.next, None);

        // Abandoned meanwhile, but a later page leaves it alone.
        queue.advance_clock(chrono::Duration::minutes(11));
        let later = queue
            .enumerate_registry(Registry::Failed, RegistryCursor(1))
            .await
            .unwrap();
        assert!(later.keys.is_empty());
        let job = queue.fetch(&running).await.unwrap().unwrap();
        assert_eq!(job.registry, Registry::Started);

        assert_eq!(queue.registry_keys(Registry::Failed).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn stop_watch_resolves_for_its_key_only() {
        let queue = Arc::new(InMemoryQueue::new());
        let watched = enqueue(&queue, "NSRDB_2019").await;
        let other = enqueue(&queue, "NSRDB_2020").await;

        let watch = tokio::spawn({
            let queue = queue.clone();
            let key = watched.clone();
            async move { queue.stop_requested(&key).await }
        });
        tokio::task::yield_now().await;

        queue.cancel_and_remove(&other).await.unwrap();
        tokio::task::yield_now().await;
        assert!(!watch.is_finished());

        queue.cancel_and_remove(&watched).await.unwrap();
        assert_eq!(watch.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn unavailable_broker_errors() {
        let queue = InMemoryQueue::new();
        queue.set_unavailable(true);
        assert!(matches!(
            queue.registry_keys(Registry::Queued).await,
            Err(QueueError::Connection(_))
        ));
    }
}
