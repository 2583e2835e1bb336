//! Broker job records and registry bookkeeping.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use esprr_core::{Dataset, JobKey, SystemId, UserId};

/// Failure detail for jobs that outlived their maximum run time.
pub const ABANDONED_JOB_DETAIL: &str = "job exceeded maximum run time";

/// Lifecycle registry a broker job can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registry {
    /// Waiting in the queue for a worker.
    Queued,
    /// Claimed by a worker.
    Started,
    /// Waiting on another job.
    Deferred,
    /// Waiting for a point in time.
    Scheduled,
    /// Completed, kept for the result retention window.
    Finished,
    /// Failed, kept for the failure retention window.
    Failed,
}

impl Registry {
    pub const ALL: [Registry; 6] = [
        Registry::Queued,
        Registry::Started,
        Registry::Deferred,
        Registry::Scheduled,
        Registry::Finished,
        Registry::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Registry::Queued => "queued",
            Registry::Started => "started",
            Registry::Deferred => "deferred",
            Registry::Scheduled => "scheduled",
            Registry::Finished => "finished",
            Registry::Failed => "failed",
        }
    }

    /// Parse the name produced by [`Registry::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.as_str() == name)
    }

    /// The job will not be picked up or run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Registry::Finished | Registry::Failed)
    }
}

impl core::fmt::Display for Registry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a worker needs to compute system data. Round-trips through the
/// broker unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    pub system_id: SystemId,
    pub dataset: Dataset,
    pub user: UserId,
}

impl JobPayload {
    pub fn new(system_id: SystemId, dataset: Dataset, user: UserId) -> Self {
        Self {
            system_id,
            dataset,
            user,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::generate(self.system_id, &self.dataset)
    }
}

/// Execution limits attached to a job at creation.
///
/// Durations serialize as whole seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOptions {
    /// Maximum run time once started.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// How long a failed job stays in the failed registry.
    #[serde(with = "duration_secs")]
    pub failure_ttl: Duration,
    /// How long a finished job is kept; zero deletes it on completion.
    #[serde(with = "duration_secs")]
    pub result_ttl: Duration,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10 * 60),
            failure_ttl: Duration::from_secs(14 * 24 * 60 * 60),
            result_ttl: Duration::ZERO,
        }
    }
}

impl JobOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_failure_ttl(mut self, ttl: Duration) -> Self {
        self.failure_ttl = ttl;
        self
    }

    pub fn with_result_ttl(mut self, ttl: Duration) -> Self {
        self.result_ttl = ttl;
        self
    }
}

/// `Duration` as a whole number of seconds.
pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// A job as held by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerJob {
    pub key: JobKey,
    pub payload: JobPayload,
    pub registry: Registry,
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Failure detail recorded by the worker. Internal only.
    pub failure: Option<String>,
}

impl BrokerJob {
    /// A freshly enqueued job.
    pub fn queued(
        key: JobKey,
        payload: JobPayload,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            payload,
            registry: Registry::Queued,
            options,
            created_at: now,
            enqueued_at: Some(now),
            started_at: None,
            ended_at: None,
            failure: None,
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }

    /// When a started job is considered abandoned.
    pub fn run_deadline(&self) -> Option<DateTime<Utc>> {
        if self.registry != Registry::Started {
            return None;
        }
        self.started_at
            .and_then(|at| add_duration(at, self.options.timeout))
    }

    /// When a terminal job drops out of its registry.
    pub fn retention_deadline(&self) -> Option<DateTime<Utc>> {
        let ttl = match self.registry {
            Registry::Failed => self.options.failure_ttl,
            Registry::Finished => self.options.result_ttl,
            _ => return None,
        };
        self.ended_at.and_then(|at| add_duration(at, ttl))
    }
}

/// `at + duration`, or `None` when it does not fit.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
}

/// Restartable position within a registry listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryCursor(pub u64);

impl RegistryCursor {
    pub fn start() -> Self {
        Self(0)
    }
}

/// One page of a registry listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistryPage {
    pub keys: Vec<JobKey>,
    /// `None` once the listing is exhausted.
    pub next: Option<RegistryCursor>,
}

/// A broker key and the registry it was found in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackedJob {
    pub key: JobKey,
    pub registry: Registry,
}
