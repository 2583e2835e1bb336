//! Redis-backed broker.
//!
//! ## Layout
//!
//! - **Job record**: hash `esprr:job:{key}` with fields `payload` (JSON),
//!   `registry`, `created_at`, `enqueued_at`, `started_at`, `ended_at`
//!   (epoch milliseconds), `timeout`, `failure_ttl`, `result_ttl` (seconds)
//!   and `failure`
//! - **Queue**: list `esprr:queue:{queue}` of keys waiting for a worker
//! - **Registries**: sorted sets `esprr:{queue}:{registry}` scored by the
//!   millisecond timestamp at which the entry expires (run deadline for
//!   `started`, retention deadline for `finished`/`failed`)
//! - **Commands**: pub/sub channel `esprr:pubsub:commands`; workers stop a job
//!   when they receive `{"command":"stop-job","job_id":KEY}`
//!
//! Every multi-key state change runs as a Lua script so it is atomic at the
//! broker. In particular `create_if_absent` checks for and creates the record
//! in one script, which is what keeps at most one live job per key when the
//! API and the sync loop race. `cancel_and_remove` clears the queue entry,
//! every registry entry and the record in one script as well.

use std::collections::HashMap;

use ::redis::aio::ConnectionManager;
use ::redis::{RedisError, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use esprr_core::JobKey;

use super::client::{QueueClient, QueueError, WorkerQueue};
use super::types::{
    BrokerJob, JobOptions, JobPayload, Registry, RegistryCursor, RegistryPage,
    ABANDONED_JOB_DETAIL,
};

const JOB_KEY_PREFIX: &str = "esprr:job:";
const COMMAND_CHANNEL: &str = "esprr:pubsub:commands";
const DEFAULT_PAGE_SIZE: usize = 100;
const STOP_JOB_COMMAND: &str = "stop-job";

const CREATE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  redis.call('HSET', KEYS[1],
    'payload', ARGV[2], 'registry', 'queued',
    'created_at', ARGV[3], 'enqueued_at', ARGV[3],
    'timeout', ARGV[4], 'failure_ttl', ARGV[5], 'result_ttl', ARGV[6])
  redis.call('RPUSH', KEYS[2], ARGV[1])
end
return redis.call('HGETALL', KEYS[1])
"#;

const CLAIM_SCRIPT: &str = r#"
while true do
  local key = redis.call('LPOP', KEYS[1])
  if not key then return false end
  local job = ARGV[2] .. key
  if redis.call('HGET', job, 'registry') == 'queued' then
    local timeout = tonumber(redis.call('HGET', job, 'timeout')) or 0
    redis.call('HSET', job, 'registry', 'started', 'started_at', ARGV[1])
    redis.call('ZADD', KEYS[2], tonumber(ARGV[1]) + timeout * 1000, key)
    return key
  end
end
"#;

const COMPLETE_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'registry') ~= 'started' then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
local ttl = tonumber(redis.call('HGET', KEYS[1], 'result_ttl')) or 0
if ttl == 0 then
  redis.call('DEL', KEYS[1])
  return 1
end
redis.call('HSET', KEYS[1], 'registry', 'finished', 'ended_at', ARGV[2])
redis.call('ZADD', KEYS[3], tonumber(ARGV[2]) + ttl * 1000, ARGV[1])
return 1
"#;

const FAIL_SCRIPT: &str = r#"
if redis.call('HGET', KEYS[1], 'registry') ~= 'started' then return 0 end
redis.call('ZREM', KEYS[2], ARGV[1])
local ttl = tonumber(redis.call('HGET', KEYS[1], 'failure_ttl')) or 0
redis.call('HSET', KEYS[1], 'registry', 'failed', 'ended_at', ARGV[2], 'failure', ARGV[3])
redis.call('ZADD', KEYS[3], tonumber(ARGV[2]) + ttl * 1000, ARGV[1])
return 1
"#;

const REAP_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local abandoned = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now)
for _, key in ipairs(abandoned) do
  local job = ARGV[2] .. key
  redis.call('ZREM', KEYS[1], key)
  if redis.call('HGET', job, 'registry') == 'started' then
    local ttl = tonumber(redis.call('HGET', job, 'failure_ttl')) or 0
    redis.call('HSET', job, 'registry', 'failed', 'ended_at', ARGV[1], 'failure', ARGV[3])
    redis.call('ZADD', KEYS[2], now + ttl * 1000, key)
  end
end
return #abandoned
"#;

const CANCEL_SCRIPT: &str = r#"
redis.call('LREM', KEYS[1], 0, ARGV[1])
for i = 2, #KEYS - 1 do
  redis.call('ZREM', KEYS[i], ARGV[1])
end
return redis.call('DEL', KEYS[#KEYS])
"#;

const PRUNE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
for _, key in ipairs(expired) do
  redis.call('ZREM', KEYS[1], key)
  local job = ARGV[2] .. key
  if redis.call('HGET', job, 'registry') == ARGV[3] then
    redis.call('DEL', job)
  end
end
return #expired
"#;

struct Scripts {
    create: Script,
    claim: Script,
    complete: Script,
    fail: Script,
    reap: Script,
    prune: Script,
    cancel: Script,
}

impl Scripts {
    fn load() -> Self {
        Self {
            create: Script::new(CREATE_SCRIPT),
            claim: Script::new(CLAIM_SCRIPT),
            complete: Script::new(COMPLETE_SCRIPT),
            fail: Script::new(FAIL_SCRIPT),
            reap: Script::new(REAP_SCRIPT),
            prune: Script::new(PRUNE_SCRIPT),
            cancel: Script::new(CANCEL_SCRIPT),
        }
    }
}

/// Broker backed by a single Redis instance.
///
/// `ConnectionManager` reconnects on its own and is cheap to clone, so every
/// operation works on its own clone of it.
#[derive(Clone)]
pub struct RedisQueue {
    client: ::redis::Client,
    conn: ConnectionManager,
    queue_name: String,
    page_size: usize,
    scripts: std::sync::Arc<Scripts>,
}

impl core::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("queue_name", &self.queue_name)
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    /// Connect to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - connection URL (e.g. "redis://localhost:6379/0")
    /// * `queue_name` - name of the queue jobs are placed on (e.g. "jobs")
    pub async fn connect(
        redis_url: impl AsRef<str>,
        queue_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = ::redis::Client::open(redis_url.as_ref())
            .map_err(|e| QueueError::Connection(e.to_string()))?;
        let conn = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| map_redis_error("connect", e))?;

        Ok(Self {
            client,
            conn,
            queue_name: queue_name.into(),
            page_size: DEFAULT_PAGE_SIZE,
            scripts: std::sync::Arc::new(Scripts::load()),
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Round-trip to the server.
    pub async fn ping(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _pong: String = ::redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("ping", e))?;
        Ok(())
    }

    fn queue_key(&self) -> String {
        queue_key(&self.queue_name)
    }

    fn registry_key(&self, registry: Registry) -> String {
        registry_key(&self.queue_name, registry)
    }

    async fn publish_stop(&self, key: &JobKey) -> Result<(), QueueError> {
        let command = StopCommand {
            command: STOP_JOB_COMMAND.to_string(),
            job_id: key.as_str().to_string(),
        };
        let message = serde_json::to_string(&command)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(COMMAND_CHANNEL)
            .arg(message)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("publish_stop", e))?;
        Ok(())
    }

    async fn reap_abandoned(&self) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let reaped: i64 = self
            .scripts
            .reap
            .key(self.registry_key(Registry::Started))
            .key(self.registry_key(Registry::Failed))
            .arg(Utc::now().timestamp_millis())
            .arg(JOB_KEY_PREFIX)
            .arg(ABANDONED_JOB_DETAIL)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("reap_abandoned", e))?;
        if reaped > 0 {
            debug!(count = reaped, "moved abandoned jobs to failed registry");
        }
        Ok(())
    }

    async fn prune_expired(&self, registry: Registry) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _pruned: i64 = self
            .scripts
            .prune
            .key(self.registry_key(registry))
            .arg(Utc::now().timestamp_millis())
            .arg(JOB_KEY_PREFIX)
            .arg(registry.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("prune_expired", e))?;
        Ok(())
    }
}

#[async_trait]
impl QueueClient for RedisQueue {
    #[instrument(skip(self), fields(job_key = %key), err)]
    async fn fetch(&self, key: &JobKey) -> Result<Option<BrokerJob>, QueueError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = ::redis::cmd("HGETALL")
            .arg(job_key(key))
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("fetch", e))?;
        if fields.is_empty() {
            return Ok(None);
        }
        parse_job(key, &fields).map(Some)
    }

    #[instrument(skip(self, payload, options), fields(job_key = %key), err)]
    async fn create_if_absent(
        &self,
        key: &JobKey,
        payload: &JobPayload,
        options: &JobOptions,
    ) -> Result<BrokerJob, QueueError> {
        let payload_json =
            serde_json::to_string(payload).map_err(|e| QueueError::Serialization(e.to_string()))?;

        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = self
            .scripts
            .create
            .key(job_key(key))
            .key(self.queue_key())
            .arg(key.as_str())
            .arg(payload_json)
            .arg(Utc::now().timestamp_millis())
            .arg(options.timeout.as_secs())
            .arg(options.failure_ttl.as_secs())
            .arg(options.result_ttl.as_secs())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("create_if_absent", e))?;

        parse_job(key, &fields)
    }

    #[instrument(skip(self), fields(job_key = %key), err)]
    async fn cancel_and_remove(&self, key: &JobKey) -> Result<(), QueueError> {
        // A worker that misses the command finds the record gone when it
        // reports back.
        if let Err(e) = self.publish_stop(key).await {
            warn!(job_key = %key, error = %e, "failed to publish stop command");
        }

        let mut conn = self.conn.clone();
        let mut invocation = self.scripts.cancel.prepare_invoke();
        for script_key in cancel_script_keys(&self.queue_name, key) {
            invocation.key(script_key);
        }
        let deleted: i64 = invocation
            .arg(key.as_str())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("cancel_and_remove", e))?;
        if deleted == 0 {
            debug!(job_key = %key, "no job record to remove");
        }
        Ok(())
    }

    #[instrument(skip(self), fields(registry = %registry, cursor = cursor.0), err)]
    async fn enumerate_registry(
        &self,
        registry: Registry,
        cursor: RegistryCursor,
    ) -> Result<RegistryPage, QueueError> {
        if cursor == RegistryCursor::start() {
            match registry {
                Registry::Failed => {
                    self.reap_abandoned().await?;
                    self.prune_expired(Registry::Failed).await?;
                }
                Registry::Finished => self.prune_expired(Registry::Finished).await?,
                _ => {}
            }
        }

        let start = cursor.0;
        let stop = start + self.page_size as u64 - 1;
        let (command, list_key) = match registry {
            Registry::Queued => ("LRANGE", self.queue_key()),
            other => ("ZRANGE", self.registry_key(other)),
        };

        let mut conn = self.conn.clone();
        let raw: Vec<String> = ::redis::cmd(command)
            .arg(list_key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("enumerate_registry", e))?;

        let next =
            (raw.len() == self.page_size).then(|| RegistryCursor(start + raw.len() as u64));
        Ok(RegistryPage {
            keys: raw.into_iter().map(JobKey::from_raw).collect(),
            next,
        })
    }
}

#[async_trait]
impl WorkerQueue for RedisQueue {
    #[instrument(skip(self), err)]
    async fn claim_next(&self) -> Result<Option<BrokerJob>, QueueError> {
        let mut conn = self.conn.clone();
        let claimed: Option<String> = self
            .scripts
            .claim
            .key(self.queue_key())
            .key(self.registry_key(Registry::Started))
            .arg(Utc::now().timestamp_millis())
            .arg(JOB_KEY_PREFIX)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("claim_next", e))?;

        match claimed {
            Some(raw) => self.fetch(&JobKey::from_raw(raw)).await,
            None => Ok(None),
        }
    }

    #[instrument(skip(self), fields(job_key = %key), err)]
    async fn complete(&self, key: &JobKey) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .scripts
            .complete
            .key(job_key(key))
            .key(self.registry_key(Registry::Started))
            .key(self.registry_key(Registry::Finished))
            .arg(key.as_str())
            .arg(Utc::now().timestamp_millis())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("complete", e))?;
        Ok(applied == 1)
    }

    #[instrument(skip(self, detail), fields(job_key = %key), err)]
    async fn fail(&self, key: &JobKey, detail: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn.clone();
        let applied: i64 = self
            .scripts
            .fail
            .key(job_key(key))
            .key(self.registry_key(Registry::Started))
            .key(self.registry_key(Registry::Failed))
            .arg(key.as_str())
            .arg(Utc::now().timestamp_millis())
            .arg(detail)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| map_redis_error("fail", e))?;
        Ok(applied == 1)
    }

    async fn stop_requested(&self, key: &JobKey) -> Result<(), QueueError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| map_redis_error("stop_requested", e))?;
        pubsub
            .subscribe(COMMAND_CHANNEL)
            .await
            .map_err(|e| map_redis_error("stop_requested", e))?;

        let mut messages = pubsub.on_message();
        while let Some(message) = messages.next().await {
            let raw: String = match message.get_payload() {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "unreadable command message");
                    continue;
                }
            };
            if parse_stop_command(&raw).as_ref() == Some(key) {
                return Ok(());
            }
        }
        Err(QueueError::Connection(
            "stop_requested: command subscription closed".to_string(),
        ))
    }
}

/// Message published on the command channel.
#[derive(Debug, Serialize, Deserialize)]
struct StopCommand {
    command: String,
    job_id: String,
}

/// The job a command message asks to stop, if it is a stop command.
fn parse_stop_command(raw: &str) -> Option<JobKey> {
    let command: StopCommand = serde_json::from_str(raw).ok()?;
    (command.command == STOP_JOB_COMMAND).then(|| JobKey::from_raw(command.job_id))
}

fn job_key(key: &JobKey) -> String {
    format!("{JOB_KEY_PREFIX}{key}")
}

fn queue_key(queue_name: &str) -> String {
    format!("esprr:queue:{queue_name}")
}

fn registry_key(queue_name: &str, registry: Registry) -> String {
    format!("esprr:{queue_name}:{}", registry.as_str())
}

/// Keys touched by the cancel script: the queue list, every sorted-set
/// registry, then the job record.
fn cancel_script_keys(queue_name: &str, key: &JobKey) -> Vec<String> {
    let mut keys = vec![queue_key(queue_name)];
    keys.extend(
        Registry::ALL
            .into_iter()
            .filter(|registry| *registry != Registry::Queued)
            .map(|registry| registry_key(queue_name, registry)),
    );
    keys.push(job_key(key));
    keys
}

/// Map a Redis error to a `QueueError`, keeping the failing operation.
fn map_redis_error(operation: &str, err: RedisError) -> QueueError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        QueueError::Connection(format!("{operation}: {err}"))
    } else {
        QueueError::Command(format!("{operation}: {err}"))
    }
}

/// Rebuild a job from its hash fields.
fn parse_job(key: &JobKey, fields: &HashMap<String, String>) -> Result<BrokerJob, QueueError> {
    let corrupt = |reason: String| QueueError::CorruptJob {
        key: key.to_string(),
        reason,
    };
    let field = |name: &str| {
        fields
            .get(name)
            .ok_or_else(|| corrupt(format!("missing field {name}")))
    };
    let millis = |name: &str| -> Result<Option<DateTime<Utc>>, QueueError> {
        match fields.get(name) {
            None => Ok(None),
            Some(raw) => {
                let ms: i64 = raw
                    .parse()
                    .map_err(|e| corrupt(format!("{name}: {e}")))?;
                DateTime::from_timestamp_millis(ms)
                    .map(Some)
                    .ok_or_else(|| corrupt(format!("{name}: out of range")))
            }
        }
    };
    let seconds = |name: &str| -> Result<std::time::Duration, QueueError> {
        let secs: u64 = field(name)?
            .parse()
            .map_err(|e| corrupt(format!("{name}: {e}")))?;
        Ok(std::time::Duration::from_secs(secs))
    };

    let payload: JobPayload = serde_json::from_str(field("payload")?)
        .map_err(|e| corrupt(format!("payload: {e}")))?;
    let registry_name = field("registry")?;
    let registry = Registry::from_name(registry_name)
        .ok_or_else(|| corrupt(format!("unknown registry {registry_name}")))?;
    let created_at =
        millis("created_at")?.ok_or_else(|| corrupt("missing field created_at".into()))?;

    Ok(BrokerJob {
        key: key.clone(),
        payload,
        registry,
        options: JobOptions {
            timeout: seconds("timeout")?,
            failure_ttl: seconds("failure_ttl")?,
            result_ttl: seconds("result_ttl")?,
        },
        created_at,
        enqueued_at: millis("enqueued_at")?,
        started_at: millis("started_at")?,
        ended_at: millis("ended_at")?,
        failure: fields.get("failure").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use esprr_core::{Dataset, SystemId, UserId};

    fn fields(payload: &JobPayload) -> HashMap<String, String> {
        HashMap::from([
            ("payload".to_string(), serde_json::to_string(payload).unwrap()),
            ("registry".to_string(), "started".to_string()),
            ("created_at".to_string(), "1700000000000".to_string()),
            ("enqueued_at".to_string(), "1700000000000".to_string()),
            ("started_at".to_string(), "1700000005000".to_string()),
            ("timeout".to_string(), "600".to_string()),
            ("failure_ttl".to_string(), "1209600".to_string()),
            ("result_ttl".to_string(), "0".to_string()),
        ])
    }

    #[test]
    fn parses_job_hash() {
        let payload = JobPayload::new(
            SystemId::new(),
            Dataset::nsrdb_2019(),
            UserId::new("auth0|owner").unwrap(),
        );
        let key = payload.key();
        let job = parse_job(&key, &fields(&payload)).unwrap();

        assert_eq!(job.payload, payload);
        assert_eq!(job.registry, Registry::Started);
        assert!(job.is_started());
        assert_eq!(job.options, JobOptions::default());
        assert_eq!(job.ended_at, None);
    }

    #[test]
    fn corrupt_hash_is_reported() {
        let payload = JobPayload::new(
            SystemId::new(),
            Dataset::nsrdb_2019(),
            UserId::new("auth0|owner").unwrap(),
        );
        let key = payload.key();
        let mut bad = fields(&payload);
        bad.insert("registry".to_string(), "limbo".to_string());
        assert!(matches!(parse_job(&key, &bad), Err(QueueError::CorruptJob { .. })));

        let mut bad = fields(&payload);
        bad.remove("payload");
        assert!(matches!(parse_job(&key, &bad), Err(QueueError::CorruptJob { .. })));
    }

    #[test]
    fn cancel_touches_every_place_a_key_can_live() {
        let key = JobKey::from_raw("system:NSRDB_2019:user");
        let keys = cancel_script_keys("jobs", &key);

        assert_eq!(keys.first().map(String::as_str), Some("esprr:queue:jobs"));
        assert_eq!(
            keys.last().map(String::as_str),
            Some("esprr:job:system:NSRDB_2019:user")
        );
        for registry in Registry::ALL.into_iter().filter(|r| *r != Registry::Queued) {
            assert!(keys.contains(&registry_key("jobs", registry)), "{registry}");
        }
        assert_eq!(keys.len(), Registry::ALL.len() + 1);
        let distinct: std::collections::HashSet<&String> = keys.iter().collect();
        assert_eq!(distinct.len(), keys.len());
    }

    #[test]
    fn stop_commands_name_their_job() {
        let key = JobKey::from_raw("system:NSRDB_2019:user");
        let published = serde_json::to_string(&StopCommand {
            command: STOP_JOB_COMMAND.to_string(),
            job_id: key.as_str().to_string(),
        })
        .unwrap();

        assert_eq!(parse_stop_command(&published), Some(key));
        assert_eq!(
            parse_stop_command(r#"{"command":"kill-horse","job_id":"x"}"#),
            None
        );
        assert_eq!(parse_stop_command("not json"), None);
    }
}
