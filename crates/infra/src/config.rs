//! Process configuration loaded from `ESPRR_*` environment variables.
//!
//! Variables map onto [`SyncConfig`] fields after the prefix is removed:
//! `ESPRR_REDIS_*` and `ESPRR_MYSQL_*` fill the connection sections,
//! `ESPRR_JOB_TIMEOUT`, `ESPRR_FAILURE_TTL` and `ESPRR_RESULT_TTL` (seconds)
//! fill the job limits, and the rest are top-level (`ESPRR_QUEUE_NAME`,
//! `ESPRR_SYNC_JOBS_PERIOD`, `ESPRR_SYNC_ERROR_POLICY`). Anything unset keeps
//! its default.

use std::time::Duration;

use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;
use sqlx::mysql::{MySqlConnectOptions, MySqlSslMode};

use crate::queue::types::duration_secs;
use crate::queue::JobOptions;
use crate::sync::ErrorPolicy;

/// Prefix shared by every variable read here.
pub const ENV_PREFIX: &str = "ESPRR_";

const DEFAULT_QUEUE_NAME: &str = "jobs";
const DEFAULT_SYNC_PERIOD_SECS: u64 = 15;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A variable could not be read into its field.
    #[error("failed to load configuration: {0}")]
    Load(String),

    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Load(err.to_string())
    }
}

/// Redis connection settings.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
    /// Full connection URL; takes precedence over the individual parts.
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: None,
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
        }
    }
}

impl RedisSettings {
    /// Connection URL in `redis://[user[:pass]@]host:port/db` form.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}

impl core::fmt::Debug for RedisSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisSettings")
            .field("url", &self.url.as_ref().map(|_| "<redacted>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("db", &self.db)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// MySQL settings for the manager account used by the sync process.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MySqlSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
    pub use_ssl: bool,
}

impl Default for MySqlSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "apiuser".to_string(),
            password: None,
            database: "esprr_data".to_string(),
            use_ssl: true,
        }
    }
}

impl MySqlSettings {
    pub fn connect_options(&self) -> MySqlConnectOptions {
        let options = MySqlConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .ssl_mode(if self.use_ssl {
                MySqlSslMode::Required
            } else {
                MySqlSslMode::Disabled
            });
        match &self.password {
            Some(password) => options.password(password),
            None => options,
        }
    }
}

impl core::fmt::Debug for MySqlSettings {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MySqlSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .field("use_ssl", &self.use_ssl)
            .finish()
    }
}

/// Everything the sync process needs to start.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub redis: RedisSettings,
    pub mysql: MySqlSettings,
    pub queue_name: String,
    /// Sleep between reconciliation cycles.
    #[serde(rename = "sync_jobs_period", with = "duration_secs")]
    pub sync_period: Duration,
    /// Limits applied to jobs the sync loop creates.
    pub job_options: JobOptions,
    #[serde(rename = "sync_error_policy")]
    pub error_policy: ErrorPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            mysql: MySqlSettings::default(),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            sync_period: Duration::from_secs(DEFAULT_SYNC_PERIOD_SECS),
            job_options: JobOptions::default(),
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Figment reading the `ESPRR_*` environment.
    pub fn figment() -> Figment {
        Figment::new().merge(Env::prefixed(ENV_PREFIX).map(|key| env_path(key.as_str()).into()))
    }

    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_figment(Self::figment())
    }

    /// Extract from any figment, then validate.
    pub fn from_figment(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sync_period.is_zero() {
            return Err(invalid("SYNC_JOBS_PERIOD", "0", "must be positive"));
        }
        if self.queue_name.trim().is_empty() {
            return Err(invalid("QUEUE_NAME", &self.queue_name, "must not be empty"));
        }
        if self.job_options.timeout.is_zero() {
            return Err(invalid("JOB_TIMEOUT", "0", "must be positive"));
        }
        Ok(())
    }
}

/// Field path for an environment key with the prefix already removed.
fn env_path(key: &str) -> String {
    let key = key.to_ascii_lowercase();
    if let Some(field) = key.strip_prefix("redis_") {
        return format!("redis.{field}");
    }
    if let Some(field) = key.strip_prefix("mysql_") {
        return format!("mysql.{field}");
    }
    match key.as_str() {
        "job_timeout" => "job_options.timeout".to_string(),
        "failure_ttl" | "result_ttl" => format!("job_options.{key}"),
        _ => key,
    }
}

fn invalid(name: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: format!("{ENV_PREFIX}{name}"),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
