//! Fleet configuration
//!
//! Every component config has sensible defaults; [`FleetConfig::from_env`]
//! overrides them from `LABELQ_*` environment variables.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::DispatchConfig;
use crate::ingest::IngestConfig;
use crate::monitor::MonitorConfig;
use crate::pool::PoolConfig;
use crate::reaper::ReaperConfig;

/// Channel names passed to workers so both sides agree
pub const JOB_CHANNEL_ENV: &str = "LABELQ_JOB_CHANNEL";
pub const REPLY_CHANNEL_ENV: &str = "LABELQ_REPLY_CHANNEL";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Job and reply channel settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub jobs: String,
    pub replies: String,

    /// How long a received message stays hidden before redelivery
    #[serde(with = "duration_millis")]
    pub visibility_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            jobs: "labelq-requests".to_string(),
            replies: "labelq-responses".to_string(),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// Complete configuration of the control-plane side of the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    pub channels: ChannelConfig,
    pub pool: PoolConfig,
    pub monitor: MonitorConfig,
    pub ingest: IngestConfig,
    pub dispatch: DispatchConfig,
    pub reaper: ReaperConfig,

    /// How long shutdown waits for background loops
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            channels: ChannelConfig::default(),
            pool: PoolConfig::default(),
            monitor: MonitorConfig::default(),
            ingest: IngestConfig::default(),
            dispatch: DispatchConfig::default(),
            reaper: ReaperConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl FleetConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(jobs) = lookup(JOB_CHANNEL_ENV) {
            config.channels.jobs = jobs;
        }
        if let Some(replies) = lookup(REPLY_CHANNEL_ENV) {
            config.channels.replies = replies;
        }
        if let Some(secs) = parse(&lookup, "LABELQ_VISIBILITY_TIMEOUT_SECS")? {
            config.channels.visibility_timeout = Duration::from_secs(secs);
        }

        if let Some(max_slots) = parse(&lookup, "LABELQ_MAX_SLOTS")? {
            config.pool.max_slots = max_slots;
        }
        if let Some(prefix) = lookup("LABELQ_SLOT_PREFIX") {
            config.pool.slot_prefix = prefix;
        }
        if let Some(image) = lookup("LABELQ_WORKER_IMAGE") {
            config.pool.launch.image = image;
        }
        if let Some(machine_type) = lookup("LABELQ_WORKER_MACHINE_TYPE") {
            config.pool.launch.machine_type = machine_type;
        }
        if let Some(bootstrap) = lookup("LABELQ_WORKER_BOOTSTRAP") {
            config.pool.launch.bootstrap = bootstrap.split_whitespace().map(str::to_string).collect();
        }

        // Workers need the same channels and database as the control plane
        let launch_env = &mut config.pool.launch.env;
        launch_env.insert(JOB_CHANNEL_ENV.to_string(), config.channels.jobs.clone());
        launch_env.insert(REPLY_CHANNEL_ENV.to_string(), config.channels.replies.clone());
        if let Some(url) = lookup("LABELQ_WORKER_DATABASE_URL").or_else(|| lookup("DATABASE_URL")) {
            launch_env.insert("DATABASE_URL".to_string(), url);
        }

        if let Some(secs) = parse(&lookup, "LABELQ_MONITOR_INTERVAL_SECS")? {
            config.monitor.interval = Duration::from_secs(secs);
        }

        if let Some(batch) = parse(&lookup, "LABELQ_INGEST_BATCH_SIZE")? {
            config.ingest.batch_size = batch;
        }
        if let Some(secs) = parse(&lookup, "LABELQ_INGEST_WAIT_SECS")? {
            config.ingest.wait = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "LABELQ_INGEST_IDLE_MS")? {
            config.ingest.idle = Duration::from_millis(ms);
        }

        if let Some(secs) = parse(&lookup, "LABELQ_RESULT_TIMEOUT_SECS")? {
            config.dispatch.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = parse(&lookup, "LABELQ_POLL_INTERVAL_MS")? {
            config.dispatch.poll_interval = Duration::from_millis(ms);
        }

        if let Some(secs) = parse(&lookup, "LABELQ_REAPER_INTERVAL_SECS")? {
            config.reaper.interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse(&lookup, "LABELQ_PENDING_MAX_AGE_SECS")? {
            config.reaper.max_age = Duration::from_secs(secs);
        }

        if let Some(secs) = parse(&lookup, "LABELQ_SHUTDOWN_TIMEOUT_SECS")? {
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the fleet cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool.max_slots == 0 {
            return Err(ConfigError::invalid("LABELQ_MAX_SLOTS", "must be at least 1"));
        }
        if self.pool.slot_prefix.is_empty() {
            return Err(ConfigError::invalid("LABELQ_SLOT_PREFIX", "must not be empty"));
        }
        if self.channels.jobs.is_empty() || self.channels.jobs == self.channels.replies {
            return Err(ConfigError::invalid(
                JOB_CHANNEL_ENV,
                "job and reply channels must be distinct and non-empty",
            ));
        }
        if self.dispatch.poll_interval.is_zero() {
            return Err(ConfigError::invalid("LABELQ_POLL_INTERVAL_MS", "must be positive"));
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigError::invalid("LABELQ_INGEST_BATCH_SIZE", "must be at least 1"));
        }
        if self.monitor.interval.is_zero() {
            return Err(ConfigError::invalid("LABELQ_MONITOR_INTERVAL_SECS", "must be positive"));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    lookup(key).map(|raw| parse_setting(key, &raw)).transpose()
}

/// Parse one raw setting, naming `key` in the error
pub fn parse_setting<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid(key, format!("{raw:?}: {e}")))
}

/// Serde helper for Duration as milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = FleetConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.pool.max_slots, 20);
        assert_eq!(config.pool.slot_prefix, "app-instance");
        assert_eq!(config.monitor.interval, Duration::from_secs(10));
        assert_eq!(config.dispatch.timeout, Duration::from_secs(600));
        assert_eq!(config.dispatch.poll_interval, Duration::from_millis(500));
        assert_eq!(config.ingest.batch_size, 10);
        assert_eq!(config.ingest.wait, Duration::from_secs(20));
        assert_eq!(config.ingest.idle, Duration::from_secs(1));
        assert_eq!(
            config.pool.launch.env.get(JOB_CHANNEL_ENV).map(String::as_str),
            Some("labelq-requests")
        );
    }

    #[test]
    fn test_overrides() {
        let config = FleetConfig::from_lookup(lookup(&[
            ("LABELQ_MAX_SLOTS", "5"),
            ("LABELQ_SLOT_PREFIX", "labeler"),
            ("LABELQ_WORKER_BOOTSTRAP", "labelq-worker --once"),
            ("LABELQ_RESULT_TIMEOUT_SECS", "30"),
            ("LABELQ_JOB_CHANNEL", "jobs-dev"),
            ("DATABASE_URL", "postgres://localhost/labelq"),
        ]))
        .unwrap();

        assert_eq!(config.pool.max_slots, 5);
        assert_eq!(config.pool.slot_prefix, "labeler");
        assert_eq!(config.pool.launch.bootstrap, vec!["labelq-worker", "--once"]);
        assert_eq!(config.dispatch.timeout, Duration::from_secs(30));
        assert_eq!(config.pool.launch.env["LABELQ_JOB_CHANNEL"], "jobs-dev");
        assert_eq!(
            config.pool.launch.env["DATABASE_URL"],
            "postgres://localhost/labelq"
        );
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = FleetConfig::from_lookup(lookup(&[("LABELQ_MAX_SLOTS", "many")])).unwrap_err();
        assert!(err.to_string().contains("LABELQ_MAX_SLOTS"));

        assert!(FleetConfig::from_lookup(lookup(&[("LABELQ_MAX_SLOTS", "0")])).is_err());
        assert!(FleetConfig::from_lookup(lookup(&[
            ("LABELQ_JOB_CHANNEL", "same"),
            ("LABELQ_REPLY_CHANNEL", "same"),
        ]))
        .is_err());
    }

    #[test]
    fn test_serde_durations_in_millis() {
        let config = FleetConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["dispatch"]["poll_interval"], 500);

        let parsed: FleetConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, config);
    }
}
