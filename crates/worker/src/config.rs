// Worker configuration
// Decision: failed jobs are dropped by default; redelivery is opt-in

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use labelq_fleet::config::{ChannelConfig, ConfigError, JOB_CHANNEL_ENV, REPLY_CHANNEL_ENV};
use labelq_fleet::WORKER_SLOT_ENV;

/// What happens to a job whose labeling failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailedJobPolicy {
    /// Delete the job; the caller eventually sees "no result"
    #[default]
    Drop,
    /// Leave the job on the channel for redelivery after the visibility timeout
    Release,
}

impl FromStr for FailedJobPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "release" | "retry" => Ok(Self::Release),
            other => Err(format!("unknown policy {other:?}, expected drop or release")),
        }
    }
}

/// Configuration for a labeling worker
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Slot this worker fills, for logging only
    pub slot: Option<String>,
    pub channels: ChannelConfig,
    /// PostgreSQL URL of the shared channels
    pub database_url: Option<String>,
    /// Classifier program and leading arguments; the image path is appended
    pub classifier_command: Vec<String>,
    /// Where received images are written before classification
    pub work_dir: PathBuf,
    /// Long-poll wait per receive
    pub receive_wait: Duration,
    /// Pause after a failed receive
    pub error_backoff: Duration,
    pub failed_job_policy: FailedJobPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            slot: None,
            channels: ChannelConfig::default(),
            database_url: None,
            classifier_command: vec!["python3".to_string(), "image_classification.py".to_string()],
            work_dir: std::env::temp_dir().join("labelq-worker"),
            receive_wait: Duration::from_secs(10),
            error_backoff: Duration::from_secs(5),
            failed_job_policy: FailedJobPolicy::default(),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string (required by the binary)
    /// - `LABELQ_JOB_CHANNEL` / `LABELQ_REPLY_CHANNEL`: channel names
    /// - `LABELQ_VISIBILITY_TIMEOUT_SECS`: hide time for received jobs
    /// - `LABELQ_WORKER_SLOT`: set by the control plane at launch
    /// - `LABELQ_CLASSIFIER_COMMAND`: whitespace-separated command
    /// - `LABELQ_WORK_DIR`: directory for received images
    /// - `LABELQ_RECEIVE_WAIT_SECS`: long-poll wait (default: 10)
    /// - `LABELQ_FAILED_JOB_POLICY`: "drop" (default) or "release"
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            slot: lookup(WORKER_SLOT_ENV),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            ..Default::default()
        };

        if let Some(jobs) = lookup(JOB_CHANNEL_ENV) {
            config.channels.jobs = jobs;
        }
        if let Some(replies) = lookup(REPLY_CHANNEL_ENV) {
            config.channels.replies = replies;
        }
        if let Some(raw) = lookup("LABELQ_VISIBILITY_TIMEOUT_SECS") {
            config.channels.visibility_timeout =
                Duration::from_secs(parse_secs("LABELQ_VISIBILITY_TIMEOUT_SECS", &raw)?);
        }
        if let Some(command) = lookup("LABELQ_CLASSIFIER_COMMAND") {
            config.classifier_command = command.split_whitespace().map(str::to_string).collect();
        }
        if let Some(dir) = lookup("LABELQ_WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup("LABELQ_RECEIVE_WAIT_SECS") {
            config.receive_wait = Duration::from_secs(parse_secs("LABELQ_RECEIVE_WAIT_SECS", &raw)?);
        }
        if let Some(raw) = lookup("LABELQ_FAILED_JOB_POLICY") {
            config.failed_job_policy = raw.parse().map_err(|reason| ConfigError::Invalid {
                key: "LABELQ_FAILED_JOB_POLICY",
                reason,
            })?;
        }

        if config.classifier_command.is_empty() {
            return Err(ConfigError::Invalid {
                key: "LABELQ_CLASSIFIER_COMMAND",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(config)
    }

    pub fn with_failed_job_policy(mut self, policy: FailedJobPolicy) -> Self {
        self.failed_job_policy = policy;
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_classifier_command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.classifier_command = command.into_iter().map(Into::into).collect();
        self
    }
}

fn parse_secs(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim().parse().map_err(|e| ConfigError::Invalid {
        key,
        reason: format!("{raw:?}: {e}"),
    })
}
