// Backend wiring for the fleet service
// Decision: PostgreSQL channels and store when DATABASE_URL is set, in-memory otherwise (dev mode)
//
// Compute is chosen separately: Docker in production, an in-memory fake for
// local runs without a Docker daemon.

use std::str::FromStr;
use std::sync::Arc;

use labelq_fleet::config::parse_setting;
use labelq_fleet::{
    run_migrations, ChannelConfig, ComputeClient, ComputeError, ConfigError, CorrelationStore,
    DockerCompute, FleetDeps, InMemoryChannel, InMemoryCompute, InMemoryCorrelationStore,
    MessageChannel, PostgresChannel, PostgresCorrelationStore, StoreError,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

/// Which compute provider runs the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ComputeBackend {
    #[default]
    Docker,
    Memory,
}

impl FromStr for ComputeBackend {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(Self::Docker),
            "memory" | "in-memory" => Ok(Self::Memory),
            other => Err(BackendError::UnknownCompute(other.to_string())),
        }
    }
}

/// Backend wiring errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown compute backend: {0}")]
    UnknownCompute(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] StoreError),

    #[error(transparent)]
    Compute(#[from] ComputeError),
}

/// Where the control plane finds its collaborators
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// PostgreSQL URL; `None` selects in-memory channels and store
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub compute: ComputeBackend,
    /// Docker network workers join, so they can reach the database
    pub docker_network: Option<String>,
}

impl BackendConfig {
    /// Read backend settings from the environment
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: PostgreSQL connection string
    /// - `LABELQ_DB_MAX_CONNECTIONS`: pool size (default: 10)
    /// - `LABELQ_COMPUTE_BACKEND`: "docker" (default) or "memory"
    /// - `LABELQ_DOCKER_NETWORK`: network mode for worker containers
    pub fn from_env() -> Result<Self, BackendError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, BackendError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let compute = match lookup("LABELQ_COMPUTE_BACKEND") {
            Some(value) => value.parse()?,
            None => ComputeBackend::default(),
        };
        let max_connections = match lookup("LABELQ_DB_MAX_CONNECTIONS") {
            Some(raw) => parse_setting::<u32>("LABELQ_DB_MAX_CONNECTIONS", &raw)?,
            None => 10,
        };
        if max_connections == 0 {
            return Err(ConfigError::Invalid {
                key: "LABELQ_DB_MAX_CONNECTIONS",
                reason: "must be at least 1".to_string(),
            }
            .into());
        }

        Ok(Self {
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            max_connections,
            compute,
            docker_network: lookup("LABELQ_DOCKER_NETWORK"),
        })
    }

    pub fn is_dev_mode(&self) -> bool {
        self.database_url.is_none()
    }
}

/// Connect channels, store and compute according to `config`
pub async fn connect(
    config: &BackendConfig,
    channels: &ChannelConfig,
) -> Result<FleetDeps, BackendError> {
    let (jobs, replies, store): (
        Arc<dyn MessageChannel>,
        Arc<dyn MessageChannel>,
        Arc<dyn CorrelationStore>,
    ) = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections.max(1))
                .connect(url)
                .await?;
            run_migrations(&pool).await?;
            info!("Connected to PostgreSQL");
            (
                Arc::new(
                    PostgresChannel::new(pool.clone(), &channels.jobs)
                        .with_visibility_timeout(channels.visibility_timeout),
                ),
                Arc::new(
                    PostgresChannel::new(pool.clone(), &channels.replies)
                        .with_visibility_timeout(channels.visibility_timeout),
                ),
                Arc::new(PostgresCorrelationStore::new(pool)),
            )
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory channels; external workers cannot connect");
            (
                Arc::new(
                    InMemoryChannel::new(&channels.jobs)
                        .with_visibility_timeout(channels.visibility_timeout),
                ),
                Arc::new(
                    InMemoryChannel::new(&channels.replies)
                        .with_visibility_timeout(channels.visibility_timeout),
                ),
                Arc::new(InMemoryCorrelationStore::new()),
            )
        }
    };

    let compute: Arc<dyn ComputeClient> = match config.compute {
        ComputeBackend::Docker => {
            let mut docker = DockerCompute::connect()?;
            if let Some(network) = &config.docker_network {
                docker = docker.with_network_mode(network);
            }
            info!("Using Docker compute");
            Arc::new(docker)
        }
        ComputeBackend::Memory => {
            warn!("Using in-memory compute; no real workers will be launched");
            Arc::new(InMemoryCompute::new())
        }
    };

    Ok(FleetDeps {
        jobs,
        replies,
        store,
        compute,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_backend_parse() {
        assert_eq!("docker".parse::<ComputeBackend>().unwrap(), ComputeBackend::Docker);
        assert_eq!(" Memory ".parse::<ComputeBackend>().unwrap(), ComputeBackend::Memory);
        assert!(matches!(
            "ec2".parse::<ComputeBackend>(),
            Err(BackendError::UnknownCompute(name)) if name == "ec2"
        ));
    }

    #[test]
    fn test_from_lookup_rejects_bad_pool_size() {
        let lookup = |value: &'static str| {
            move |key: &str| (key == "LABELQ_DB_MAX_CONNECTIONS").then(|| value.to_string())
        };

        assert_eq!(BackendConfig::from_lookup(lookup("4")).unwrap().max_connections, 4);
        assert!(matches!(
            BackendConfig::from_lookup(lookup("many")),
            Err(BackendError::Config(ConfigError::Invalid {
                key: "LABELQ_DB_MAX_CONNECTIONS",
                ..
            }))
        ));
        assert!(matches!(
            BackendConfig::from_lookup(lookup("0")),
            Err(BackendError::Config(_))
        ));
        assert_eq!(
            BackendConfig::from_lookup(|_: &str| None).unwrap().max_connections,
            10
        );
    }

    #[tokio::test]
    async fn test_connect_dev_mode() {
        let config = BackendConfig {
            compute: ComputeBackend::Memory,
            ..Default::default()
        };
        assert!(config.is_dev_mode());

        let deps = connect(&config, &ChannelConfig::default()).await.unwrap();
        assert_eq!(deps.jobs.name(), "labelq-requests");
        assert_eq!(deps.replies.name(), "labelq-responses");
        assert!(deps.compute.list(&Default::default()).await.unwrap().is_empty());
    }
}
