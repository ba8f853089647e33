use std::sync::Arc;

use anyhow::{Context, Result};
use labelq_fleet::telemetry::{init_telemetry, TelemetryConfig};
use labelq_fleet::PostgresChannel;
use labelq_worker::{CommandClassifier, JobConsumer, WorkerConfig};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    init_telemetry(
        TelemetryConfig::from_env()
            .with_service_name("labelq-worker")
            .with_default_filter("labelq_worker=debug,labelq_fleet=info"),
    );

    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    let database_url = config
        .database_url
        .clone()
        .context("DATABASE_URL must be set for workers")?;
    let classifier = CommandClassifier::new(&config.classifier_command)
        .context("LABELQ_CLASSIFIER_COMMAND must not be empty")?;

    let pool = PgPoolOptions::new()
        .max_connections(2)
        .connect(&database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;
    let jobs = PostgresChannel::new(pool.clone(), &config.channels.jobs)
        .with_visibility_timeout(config.channels.visibility_timeout);
    let replies = PostgresChannel::new(pool, &config.channels.replies);

    let consumer = JobConsumer::new(
        Arc::new(jobs),
        Arc::new(replies),
        Arc::new(classifier),
        config,
    );
    consumer
        .prepare()
        .await
        .context("Failed to prepare worker")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(consumer.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");
    shutdown_tx.send_replace(true);

    worker.await.context("Worker task panicked")?;
    tracing::info!("Worker shutdown complete");
    Ok(())
}
