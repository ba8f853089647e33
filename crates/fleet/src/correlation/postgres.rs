//! PostgreSQL implementation of CorrelationStore
//!
//! One row per correlation id. A `NULL` response is the pending sentinel, so an
//! empty string remains a legitimate worker result.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};

use super::store::*;

/// PostgreSQL implementation of CorrelationStore
///
/// Entries survive restarts of the control plane, so a waiter can keep
/// polling while the ingest loop is restarted.
///
/// # Example
///
/// ```ignore
/// use labelq_fleet::PostgresCorrelationStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/labelq").await?;
/// labelq_fleet::run_migrations(&pool).await?;
/// let store = PostgresCorrelationStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresCorrelationStore {
    pool: PgPool,
}

impl PostgresCorrelationStore {
    /// Create a new store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl CorrelationStore for PostgresCorrelationStore {
    #[instrument(skip(self))]
    async fn register(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO correlations (correlation_id)
            VALUES ($1)
            ON CONFLICT (correlation_id) DO NOTHING
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register correlation: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(correlation_id = %id, "registered correlation");
        Ok(())
    }

    #[instrument(skip(self, value))]
    async fn fulfill(&self, id: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO correlations (correlation_id, response, fulfilled_at)
            VALUES ($1, $2, now())
            ON CONFLICT (correlation_id)
            DO UPDATE SET response = EXCLUDED.response, fulfilled_at = now()
            "#,
        )
        .bind(id)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to fulfill correlation: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(correlation_id = %id, "fulfilled correlation");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn status(&self, id: &str) -> Result<Option<CorrelationStatus>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT response FROM correlations WHERE correlation_id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let response: Option<String> = row.get("response");
            match response {
                Some(value) => CorrelationStatus::Ready(value),
                None => CorrelationStatus::Pending,
            }
        }))
    }

    async fn take_ready(&self, id: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            r#"
            DELETE FROM correlations
            WHERE correlation_id = $1 AND response IS NOT NULL
            RETURNING response
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.get::<String, _>("response")))
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM correlations WHERE correlation_id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn purge_pending_older_than(&self, age: Duration) -> Result<usize, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM correlations
            WHERE response IS NULL
              AND created_at < now() - make_interval(secs => $1)
            "#,
        )
        .bind(age.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }
}
