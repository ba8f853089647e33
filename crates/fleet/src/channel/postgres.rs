//! PostgreSQL implementation of MessageChannel
//!
//! Production queue on top of the fleet database:
//! - Efficient concurrent claiming with SKIP LOCKED
//! - Visibility timeout via `visible_at`, fresh receipt handle per delivery
//! - Long polling by re-checking at a short interval until the wait elapses

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::{debug, error, instrument, trace};
use uuid::Uuid;

use super::message::*;

/// PostgreSQL implementation of MessageChannel
///
/// # Example
///
/// ```ignore
/// use labelq_fleet::PostgresChannel;
///
/// let jobs = PostgresChannel::new(pool.clone(), "labelq-requests");
/// jobs.ensure_exists().await?;
/// ```
#[derive(Clone)]
pub struct PostgresChannel {
    pool: PgPool,
    name: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
}

impl PostgresChannel {
    /// Create a channel handle; call `ensure_exists` before use
    pub fn new(pool: PgPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            visibility_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(250),
        }
    }

    /// Set the visibility timeout for received messages
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    /// Set how often a long poll re-checks the table
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn claim(&self, max_messages: usize) -> Result<Vec<ReceivedMessage>, ChannelError> {
        let rows = sqlx::query(
            r#"
            WITH next AS (
                SELECT id FROM channel_messages
                WHERE queue = $1 AND visible_at <= now()
                ORDER BY sent_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE channel_messages m
            SET receipt_handle = gen_random_uuid(),
                visible_at = now() + make_interval(secs => $3),
                receive_count = m.receive_count + 1
            FROM next
            WHERE m.id = next.id
            RETURNING m.id, m.body, m.attributes, m.receipt_handle, m.receive_count, m.sent_at
            "#,
        )
        .bind(&self.name)
        .bind(max_messages as i64)
        .bind(self.visibility_timeout.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            error!(channel = %self.name, "Failed to claim messages: {}", e);
            ChannelError::Database(e.to_string())
        })?;

        let mut messages: Vec<(chrono::DateTime<chrono::Utc>, ReceivedMessage)> = rows
            .into_iter()
            .map(|row| {
                let id: Uuid = row.get("id");
                let receipt: Uuid = row.get("receipt_handle");
                let attributes: Json<BTreeMap<String, String>> = row.get("attributes");
                let receive_count: i32 = row.get("receive_count");
                (
                    row.get("sent_at"),
                    ReceivedMessage {
                        message_id: id.to_string(),
                        receipt_handle: receipt.to_string(),
                        body: row.get("body"),
                        attributes: attributes.0,
                        receive_count: receive_count.max(0) as u32,
                    },
                )
            })
            .collect();

        // UPDATE ... RETURNING does not preserve the CTE ordering
        messages.sort_by_key(|(sent_at, _)| *sent_at);
        Ok(messages.into_iter().map(|(_, m)| m).collect())
    }
}

#[async_trait]
impl MessageChannel for PostgresChannel {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(channel = %self.name))]
    async fn ensure_exists(&self) -> Result<(), ChannelError> {
        let result = sqlx::query(
            r#"
            INSERT INTO channel_queues (name) VALUES ($1)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&self.name)
        .execute(&self.pool)
        .await
        .map_err(|e| ChannelError::Unavailable(format!("{}: {}", self.name, e)))?;

        if result.rows_affected() > 0 {
            debug!(channel = %self.name, "created channel");
        } else {
            debug!(channel = %self.name, "channel already exists, skipping creation");
        }
        Ok(())
    }

    #[instrument(skip(self, message), fields(channel = %self.name))]
    async fn send(&self, message: OutboundMessage) -> Result<String, ChannelError> {
        let id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO channel_messages (id, queue, body, attributes)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(id)
        .bind(&self.name)
        .bind(&message.body)
        .bind(Json(&message.attributes))
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                ChannelError::NotFound(self.name.clone())
            }
            _ => {
                error!(channel = %self.name, "Failed to send message: {}", e);
                ChannelError::Database(e.to_string())
            }
        })?;

        debug!(message_id = %id, "sent message");
        Ok(id.to_string())
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, ChannelError> {
        let max_messages = max_messages.max(1);
        let deadline = Instant::now() + wait;

        loop {
            let messages = self.claim(max_messages).await?;
            if !messages.is_empty() {
                debug!(channel = %self.name, count = messages.len(), "received messages");
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(vec![]);
            }

            trace!(channel = %self.name, "no messages, waiting");
            tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }

    #[instrument(skip(self), fields(channel = %self.name))]
    async fn delete(&self, receipt_handle: &str) -> Result<(), ChannelError> {
        let receipt = Uuid::parse_str(receipt_handle)
            .map_err(|_| ChannelError::InvalidReceipt(receipt_handle.to_string()))?;

        let result = sqlx::query(
            r#"
            DELETE FROM channel_messages
            WHERE queue = $1 AND receipt_handle = $2
            "#,
        )
        .bind(&self.name)
        .bind(receipt)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ChannelError::InvalidReceipt(receipt_handle.to_string()));
        }
        Ok(())
    }

    async fn approximate_depth(&self) -> Result<usize, ChannelError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS depth FROM channel_messages
            WHERE queue = $1 AND visible_at <= now()
            "#,
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;

        let depth: i64 = row.get("depth");
        Ok(depth.max(0) as usize)
    }
}
