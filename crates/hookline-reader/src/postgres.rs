//! PostgreSQL-backed broker.
//!
//! Topics and subscriptions live in `broker_subscriptions`; every published
//! message is copied once per subscription into `broker_messages`. A receive
//! claims rows with `FOR UPDATE SKIP LOCKED`, stamps them with a fresh lock
//! token and a lock expiry, and bumps their delivery count. Completing a
//! message deletes its row, but only while the lock is still held; an expired
//! lock makes the row claimable again, which is what gives at-least-once
//! redelivery. Rows whose delivery count reaches the subscription's maximum
//! are moved to the dead-letter partition, which dead-letter receivers read.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hookline_core::LockToken;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broker::{Broker, BrokerMessage, BrokerReceiver, ReceiverSpec},
    error::{ReaderError, Result},
};

/// Lock and polling parameters for [`PgBroker`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PgBrokerSettings {
    /// How long a received message stays locked to its receiver.
    pub lock_duration: Duration,
    /// Pause between claim attempts while long-polling an empty queue.
    pub poll_interval: Duration,
}

impl Default for PgBrokerSettings {
    fn default() -> Self {
        Self { lock_duration: Duration::from_secs(60), poll_interval: Duration::from_millis(250) }
    }
}

impl PgBrokerSettings {
    /// Lock duration in the fractional seconds Postgres intervals take.
    fn lock_seconds(&self) -> f64 {
        self.lock_duration.as_secs_f64()
    }
}

/// Broker over a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgBroker {
    pool: PgPool,
    settings: PgBrokerSettings,
}

impl PgBroker {
    /// Creates a broker on an existing pool.
    pub fn new(pool: PgPool, settings: PgBrokerSettings) -> Self {
        Self { pool, settings }
    }

    /// Connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the broker tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns a classified database error.
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broker_subscriptions (
                event_type TEXT NOT NULL,
                subscription_name TEXT NOT NULL,
                max_delivery_count INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                PRIMARY KEY (event_type, subscription_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS broker_messages (
                id BIGSERIAL PRIMARY KEY,
                event_type TEXT NOT NULL,
                subscription_name TEXT NOT NULL,
                message_id TEXT NOT NULL,
                body BYTEA NOT NULL,
                delivery_count INTEGER NOT NULL DEFAULT 0,
                lock_token UUID,
                locked_until TIMESTAMPTZ,
                dead_lettered BOOLEAN NOT NULL DEFAULT FALSE,
                enqueued_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                FOREIGN KEY (event_type, subscription_name)
                    REFERENCES broker_subscriptions (event_type, subscription_name)
                    ON DELETE CASCADE
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_broker_messages_claimable
            ON broker_messages (event_type, subscription_name, dead_lettered, enqueued_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_broker_messages_lock_token
            ON broker_messages (lock_token)
            WHERE lock_token IS NOT NULL
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Publishes a message to every subscription of `event_type` and returns
    /// how many subscriptions received a copy.
    ///
    /// # Errors
    ///
    /// Returns a classified database error.
    pub async fn publish(&self, event_type: &str, message_id: &str, body: &[u8]) -> Result<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO broker_messages (event_type, subscription_name, message_id, body)
            SELECT event_type, subscription_name, $2, $3
            FROM broker_subscriptions
            WHERE event_type = $1
            "#,
        )
        .bind(event_type)
        .bind(message_id)
        .bind(body)
        .execute(&self.pool)
        .await?;

        debug!(event_type, message_id, fan_out = result.rows_affected(), "message published");
        Ok(result.rows_affected())
    }
}

#[async_trait::async_trait]
impl Broker for PgBroker {
    async fn create_topic_and_subscription(
        &self,
        event_type: &str,
        subscription_name: &str,
        max_delivery_count: u32,
    ) -> Result<()> {
        self.ensure_schema().await?;

        let max_delivery_count = i32::try_from(max_delivery_count).map_err(|_| {
            ReaderError::configuration(format!(
                "max_delivery_count {max_delivery_count} does not fit the broker schema"
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO broker_subscriptions (event_type, subscription_name, max_delivery_count)
            VALUES ($1, $2, $3)
            ON CONFLICT (event_type, subscription_name)
            DO UPDATE SET max_delivery_count = EXCLUDED.max_delivery_count
            "#,
        )
        .bind(event_type)
        .bind(subscription_name)
        .bind(max_delivery_count)
        .execute(&self.pool)
        .await?;

        info!(event_type, subscription = subscription_name, "subscription ready");
        Ok(())
    }

    async fn create_receiver(&self, spec: &ReceiverSpec) -> Result<Arc<dyn BrokerReceiver>> {
        let registered: Option<(i32,)> = sqlx::query_as(
            "SELECT max_delivery_count FROM broker_subscriptions \
             WHERE event_type = $1 AND subscription_name = $2",
        )
        .bind(&spec.event_type)
        .bind(&spec.subscription_name)
        .fetch_optional(&self.pool)
        .await?;

        if registered.is_none() {
            return Err(ReaderError::broker(format!(
                "subscription {}/{} does not exist",
                spec.event_type, spec.subscription_name
            )));
        }

        Ok(Arc::new(PgReceiver {
            pool: self.pool.clone(),
            spec: spec.clone(),
            settings: self.settings.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ClaimedRow {
    message_id: String,
    body: Vec<u8>,
    lock_token: Uuid,
    delivery_count: i32,
    enqueued_at: DateTime<Utc>,
}

impl From<ClaimedRow> for BrokerMessage {
    fn from(row: ClaimedRow) -> Self {
        Self {
            message_id: row.message_id,
            body: Bytes::from(row.body),
            lock_token: LockToken(row.lock_token),
            delivery_count: u32::try_from(row.delivery_count).unwrap_or(0),
            enqueued_at: row.enqueued_at,
        }
    }
}

/// Receiver on one subscription of a [`PgBroker`].
#[derive(Debug)]
pub struct PgReceiver {
    pool: PgPool,
    spec: ReceiverSpec,
    settings: PgBrokerSettings,
    closed: AtomicBool,
}

impl PgReceiver {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReaderError::broker("receiver is closed"));
        }
        Ok(())
    }

    /// Moves unlocked messages that exhausted their deliveries to the
    /// dead-letter partition.
    async fn dead_letter_exhausted(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE broker_messages m
            SET dead_lettered = TRUE, lock_token = NULL, locked_until = NULL
            FROM broker_subscriptions s
            WHERE m.event_type = s.event_type
              AND m.subscription_name = s.subscription_name
              AND m.event_type = $1
              AND m.subscription_name = $2
              AND NOT m.dead_lettered
              AND (m.locked_until IS NULL OR m.locked_until < NOW())
              AND m.delivery_count >= s.max_delivery_count
            "#,
        )
        .bind(&self.spec.event_type)
        .bind(&self.spec.subscription_name)
        .execute(&self.pool)
        .await?;

        let moved = result.rows_affected();
        if moved > 0 {
            warn!(
                subscription = %self.spec.subscription_name,
                count = moved,
                "messages exceeded max delivery count and were dead-lettered"
            );
        }
        Ok(moved)
    }

    async fn claim(&self, max_messages: i64) -> Result<Vec<BrokerMessage>> {
        let rows: Vec<ClaimedRow> = sqlx::query_as(
            r#"
            WITH claimable AS (
                SELECT id
                FROM broker_messages
                WHERE event_type = $1
                  AND subscription_name = $2
                  AND dead_lettered = $3
                  AND (locked_until IS NULL OR locked_until < NOW())
                ORDER BY enqueued_at, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE broker_messages m
            SET lock_token = gen_random_uuid(),
                locked_until = NOW() + make_interval(secs => $5),
                delivery_count = m.delivery_count + 1
            FROM claimable
            WHERE m.id = claimable.id
            RETURNING m.message_id, m.body, m.lock_token, m.delivery_count, m.enqueued_at
            "#,
        )
        .bind(&self.spec.event_type)
        .bind(&self.spec.subscription_name)
        .bind(self.spec.dead_letter)
        .bind(max_messages)
        .bind(self.settings.lock_seconds())
        .fetch_all(&self.pool)
        .await?;

        let mut messages: Vec<BrokerMessage> = rows.into_iter().map(BrokerMessage::from).collect();
        messages.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(messages)
    }
}

#[async_trait::async_trait]
impl BrokerReceiver for PgReceiver {
    async fn receive_batch(
        &self,
        max_messages: usize,
        timeout: Duration,
    ) -> Result<Vec<BrokerMessage>> {
        self.ensure_open()?;
        let max_messages = i64::try_from(max_messages).unwrap_or(i64::MAX);
        let deadline = Instant::now() + timeout;

        loop {
            if !self.spec.dead_letter {
                self.dead_letter_exhausted().await?;
            }

            let messages = self.claim(max_messages).await?;
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now + self.settings.poll_interval > deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(self.settings.poll_interval).await;
            self.ensure_open()?;
        }
    }

    async fn complete(&self, lock_token: LockToken) -> Result<()> {
        self.ensure_open()?;

        let result = sqlx::query(
            r#"
            DELETE FROM broker_messages
            WHERE lock_token = $1
              AND event_type = $2
              AND subscription_name = $3
              AND locked_until > NOW()
            "#,
        )
        .bind(lock_token.0)
        .bind(&self.spec.event_type)
        .bind(&self.spec.subscription_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ReaderError::LockLost { lock_token });
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(subscription = %self.spec.subscription_name, "postgres receiver closed");
        }
        Ok(())
    }
}
