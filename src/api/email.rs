//! Transactional email delivery.
//!
//! Flows never talk to a mail server. They append to `email_outbox` inside
//! the transaction that changes account state, and a background worker
//! drains the table with `FOR UPDATE SKIP LOCKED` so multiple instances can
//! poll the same queue. Delivery failure retries with exponential backoff
//! until `max_attempts`, then the row is parked as `failed`.

use anyhow::{Context, Result};
use rand::{thread_rng, Rng};
use sqlx::PgPool;
use std::{sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

const DEFAULT_POLL_INTERVAL_SECONDS: u64 = 5;
const DEFAULT_BATCH_SIZE: i64 = 10;
const DEFAULT_MAX_ATTEMPTS: i32 = 5;
const DEFAULT_RETRY_BASE_SECONDS: u64 = 5;
const DEFAULT_RETRY_MAX_SECONDS: u64 = 300;

const MAX_BATCH_SIZE: i64 = 100;

/// One queued email. `payload_json` carries the template variables as a
/// JSON document, rendering happens wherever the sender delivers to.
#[derive(Debug)]
pub struct EmailMessage {
    pub to_email: String,
    pub template: String,
    pub payload_json: String,
}

pub trait EmailSender {
    /// Deliver one message. An error requeues the row for a later attempt.
    fn send(&self, message: &EmailMessage) -> Result<()>;
}

/// Default sender: writes the message to the log and claims success. Used
/// until a real transport is configured.
#[derive(Debug, Clone, Copy)]
pub struct LogEmailSender;

impl EmailSender for LogEmailSender {
    fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(
            to = %message.to_email,
            template = %message.template,
            payload = %message.payload_json,
            "email delivery (log only)"
        );

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct EmailWorkerConfig {
    poll_interval_seconds: u64,
    batch_size: i64,
    max_attempts: i32,
    retry_base_seconds: u64,
    retry_max_seconds: u64,
}

impl Default for EmailWorkerConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EmailWorkerConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECONDS,
            batch_size: DEFAULT_BATCH_SIZE,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_base_seconds: DEFAULT_RETRY_BASE_SECONDS,
            retry_max_seconds: DEFAULT_RETRY_MAX_SECONDS,
        }
    }

    #[must_use]
    pub fn with_poll_interval_seconds(mut self, seconds: u64) -> Self {
        if seconds > 0 {
            self.poll_interval_seconds = seconds;
        }

        self
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        if batch_size > 0 {
            self.batch_size = batch_size.min(MAX_BATCH_SIZE);
        }

        self
    }

    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: i32) -> Self {
        if max_attempts > 0 {
            self.max_attempts = max_attempts;
        }

        self
    }

    #[must_use]
    pub fn with_retry_base_seconds(mut self, seconds: u64) -> Self {
        if seconds > 0 {
            self.retry_base_seconds = seconds;
        }

        self
    }

    #[must_use]
    pub fn with_retry_max_seconds(mut self, seconds: u64) -> Self {
        if seconds >= self.retry_base_seconds {
            self.retry_max_seconds = seconds;
        }

        self
    }
}

#[derive(Debug, sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    to_email: String,
    template: String,
    payload_json: String,
    attempts: i32,
}

/// Start the polling loop. The handle is aborted on server shutdown, rows
/// in flight are safe because every batch runs in one transaction.
pub fn spawn_outbox_worker(
    pool: PgPool,
    sender: Arc<dyn EmailSender + Send + Sync>,
    config: EmailWorkerConfig,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(config.poll_interval_seconds));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            poll_interval_seconds = config.poll_interval_seconds,
            batch_size = config.batch_size,
            "email outbox worker started"
        );

        loop {
            ticker.tick().await;

            match process_outbox_batch(&pool, sender.as_ref(), &config).await {
                Ok(0) => {}
                Ok(count) => debug!(count, "outbox batch processed"),
                Err(err) => error!("outbox batch failed: {err:#}"),
            }
        }
    })
}

/// Claim up to `batch_size` due rows and attempt delivery for each. Rows
/// stay locked until commit, so a concurrent worker skips them.
pub(crate) async fn process_outbox_batch(
    pool: &PgPool,
    sender: &(dyn EmailSender + Send + Sync),
    config: &EmailWorkerConfig,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("failed to begin transaction")?;

    let query = "SELECT id, to_email::text AS to_email, template, payload_json::text AS payload_json, attempts FROM email_outbox WHERE status = 'pending' AND next_attempt_at <= NOW() ORDER BY next_attempt_at, created_at LIMIT $1 FOR UPDATE SKIP LOCKED";
    let span = info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = "SELECT",
        db.statement = query
    );

    let rows = sqlx::query_as::<_, OutboxRow>(query)
        .bind(config.batch_size)
        .fetch_all(&mut *tx)
        .instrument(span)
        .await
        .context("failed to claim outbox rows")?;

    let claimed = rows.len() as u64;

    for row in rows {
        let message = EmailMessage {
            to_email: row.to_email,
            template: row.template,
            payload_json: row.payload_json,
        };
        let attempt = row.attempts + 1;

        match sender.send(&message) {
            Ok(()) => {
                let query = "UPDATE email_outbox SET status = 'sent', attempts = $2, sent_at = NOW(), last_error = NULL WHERE id = $1";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );

                sqlx::query(query)
                    .bind(row.id)
                    .bind(attempt)
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to mark outbox row sent")?;
            }
            Err(err) if attempt >= config.max_attempts => {
                warn!(id = %row.id, attempt, "email delivery gave up: {err:#}");

                let query = "UPDATE email_outbox SET status = 'failed', attempts = $2, last_error = $3 WHERE id = $1";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );

                sqlx::query(query)
                    .bind(row.id)
                    .bind(attempt)
                    .bind(format!("{err:#}"))
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to mark outbox row failed")?;
            }
            Err(err) => {
                let delay = backoff_delay(config, attempt);

                warn!(
                    id = %row.id,
                    attempt,
                    delay_seconds = delay.as_secs(),
                    "email delivery failed, will retry: {err:#}"
                );

                let query = "UPDATE email_outbox SET attempts = $2, last_error = $3, next_attempt_at = NOW() + ($4::bigint * INTERVAL '1 second') WHERE id = $1";
                let span = info_span!(
                    "db.query",
                    db.system = "postgresql",
                    db.operation = "UPDATE",
                    db.statement = query
                );

                sqlx::query(query)
                    .bind(row.id)
                    .bind(attempt)
                    .bind(format!("{err:#}"))
                    .bind(i64::try_from(delay.as_secs()).unwrap_or(i64::MAX))
                    .execute(&mut *tx)
                    .instrument(span)
                    .await
                    .context("failed to reschedule outbox row")?;
            }
        }
    }

    tx.commit().await.context("failed to commit outbox batch")?;

    Ok(claimed)
}

/// Exponential backoff with equal jitter: the delay for attempt `n` falls
/// in `[cap/2, cap]` where `cap = min(base * 2^(n-1), retry_max)`.
fn backoff_delay(config: &EmailWorkerConfig, attempt: i32) -> Duration {
    let shift = u32::try_from(attempt.saturating_sub(1)).unwrap_or(0).min(16);
    let capped = config
        .retry_base_seconds
        .checked_mul(1_u64 << shift)
        .unwrap_or(config.retry_max_seconds)
        .min(config.retry_max_seconds)
        .max(1);
    let half = capped / 2;
    let jitter = if half == 0 {
        0
    } else {
        thread_rng().gen_range(0..=half)
    };

    Duration::from_secs(half + jitter)
}
