//! Idempotency guard
//!
//! The provider delivers at-least-once; this store turns that into
//! exactly-once side effects. A delivery first claims its event id with a
//! single atomic insert-or-detect; only the claimant dispatches a handler.
//! The claim is the one mutual-exclusion point in the whole pipeline, so
//! two concurrent deliveries of the same event id race only here.
//!
//! A handler failure still counts as processed: this system never asks the
//! provider to redeliver, preferring operator reconciliation over the risk
//! of duplicated side effects on a partially completed handler.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::BillingResult;

/// Result of attempting to claim an event id for processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This delivery holds exclusive processing rights
    Claimed,
    /// Another delivery already claimed (or finished) this event id
    AlreadyProcessed,
}

/// Terminal outcome recorded once the handler has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessedOutcome {
    Succeeded,
    /// Handler failed after the claim; still acknowledged to the provider
    /// and still deduplicated on redelivery.
    HandlerFailed,
}

impl ProcessedOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessedOutcome::Succeeded => "succeeded",
            ProcessedOutcome::HandlerFailed => "handler_failed",
        }
    }
}

/// One processed-event row, exposed for operator reconciliation
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEventRecord {
    pub event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub outcome: String,
    pub error_message: Option<String>,
    pub processed_at: OffsetDateTime,
}

/// Storage seam for the idempotency guard
#[async_trait]
pub trait ProcessedEventStore: Send + Sync {
    /// Atomically insert a pending record for `event_id`, returning
    /// `Claimed` only to the single caller that created it.
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome>;

    /// Move a claimed record from pending to its terminal outcome.
    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: ProcessedOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()>;

    /// Most recent records, newest first. Reconciliation surface for the
    /// no-redelivery policy: `handler_failed` rows are the ones an operator
    /// needs to look at.
    async fn recent(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>>;
}

/// Postgres-backed store. The unique constraint on `event_id` makes the
/// claim atomic: `ON CONFLICT DO NOTHING RETURNING` yields a row to exactly
/// one of any number of concurrent inserters.
pub struct PgProcessedEventStore {
    pool: PgPool,
}

impl PgProcessedEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedEventStore for PgProcessedEventStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, event_type, event_timestamp, outcome)
            VALUES ($1, $2, $3, 'pending')
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .bind(event_timestamp)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if claimed.is_some() {
            ClaimOutcome::Claimed
        } else {
            ClaimOutcome::AlreadyProcessed
        })
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: ProcessedOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_events
            SET outcome = $1, error_message = $2, processed_at = NOW()
            WHERE event_id = $3
            "#,
        )
        .bind(outcome.as_str())
        .bind(error_message)
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let rows: Vec<(String, String, OffsetDateTime, String, Option<String>, OffsetDateTime)> =
            sqlx::query_as(
                r#"
                SELECT event_id, event_type, event_timestamp, outcome, error_message, processed_at
                FROM webhook_events
                ORDER BY processed_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(
                |(event_id, event_type, event_timestamp, outcome, error_message, processed_at)| {
                    WebhookEventRecord {
                        event_id,
                        event_type,
                        event_timestamp,
                        outcome,
                        error_message,
                        processed_at,
                    }
                },
            )
            .collect())
    }
}

/// In-memory store for tests and single-instance deployments. The lock
/// spans check and insert, which closes the same race the Postgres unique
/// constraint closes.
#[derive(Default)]
pub struct InMemoryProcessedEventStore {
    entries: Arc<Mutex<HashMap<String, WebhookEventRecord>>>,
}

impl InMemoryProcessedEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessedEventStore for InMemoryProcessedEventStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<ClaimOutcome> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(event_id) {
            return Ok(ClaimOutcome::AlreadyProcessed);
        }
        entries.insert(
            event_id.to_string(),
            WebhookEventRecord {
                event_id: event_id.to_string(),
                event_type: event_type.to_string(),
                event_timestamp,
                outcome: "pending".to_string(),
                error_message: None,
                processed_at: OffsetDateTime::now_utc(),
            },
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: ProcessedOutcome,
        error_message: Option<&str>,
    ) -> BillingResult<()> {
        let mut entries = self.entries.lock().await;
        if let Some(record) = entries.get_mut(event_id) {
            record.outcome = outcome.as_str().to_string();
            record.error_message = error_message.map(|s| s.to_string());
            record.processed_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }

    async fn recent(&self, limit: i64) -> BillingResult<Vec<WebhookEventRecord>> {
        let entries = self.entries.lock().await;
        let mut records: Vec<WebhookEventRecord> = entries.values().cloned().collect();
        records.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        records.truncate(limit as usize);
        Ok(records)
    }
}
