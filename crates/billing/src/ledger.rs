//! Billing ledger
//!
//! Append-only audit trail: one entry per processed event, written before
//! the provider is acknowledged so a 200 always implies a durable audit
//! record. Entries are written even for unrouted types and for events whose
//! handler was skipped or failed; the ledger answers "what did we see",
//! not "what did we do". No update or delete path exists in this crate.
//!
//! Summaries are assembled field-by-field from the typed payloads, never
//! from the raw object, so payment-instrument and secret material cannot
//! end up in long-term storage.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::BillingResult;

/// One append-only ledger entry
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub event_id: String,
    /// Nullable: not every event resolves to a customer
    pub customer_id: Option<String>,
    pub event_type: String,
    /// Provider event timestamp
    pub occurred_at: OffsetDateTime,
    /// Non-sensitive fields only
    pub summary: Value,
}

impl LedgerEntry {
    pub fn new(
        event_id: impl Into<String>,
        customer_id: Option<String>,
        event_type: impl Into<String>,
        occurred_at: OffsetDateTime,
        summary: Value,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            customer_id,
            event_type: event_type.into(),
            occurred_at,
            summary,
        }
    }
}

/// Collaborator seam over the append-only ledger sink
#[async_trait]
pub trait LedgerWriter: Send + Sync {
    async fn append(&self, entry: LedgerEntry) -> BillingResult<()>;
}

/// Postgres-backed ledger
pub struct PgLedgerWriter {
    pool: PgPool,
}

impl PgLedgerWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LedgerWriter for PgLedgerWriter {
    async fn append(&self, entry: LedgerEntry) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_ledger (id, event_id, customer_id, event_type, occurred_at, summary)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&entry.event_id)
        .bind(&entry.customer_id)
        .bind(&entry.event_type)
        .bind(entry.occurred_at)
        .bind(&entry.summary)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// In-memory ledger for tests
#[derive(Default)]
pub struct InMemoryLedgerWriter {
    entries: Arc<Mutex<Vec<LedgerEntry>>>,
}

impl InMemoryLedgerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn entries(&self) -> Vec<LedgerEntry> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl LedgerWriter for InMemoryLedgerWriter {
    async fn append(&self, entry: LedgerEntry) -> BillingResult<()> {
        self.entries.lock().await.push(entry);
        Ok(())
    }
}
