//! Error taxonomy for the webhook pipeline
//!
//! Only the rejection-class errors (`SignatureInvalid`, `StaleEvent`,
//! `MalformedPayload`) are ever surfaced to the provider-facing response.
//! Everything else is absorbed inside the pipeline and recorded on the
//! processed-event record for operator-driven reconciliation.

use thiserror::Error;

/// Errors produced by the billing webhook pipeline
#[derive(Debug, Error)]
pub enum BillingError {
    /// Signature header missing, malformed, or not matching the payload.
    /// Maps to 4xx; no side effects, no ledger entry.
    #[error("Webhook signature verification failed")]
    SignatureInvalid,

    /// Embedded timestamp outside the configured tolerance window.
    /// Maps to 4xx; mitigates replay of captured deliveries.
    #[error("Webhook timestamp outside tolerance: {age_seconds}s old")]
    StaleEvent { age_seconds: i64 },

    /// Payload passed signature verification but is not a parseable
    /// event envelope. Rejected like an authentication failure: without an
    /// event id there is nothing to claim or acknowledge.
    #[error("Malformed event payload: {0}")]
    MalformedPayload(String),

    /// Account store or ledger unreachable / rejected a write. Absorbed:
    /// the processed record is marked handler-failed and the provider is
    /// still acknowledged.
    #[error("Database error: {0}")]
    Database(String),

    /// Downstream notification transport failure. Always swallowed at the
    /// notifier boundary; present in the taxonomy so transports can report
    /// it internally.
    #[error("Notification dispatch failed: {0}")]
    NotificationFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// True for the authentication-class errors that are allowed to reach
    /// the provider-facing response as a 4xx.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            BillingError::SignatureInvalid
                | BillingError::StaleEvent { .. }
                | BillingError::MalformedPayload(_)
        )
    }
}

pub type BillingResult<T> = Result<T, BillingError>;
