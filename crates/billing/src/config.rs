//! Webhook pipeline configuration
//!
//! Loaded once at process start from environment variables and immutable
//! thereafter.

use crate::error::{BillingError, BillingResult};

/// Default signature timestamp tolerance (seconds)
pub const DEFAULT_SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Configuration for the webhook pipeline
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared endpoint secret used to verify inbound signatures
    /// (provider format: `whsec_...`)
    pub endpoint_secret: String,
    /// Maximum age of the signed timestamp before a delivery is rejected
    /// as a replay
    pub signature_tolerance_secs: i64,
}

impl WebhookConfig {
    pub fn from_env() -> BillingResult<Self> {
        let endpoint_secret = std::env::var("WEBHOOK_ENDPOINT_SECRET")
            .map_err(|_| BillingError::Config("WEBHOOK_ENDPOINT_SECRET must be set".into()))?;

        let signature_tolerance_secs = std::env::var("WEBHOOK_SIGNATURE_TOLERANCE_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_SIGNATURE_TOLERANCE_SECS);

        Ok(Self {
            endpoint_secret,
            signature_tolerance_secs,
        })
    }
}

/// Configuration for the email notifier
#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Base URL of the email delivery API
    pub api_url: String,
    /// Bearer token for the delivery API
    pub api_key: String,
    /// Sender identity, e.g. `Billhook <billing@example.com>`
    pub from_address: String,
}

impl NotifierConfig {
    /// Returns `None` when the email collaborator is not configured; the
    /// caller falls back to the null notifier (minimal mode).
    pub fn from_env() -> Option<Self> {
        let api_url = std::env::var("EMAIL_API_URL").ok()?;
        let api_key = std::env::var("EMAIL_API_KEY").ok()?;
        let from_address =
            std::env::var("EMAIL_FROM").unwrap_or_else(|_| "billing@localhost".into());

        Some(Self {
            api_url,
            api_key,
            from_address,
        })
    }
}
