//! Best-effort notification side channel
//!
//! Notifications must never extend the provider-facing response latency or
//! fail a handler: the provider treats a slow response as a delivery
//! failure and redelivers. Sends are therefore dispatched into a detached
//! task that owns its own retry loop; the handler only observes that the
//! enqueue happened.

use async_trait::async_trait;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

use crate::accounts::Account;
use crate::config::NotifierConfig;
use crate::error::{BillingError, BillingResult};

/// Collaborator seam over the email dispatcher. Implementations are
/// fire-and-forget: failures are logged and swallowed, never propagated.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_welcome(&self, account: &Account);
    async fn send_credential_setup(&self, account: &Account, token: &str);
}

/// Notifier backed by an HTTP email-delivery API
pub struct EmailNotifier {
    client: reqwest::Client,
    config: NotifierConfig,
}

impl EmailNotifier {
    pub fn new(config: NotifierConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Spawn the actual delivery in a detached task with exponential
    /// backoff. The caller never waits on it.
    fn dispatch(&self, to: String, subject: String, body: String) {
        let client = self.client.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            let strategy = ExponentialBackoff::from_millis(200).map(jitter).take(3);

            let result = Retry::spawn(strategy, || {
                send_once(&client, &config, &to, &subject, &body)
            })
            .await;

            if let Err(e) = result {
                // Swallowed: a separate delivery-retry mechanism outside
                // this pipeline owns eventual delivery.
                tracing::error!(error = %e, to = %to, subject = %subject, "Email delivery failed");
            }
        });
    }
}

async fn send_once(
    client: &reqwest::Client,
    config: &NotifierConfig,
    to: &str,
    subject: &str,
    body: &str,
) -> BillingResult<()> {
    let response = client
        .post(format!("{}/emails", config.api_url))
        .bearer_auth(&config.api_key)
        .json(&serde_json::json!({
            "from": config.from_address,
            "to": to,
            "subject": subject,
            "text": body,
        }))
        .send()
        .await
        .map_err(|e| BillingError::NotificationFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(BillingError::NotificationFailed(format!(
            "email API returned {}",
            response.status()
        )));
    }

    Ok(())
}

#[async_trait]
impl Notifier for EmailNotifier {
    async fn send_welcome(&self, account: &Account) {
        let Some(email) = account.email.clone() else {
            tracing::info!(
                customer_id = %account.customer_id,
                "Skipping welcome email: account has no email address"
            );
            return;
        };

        let name = account.name.clone().unwrap_or_else(|| "there".to_string());
        self.dispatch(
            email,
            "Welcome aboard".to_string(),
            format!("Hi {name},\n\nYour subscription is set up and ready to go."),
        );
    }

    async fn send_credential_setup(&self, account: &Account, token: &str) {
        let Some(email) = account.email.clone() else {
            tracing::info!(
                customer_id = %account.customer_id,
                "Skipping credential setup email: account has no email address"
            );
            return;
        };

        self.dispatch(
            email,
            "Set up your account credentials".to_string(),
            format!(
                "Finish setting up your account by choosing a password:\n\n\
                 https://app.billhook.dev/setup?token={token}\n\n\
                 This link expires in 24 hours."
            ),
        );
    }
}

/// No-op notifier for deployments without an email collaborator configured
/// (minimal mode).
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send_welcome(&self, account: &Account) {
        tracing::debug!(customer_id = %account.customer_id, "NullNotifier: dropping welcome email");
    }

    async fn send_credential_setup(&self, account: &Account, _token: &str) {
        tracing::debug!(
            customer_id = %account.customer_id,
            "NullNotifier: dropping credential setup email"
        );
    }
}
