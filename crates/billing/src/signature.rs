//! Webhook signature verification
//!
//! The provider signs each delivery with HMAC-SHA256 over
//! `"{timestamp}.{raw_body}"` and sends the result in a header of the form
//! `t=<unix>,v1=<hex>[,v0=<hex>]`. This is the only boundary where forged
//! input is stopped; everything downstream trusts its input once this gate
//! passes. The comparison uses `Mac::verify_slice`, which is constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::OffsetDateTime;

use crate::config::WebhookConfig;
use crate::error::{BillingError, BillingResult};

type HmacSha256 = Hmac<Sha256>;

/// Verifies inbound delivery signatures against the shared endpoint secret
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret_key: String,
    tolerance_secs: i64,
}

impl SignatureVerifier {
    pub fn new(config: &WebhookConfig) -> Self {
        // The secret's "whsec_" prefix is an identifier, not key material.
        let secret_key = config
            .endpoint_secret
            .strip_prefix("whsec_")
            .unwrap_or(&config.endpoint_secret)
            .to_string();

        Self {
            secret_key,
            tolerance_secs: config.signature_tolerance_secs,
        }
    }

    /// Verify a raw payload against its signature header.
    ///
    /// Returns the signed timestamp on success. Fails with
    /// `SignatureInvalid` for a missing/malformed/mismatched signature and
    /// `StaleEvent` when the signed timestamp falls outside the tolerance
    /// window.
    pub fn verify(&self, payload: &str, signature_header: &str) -> BillingResult<i64> {
        self.verify_at(payload, signature_header, OffsetDateTime::now_utc().unix_timestamp())
    }

    /// Verification against an explicit clock, so tolerance behavior is
    /// testable without waiting.
    pub fn verify_at(&self, payload: &str, signature_header: &str, now: i64) -> BillingResult<i64> {
        let (timestamp, v1_signature) = parse_signature_header(signature_header)?;

        let age = now - timestamp;
        if age.abs() > self.tolerance_secs {
            tracing::warn!(
                timestamp = timestamp,
                age_seconds = age,
                tolerance = self.tolerance_secs,
                "Rejecting webhook with stale timestamp"
            );
            return Err(BillingError::StaleEvent { age_seconds: age });
        }

        let sig_bytes = hex::decode(&v1_signature).map_err(|_| {
            tracing::warn!("Signature header v1 value is not valid hex");
            BillingError::SignatureInvalid
        })?;

        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|_| BillingError::SignatureInvalid)?;
        mac.update(signed_payload.as_bytes());

        // verify_slice is a constant-time comparison
        mac.verify_slice(&sig_bytes).map_err(|_| {
            tracing::warn!("Webhook signature mismatch");
            BillingError::SignatureInvalid
        })?;

        Ok(timestamp)
    }
}

/// Parse `t=timestamp,v1=signature[,v0=signature]` into its parts.
fn parse_signature_header(header: &str) -> BillingResult<(i64, String)> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    match (timestamp, v1_signature) {
        (Some(t), Some(v1)) => Ok((t, v1)),
        _ => {
            tracing::warn!("Signature header missing t or v1 component");
            Err(BillingError::SignatureInvalid)
        }
    }
}
