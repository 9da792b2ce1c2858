//! Inbound event model
//!
//! The provider delivers a JSON envelope: an opaque globally-unique event
//! id, a dotted type string, a unix creation timestamp, and a
//! type-dependent `data.object` payload. The envelope is never mutated;
//! payloads are deserialized into one typed struct per category, with
//! `#[serde(default)]` tolerance so provider schema drift never breaks
//! parsing of the fields this pipeline reads.

use serde::Deserialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// The verified, immutable event envelope as delivered by the provider
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    /// Provider-assigned event id (`evt_...`), unique per provider
    pub id: String,
    /// Dotted event type, e.g. `customer.subscription.updated`
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix timestamp at which the provider created the event
    pub created: i64,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

impl EventEnvelope {
    pub fn parse(payload: &str) -> BillingResult<Self> {
        serde_json::from_str(payload).map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }

    /// Provider timestamp as an `OffsetDateTime`; falls back to now for an
    /// unrepresentable value rather than failing the delivery.
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    /// Deserialize `data.object` into a typed payload for one category.
    pub fn object<T: for<'de> Deserialize<'de>>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone())
            .map_err(|e| BillingError::MalformedPayload(e.to_string()))
    }
}

/// A reference the provider may deliver either as a bare id string or as
/// an expanded inline object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable<T> {
    Id(String),
    Object(T),
}

/// `checkout.session.completed` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CheckoutSessionObject {
    pub id: String,
    pub customer: Option<String>,
    pub customer_email: Option<String>,
    pub customer_details: Option<CustomerDetails>,
    pub subscription: Option<Expandable<SubscriptionObject>>,
    pub mode: Option<String>,
    pub amount_total: Option<i64>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomerDetails {
    pub email: Option<String>,
    pub name: Option<String>,
}

impl CheckoutSessionObject {
    /// Best email on the session: top-level field first, then the nested
    /// customer details block newer API versions populate.
    pub fn email(&self) -> Option<&str> {
        self.customer_email
            .as_deref()
            .or_else(|| self.customer_details.as_ref().and_then(|d| d.email.as_deref()))
    }
}

/// `customer.subscription.*` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubscriptionObject {
    pub id: String,
    pub customer: Option<String>,
    pub status: Option<String>,
    pub current_period_end: Option<i64>,
    pub trial_end: Option<i64>,
    pub cancel_at_period_end: bool,
}

/// `invoice.*` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InvoiceObject {
    pub id: String,
    pub customer: Option<String>,
    pub subscription: Option<String>,
    pub status: Option<String>,
    pub amount_due: Option<i64>,
    pub amount_paid: Option<i64>,
    pub currency: Option<String>,
    pub period_end: Option<i64>,
    pub attempt_count: Option<i64>,
}

/// `charge.*` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChargeObject {
    pub id: String,
    pub customer: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
    pub refunded: bool,
}

/// `payment_intent.*` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaymentIntentObject {
    pub id: String,
    pub customer: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub status: Option<String>,
}

/// `charge.dispute.created` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DisputeObject {
    pub id: String,
    pub charge: Option<String>,
    pub amount: Option<i64>,
    pub currency: Option<String>,
    pub reason: Option<String>,
}

/// `customer.*` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustomerObject {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// `customer.source.*` payload. Only the owning customer is read; card
/// fields are deliberately not modeled so they can never leak into the
/// ledger summary.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaymentSourceObject {
    pub id: String,
    pub customer: Option<String>,
}

/// `setup_intent.*` payload
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SetupIntentObject {
    pub id: String,
    pub customer: Option<String>,
    pub status: Option<String>,
    pub payment_method: Option<String>,
}
