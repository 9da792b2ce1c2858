// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Billhook billing pipeline
//!
//! Consumes at-least-once webhook deliveries from the payment provider and
//! turns them into exactly-once account mutations, an append-only billing
//! ledger, and best-effort notifications.
//!
//! ## Pipeline
//!
//! - **Signature verification**: HMAC over timestamp + body, constant-time
//!   compare, replay tolerance window
//! - **Idempotency**: atomic claim per provider event id; redelivery never
//!   re-applies side effects
//! - **Routing**: static type → handler registration; unknown types are
//!   acknowledged, never rejected
//! - **Handlers**: checkout, subscription lifecycle, payment, invoice,
//!   customer profile, payment-method setup
//! - **Ledger**: one audit entry per processed event, written before
//!   acknowledgment
//! - **Notifier**: fire-and-forget email side channel with its own retry
//!
//! Post-verification failures are never surfaced to the provider: the
//! response contract is 200 for everything the signature gate admits, so
//! the provider is never asked to redeliver a partially applied event.

pub mod accounts;
pub mod config;
pub mod error;
pub mod event;
pub mod idempotency;
pub mod ledger;
pub mod notifier;
pub mod processor;
pub mod router;
pub mod signature;

#[cfg(test)]
mod edge_case_tests;

// Accounts
pub use accounts::{
    apply_patch, Account, AccountPatch, AccountStore, InMemoryAccountStore, NewAccount,
    PgAccountStore, SubscriptionStatus, UpdateOutcome,
};

// Config
pub use config::{NotifierConfig, WebhookConfig, DEFAULT_SIGNATURE_TOLERANCE_SECS};

// Error
pub use error::{BillingError, BillingResult};

// Event model
pub use event::{EventEnvelope, Expandable};

// Idempotency
pub use idempotency::{
    ClaimOutcome, InMemoryProcessedEventStore, PgProcessedEventStore, ProcessedEventStore,
    ProcessedOutcome, WebhookEventRecord,
};

// Ledger
pub use ledger::{InMemoryLedgerWriter, LedgerEntry, LedgerWriter, PgLedgerWriter};

// Notifier
pub use notifier::{EmailNotifier, Notifier, NullNotifier};

// Processor
pub use processor::{Acknowledgment, WebhookProcessor};

// Router
pub use router::{EventKind, EventRouter, HandlerCategory};

// Signature
pub use signature::SignatureVerifier;
