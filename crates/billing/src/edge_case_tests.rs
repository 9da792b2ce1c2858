// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Webhook Pipeline
//!
//! Exercises the full pipeline (verify → claim → route → handle → ledger)
//! against the in-memory stores:
//! - Idempotency under sequential and concurrent redelivery
//! - Signature rejection produces zero side effects
//! - Unknown event types are acknowledged and ledgered
//! - Out-of-order delivery protection on subscription fields
//! - Handler scenarios per event category
//! - Partial-failure isolation (ledger outage, missing accounts)

use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::accounts::{AccountStore, InMemoryAccountStore, NewAccount, SubscriptionStatus};
use crate::config::WebhookConfig;
use crate::error::{BillingError, BillingResult};
use crate::idempotency::{InMemoryProcessedEventStore, ProcessedEventStore};
use crate::ledger::{InMemoryLedgerWriter, LedgerEntry, LedgerWriter};
use crate::notifier::Notifier;
use crate::processor::{Acknowledgment, WebhookProcessor};

const SECRET: &str = "whsec_test_secret";

/// Notifier that records send attempts instead of dispatching
#[derive(Default)]
struct RecordingNotifier {
    welcomes: Mutex<Vec<String>>,
    credential_setups: Mutex<Vec<String>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send_welcome(&self, account: &crate::accounts::Account) {
        self.welcomes.lock().await.push(account.customer_id.clone());
    }

    async fn send_credential_setup(&self, account: &crate::accounts::Account, _token: &str) {
        self.credential_setups
            .lock()
            .await
            .push(account.customer_id.clone());
    }
}

/// Ledger that always fails, for downstream-outage tests
struct FailingLedger;

#[async_trait]
impl LedgerWriter for FailingLedger {
    async fn append(&self, _entry: LedgerEntry) -> BillingResult<()> {
        Err(BillingError::Database("ledger unreachable".to_string()))
    }
}

struct Pipeline {
    processor: Arc<WebhookProcessor>,
    events: Arc<InMemoryProcessedEventStore>,
    accounts: Arc<InMemoryAccountStore>,
    ledger: Arc<InMemoryLedgerWriter>,
    notifier: Arc<RecordingNotifier>,
}

fn pipeline() -> Pipeline {
    let events = Arc::new(InMemoryProcessedEventStore::new());
    let accounts = Arc::new(InMemoryAccountStore::new());
    let ledger = Arc::new(InMemoryLedgerWriter::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let processor = Arc::new(WebhookProcessor::new(
        &WebhookConfig {
            endpoint_secret: SECRET.to_string(),
            signature_tolerance_secs: 300,
        },
        Arc::clone(&events) as Arc<dyn ProcessedEventStore>,
        Arc::clone(&accounts) as Arc<dyn AccountStore>,
        Arc::clone(&ledger) as Arc<dyn LedgerWriter>,
        Arc::clone(&notifier) as Arc<dyn Notifier>,
    ));

    Pipeline {
        processor,
        events,
        accounts,
        ledger,
        notifier,
    }
}

fn sign(payload: &str) -> String {
    let timestamp = OffsetDateTime::now_utc().unix_timestamp();
    let mut mac = Hmac::<Sha256>::new_from_slice(b"test_secret").unwrap();
    mac.update(format!("{}.{}", timestamp, payload).as_bytes());
    format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
}

fn event_body(id: &str, event_type: &str, created: i64, object: serde_json::Value) -> String {
    json!({
        "id": id,
        "type": event_type,
        "created": created,
        "data": { "object": object }
    })
    .to_string()
}

async fn deliver(p: &Pipeline, body: &str) -> Acknowledgment {
    p.processor.process(body, &sign(body)).await.unwrap()
}

mod idempotency_tests {
    use super::*;

    #[tokio::test]
    async fn sequential_redelivery_applies_side_effects_once() {
        let p = pipeline();
        let body = event_body(
            "evt_1",
            "checkout.session.completed",
            1_700_000_000,
            json!({ "id": "cs_1", "customer": "cus_1", "customer_email": "a@example.com",
                    "mode": "subscription" }),
        );

        let first = deliver(&p, &body).await;
        let second = deliver(&p, &body).await;

        assert!(matches!(first, Acknowledgment::Processed { .. }));
        assert_eq!(
            second,
            Acknowledgment::Duplicate {
                event_id: "evt_1".to_string()
            }
        );

        assert_eq!(p.ledger.entries().await.len(), 1);
        assert_eq!(p.notifier.welcomes.lock().await.len(), 1);
        assert_eq!(p.notifier.credential_setups.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_redelivery_of_subscription_deleted_transitions_once() {
        use tokio::sync::Barrier;

        let p = pipeline();
        p.accounts
            .create_account(
                "cus_9",
                NewAccount {
                    subscription_status: SubscriptionStatus::Active,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let body = event_body(
            "evt_999",
            "customer.subscription.deleted",
            1_700_000_000,
            json!({ "id": "sub_9", "customer": "cus_9", "status": "canceled" }),
        );

        let barrier = Arc::new(Barrier::new(4));
        let mut handles = vec![];
        for _ in 0..4 {
            let processor = Arc::clone(&p.processor);
            let barrier = Arc::clone(&barrier);
            let body = body.clone();
            let header = sign(&body);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                processor.process(&body, &header).await.unwrap()
            }));
        }

        let mut processed = 0;
        let mut duplicates = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Acknowledgment::Processed { .. } => processed += 1,
                Acknowledgment::Duplicate { .. } => duplicates += 1,
                other => panic!("unexpected acknowledgment: {other:?}"),
            }
        }

        assert_eq!(processed, 1, "exactly one delivery runs the handler");
        assert_eq!(duplicates, 3);
        assert_eq!(p.ledger.entries().await.len(), 1);

        let account = p.accounts.find_by_customer("cus_9").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Canceled);
    }

    #[tokio::test]
    async fn failed_handler_is_not_rerun_on_redelivery() {
        let events = Arc::new(InMemoryProcessedEventStore::new());
        let accounts = Arc::new(InMemoryAccountStore::new());
        let notifier = Arc::new(RecordingNotifier::default());
        let processor = WebhookProcessor::new(
            &WebhookConfig {
                endpoint_secret: SECRET.to_string(),
                signature_tolerance_secs: 300,
            },
            Arc::clone(&events) as Arc<dyn ProcessedEventStore>,
            Arc::clone(&accounts) as Arc<dyn AccountStore>,
            Arc::new(FailingLedger) as Arc<dyn LedgerWriter>,
            notifier as Arc<dyn Notifier>,
        );

        let body = event_body(
            "evt_fail",
            "invoice.created",
            1_700_000_000,
            json!({ "id": "in_1", "customer": "cus_1" }),
        );

        let first = processor.process(&body, &sign(&body)).await.unwrap();
        assert_eq!(
            first,
            Acknowledgment::HandlerFailed {
                event_id: "evt_fail".to_string()
            }
        );

        let records = events.recent(10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].outcome, "handler_failed");

        // Redelivery short-circuits; the failed handler does not run again.
        let second = processor.process(&body, &sign(&body)).await.unwrap();
        assert!(matches!(second, Acknowledgment::Duplicate { .. }));
    }
}

mod signature_tests {
    use super::*;

    #[tokio::test]
    async fn invalid_signature_produces_zero_side_effects() {
        let p = pipeline();
        let body = event_body(
            "evt_1",
            "checkout.session.completed",
            1_700_000_000,
            json!({ "id": "cs_1", "customer": "cus_1" }),
        );

        let err = p
            .processor
            .process(&body, "t=1000,v1=deadbeef")
            .await
            .unwrap_err();
        assert!(err.is_rejection());

        assert!(p.ledger.entries().await.is_empty());
        assert!(p.events.recent(10).await.unwrap().is_empty());
        assert!(p.accounts.find_by_customer("cus_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let p = pipeline();
        let body = event_body("evt_1", "invoice.paid", 1_700_000_000, json!({ "id": "in_1" }));

        // Sign with a timestamp far outside the tolerance window
        let old_ts = OffsetDateTime::now_utc().unix_timestamp() - 3600;
        let mut mac = Hmac::<Sha256>::new_from_slice(b"test_secret").unwrap();
        mac.update(format!("{}.{}", old_ts, body).as_bytes());
        let header = format!("t={},v1={}", old_ts, hex::encode(mac.finalize().into_bytes()));

        let err = p.processor.process(&body, &header).await.unwrap_err();
        assert!(matches!(err, BillingError::StaleEvent { .. }));
        assert!(p.ledger.entries().await.is_empty());
    }
}

mod routing_tests {
    use super::*;

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged_and_ledgered() {
        let p = pipeline();
        let body = event_body(
            "evt_new",
            "treasury.outbound_transfer.created",
            1_700_000_000,
            json!({ "id": "obt_1" }),
        );

        let ack = deliver(&p, &body).await;
        assert_eq!(
            ack,
            Acknowledgment::Unrouted {
                event_id: "evt_new".to_string(),
                event_type: "treasury.outbound_transfer.created".to_string(),
            }
        );

        let entries = p.ledger.entries().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, "treasury.outbound_transfer.created");
        assert_eq!(entries[0].customer_id, None);

        let records = p.events.recent(10).await.unwrap();
        assert_eq!(records[0].outcome, "succeeded");
    }
}

mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn stale_subscription_update_leaves_account_unchanged_but_is_ledgered() {
        let p = pipeline();
        p.accounts
            .create_account("cus_1", NewAccount::default())
            .await
            .unwrap();

        let newer = event_body(
            "evt_newer",
            "customer.subscription.updated",
            1_700_002_000,
            json!({ "id": "sub_1", "customer": "cus_1", "status": "active",
                    "current_period_end": 1_740_787_200i64 }),
        );
        let older = event_body(
            "evt_older",
            "customer.subscription.updated",
            1_700_001_000,
            json!({ "id": "sub_1", "customer": "cus_1", "status": "trialing",
                    "current_period_end": 1_730_000_000i64 }),
        );

        deliver(&p, &newer).await;
        let ack = deliver(&p, &older).await;

        // Stale events are handler-local skips, still acknowledged
        assert!(matches!(ack, Acknowledgment::Processed { .. }));

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert_eq!(
            account.current_period_end,
            Some(OffsetDateTime::from_unix_timestamp(1_740_787_200).unwrap())
        );

        assert_eq!(p.ledger.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn stale_subscription_event_cannot_overwrite_checkout_status() {
        let p = pipeline();

        // Checkout completes with an active subscription...
        let checkout = event_body(
            "evt_checkout",
            "checkout.session.completed",
            1_700_002_000,
            json!({
                "id": "cs_1",
                "customer": "cus_1",
                "customer_email": "a@example.com",
                "mode": "subscription",
                "subscription": { "id": "sub_1", "status": "active" }
            }),
        );
        deliver(&p, &checkout).await;

        // ...then the subscription.created the provider emitted earlier
        // arrives late. Its status must not win over the checkout's.
        let late = event_body(
            "evt_late",
            "customer.subscription.updated",
            1_700_001_000,
            json!({ "id": "sub_1", "customer": "cus_1", "status": "trialing" }),
        );
        let ack = deliver(&p, &late).await;
        assert!(matches!(ack, Acknowledgment::Processed { .. }));

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert_eq!(p.ledger.entries().await.len(), 2);
    }
}

mod handler_tests {
    use super::*;

    #[tokio::test]
    async fn checkout_creates_trialing_account_and_sends_welcome() {
        let p = pipeline();
        let body = event_body(
            "evt_1",
            "checkout.session.completed",
            1_700_000_000,
            json!({
                "id": "cs_1",
                "customer": "cus_123",
                "customer_email": "new@example.com",
                "mode": "subscription",
                "subscription": { "id": "sub_1", "status": "trialing" },
                "amount_total": 0,
                "currency": "usd"
            }),
        );

        let ack = deliver(&p, &body).await;
        assert!(matches!(ack, Acknowledgment::Processed { .. }));

        let account = p.accounts.find_by_customer("cus_123").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Trialing);
        assert_eq!(account.email.as_deref(), Some("new@example.com"));
        assert!(account.pending_email_verification);

        assert_eq!(p.ledger.entries().await.len(), 1);
        assert_eq!(p.notifier.welcomes.lock().await.as_slice(), ["cus_123"]);
        assert_eq!(p.notifier.credential_setups.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn invoice_payment_succeeded_extends_period_end() {
        let p = pipeline();
        p.accounts
            .create_account(
                "cus_123",
                NewAccount {
                    subscription_status: SubscriptionStatus::Active,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // 2025-03-01T00:00:00Z
        let period_end = 1_740_787_200i64;
        let body = event_body(
            "evt_1",
            "invoice.payment_succeeded",
            1_700_000_000,
            json!({ "id": "in_1", "customer": "cus_123", "status": "paid",
                    "amount_paid": 4200, "period_end": period_end }),
        );

        deliver(&p, &body).await;

        let account = p.accounts.find_by_customer("cus_123").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert_eq!(
            account.current_period_end,
            Some(OffsetDateTime::from_unix_timestamp(period_end).unwrap())
        );
    }

    #[tokio::test]
    async fn invoice_payment_failed_changes_nothing_and_sends_nothing() {
        let p = pipeline();
        p.accounts
            .create_account(
                "cus_123",
                NewAccount {
                    subscription_status: SubscriptionStatus::Active,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let body = event_body(
            "evt_1",
            "invoice.payment_failed",
            1_700_000_000,
            json!({ "id": "in_1", "customer": "cus_123", "amount_due": 4200,
                    "attempt_count": 1 }),
        );

        let ack = deliver(&p, &body).await;
        assert!(matches!(ack, Acknowledgment::Processed { .. }));

        let account = p.accounts.find_by_customer("cus_123").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert!(account.current_period_end.is_none());

        assert_eq!(p.ledger.entries().await.len(), 1);
        assert!(p.notifier.welcomes.lock().await.is_empty());
    }

    #[tokio::test]
    async fn invoice_payment_recovers_past_due_account() {
        let p = pipeline();
        p.accounts
            .create_account(
                "cus_1",
                NewAccount {
                    subscription_status: SubscriptionStatus::PastDue,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let body = event_body(
            "evt_1",
            "invoice.paid",
            1_700_000_000,
            json!({ "id": "in_1", "customer": "cus_1", "period_end": 1_740_787_200i64 }),
        );
        deliver(&p, &body).await;

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn charge_failure_marks_active_account_past_due_but_never_cancels() {
        let p = pipeline();
        p.accounts
            .create_account(
                "cus_1",
                NewAccount {
                    subscription_status: SubscriptionStatus::Active,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let first = event_body(
            "evt_1",
            "charge.failed",
            1_700_000_000,
            json!({ "id": "ch_1", "customer": "cus_1", "amount": 4200, "status": "failed" }),
        );
        deliver(&p, &first).await;

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::PastDue);

        // A second failure is a ledger-only event; past_due never escalates
        // to canceled from this side.
        let second = event_body(
            "evt_2",
            "charge.failed",
            1_700_000_100,
            json!({ "id": "ch_2", "customer": "cus_1", "amount": 4200, "status": "failed" }),
        );
        deliver(&p, &second).await;

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(p.ledger.entries().await.len(), 2);
    }

    #[tokio::test]
    async fn payment_event_for_unknown_customer_is_skipped_not_failed() {
        let p = pipeline();
        let body = event_body(
            "evt_1",
            "charge.failed",
            1_700_000_000,
            json!({ "id": "ch_1", "customer": "cus_ghost", "status": "failed" }),
        );

        let ack = deliver(&p, &body).await;
        assert!(matches!(ack, Acknowledgment::Processed { .. }));

        assert_eq!(p.ledger.entries().await.len(), 1);
        let records = p.events.recent(10).await.unwrap();
        assert_eq!(records[0].outcome, "succeeded");
    }

    #[tokio::test]
    async fn customer_update_syncs_profile_without_touching_subscription() {
        let p = pipeline();
        p.accounts
            .create_account(
                "cus_1",
                NewAccount {
                    email: Some("old@example.com".into()),
                    subscription_status: SubscriptionStatus::Active,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let body = event_body(
            "evt_1",
            "customer.updated",
            1_700_000_000,
            json!({ "id": "cus_1", "email": "new@example.com", "name": "Ada" }),
        );
        deliver(&p, &body).await;

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.email.as_deref(), Some("new@example.com"));
        assert_eq!(account.name.as_deref(), Some("Ada"));
        assert_eq!(account.subscription_status, SubscriptionStatus::Active);
        assert!(account.status_observed_at.is_none());
    }

    #[tokio::test]
    async fn setup_intent_succeeded_sets_payment_method_flag() {
        let p = pipeline();
        p.accounts
            .create_account("cus_1", NewAccount::default())
            .await
            .unwrap();

        let body = event_body(
            "evt_1",
            "setup_intent.succeeded",
            1_700_000_000,
            json!({ "id": "seti_1", "customer": "cus_1", "status": "succeeded",
                    "payment_method": "pm_1" }),
        );
        deliver(&p, &body).await;

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert!(account.has_payment_method);
    }

    #[tokio::test]
    async fn trial_will_end_is_ledgered_without_mutation_or_email() {
        let p = pipeline();
        p.accounts
            .create_account(
                "cus_1",
                NewAccount {
                    subscription_status: SubscriptionStatus::Trialing,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let body = event_body(
            "evt_1",
            "customer.subscription.trial_will_end",
            1_700_000_000,
            json!({ "id": "sub_1", "customer": "cus_1", "status": "trialing",
                    "trial_end": 1_700_300_000i64 }),
        );
        deliver(&p, &body).await;

        let account = p.accounts.find_by_customer("cus_1").await.unwrap().unwrap();
        assert_eq!(account.subscription_status, SubscriptionStatus::Trialing);
        assert_eq!(p.ledger.entries().await.len(), 1);
        assert!(p.notifier.welcomes.lock().await.is_empty());
        assert!(p.notifier.credential_setups.lock().await.is_empty());
    }
}
