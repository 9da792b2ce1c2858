//! Webhook processing pipeline
//!
//! Control flow for one delivery: verify signature → parse envelope →
//! claim event id → route → dispatch handler → append ledger entry →
//! record outcome → acknowledge. Only the authentication-class errors
//! escape as `Err`; every post-verification condition (duplicate, unknown
//! type, missing account, stale event, downstream write failure) is
//! absorbed into an [`Acknowledgment`] that the HTTP layer answers with
//! 200, because asking the provider to redeliver a partially applied event
//! risks duplicate side effects.

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::accounts::{Account, AccountPatch, AccountStore, NewAccount, SubscriptionStatus, UpdateOutcome};
use crate::config::WebhookConfig;
use crate::error::{BillingError, BillingResult};
use crate::event::{
    ChargeObject, CheckoutSessionObject, CustomerObject, DisputeObject, EventEnvelope,
    Expandable, InvoiceObject, PaymentIntentObject, PaymentSourceObject, SetupIntentObject,
    SubscriptionObject,
};
use crate::idempotency::{ClaimOutcome, ProcessedEventStore, ProcessedOutcome};
use crate::ledger::{LedgerEntry, LedgerWriter};
use crate::notifier::Notifier;
use crate::router::{EventRouter, EventKind, HandlerCategory};
use crate::signature::SignatureVerifier;

/// How a delivery was acknowledged. Every variant maps to 200 at the HTTP
/// layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acknowledgment {
    /// Claimed, routed, and handled (including handler-local skips like a
    /// missing account or a stale event)
    Processed { event_id: String },
    /// Event id already claimed by an earlier delivery; no handler ran
    Duplicate { event_id: String },
    /// No handler registered for the type; logged and ledgered as a no-op
    Unrouted { event_id: String, event_type: String },
    /// Handler or downstream write failed after the claim; recorded for
    /// reconciliation, still acknowledged
    HandlerFailed { event_id: String },
}

/// Handler-local result. Handlers never propagate failures; they report.
#[derive(Debug)]
enum HandlerOutcome {
    /// Account mutation applied
    Applied,
    /// Nothing to mutate for this event type; ledger entry only
    NoOp,
    /// No account for the referenced customer; logged and skipped
    AccountMissing,
    /// Every touched field group was older than its watermark
    OutOfOrder,
    /// Downstream failure; processed record will be marked handler-failed
    Failed(BillingError),
}

struct HandlerReport {
    outcome: HandlerOutcome,
    customer_id: Option<String>,
    summary: Value,
}

impl HandlerReport {
    fn new(outcome: HandlerOutcome, customer_id: Option<String>, summary: Value) -> Self {
        Self {
            outcome,
            customer_id,
            summary,
        }
    }

    fn failed(err: BillingError, customer_id: Option<String>) -> Self {
        Self::new(HandlerOutcome::Failed(err), customer_id, Value::Null)
    }
}

/// The webhook processing pipeline
pub struct WebhookProcessor {
    verifier: SignatureVerifier,
    router: EventRouter,
    events: Arc<dyn ProcessedEventStore>,
    accounts: Arc<dyn AccountStore>,
    ledger: Arc<dyn LedgerWriter>,
    notifier: Arc<dyn Notifier>,
}

impl WebhookProcessor {
    pub fn new(
        config: &WebhookConfig,
        events: Arc<dyn ProcessedEventStore>,
        accounts: Arc<dyn AccountStore>,
        ledger: Arc<dyn LedgerWriter>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            verifier: SignatureVerifier::new(config),
            router: EventRouter::new(),
            events,
            accounts,
            ledger,
            notifier,
        }
    }

    /// Process one inbound delivery: raw body plus signature header.
    ///
    /// `Err` only for the authentication-class rejections (4xx upstream);
    /// everything else is an `Ok` acknowledgment.
    pub async fn process(
        &self,
        payload: &str,
        signature_header: &str,
    ) -> BillingResult<Acknowledgment> {
        self.verifier.verify(payload, signature_header)?;

        let envelope = EventEnvelope::parse(payload)?;
        let event_id = envelope.id.clone();
        let event_type = envelope.event_type.clone();

        // The one mutual-exclusion point: exactly one delivery of this
        // event id gets past here.
        match self
            .events
            .claim(&event_id, &event_type, envelope.created_at())
            .await
        {
            Ok(ClaimOutcome::Claimed) => {}
            Ok(ClaimOutcome::AlreadyProcessed) => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "Duplicate delivery; acknowledging without re-invoking handler"
                );
                return Ok(Acknowledgment::Duplicate { event_id });
            }
            Err(e) => {
                // Without a claim there is no dedup record, but the
                // response contract reserves non-2xx for authentication
                // failures. Surface loudly and acknowledge.
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event_type,
                    error = %e,
                    "Failed to claim event for processing; acknowledging without a dedup record"
                );
                return Ok(Acknowledgment::HandlerFailed { event_id });
            }
        }

        let routed = self.router.route(&event_type);
        let report = match routed {
            Some(kind) => self.dispatch(kind, &envelope).await,
            None => {
                tracing::info!(
                    event_id = %event_id,
                    event_type = %event_type,
                    "No handler registered for event type; acknowledging as no-op"
                );
                HandlerReport::new(
                    HandlerOutcome::NoOp,
                    None,
                    json!({ "unrecognized_type": true }),
                )
            }
        };

        // One ledger entry per processed event, failed handlers included,
        // written before the acknowledgment goes out.
        let ledger_ok = self.append_ledger(&envelope, &report).await;

        let (processed_outcome, error_message, ack) = match (&report.outcome, ledger_ok) {
            (HandlerOutcome::Failed(e), _) => (
                ProcessedOutcome::HandlerFailed,
                Some(e.to_string()),
                Acknowledgment::HandlerFailed {
                    event_id: event_id.clone(),
                },
            ),
            (_, false) => (
                ProcessedOutcome::HandlerFailed,
                Some("ledger append failed".to_string()),
                Acknowledgment::HandlerFailed {
                    event_id: event_id.clone(),
                },
            ),
            (_, true) if routed.is_none() => (
                ProcessedOutcome::Succeeded,
                None,
                Acknowledgment::Unrouted {
                    event_id: event_id.clone(),
                    event_type: event_type.clone(),
                },
            ),
            (_, true) => (
                ProcessedOutcome::Succeeded,
                None,
                Acknowledgment::Processed {
                    event_id: event_id.clone(),
                },
            ),
        };

        self.finalize(&event_id, processed_outcome, error_message.as_deref())
            .await;

        tracing::info!(
            event_id = %event_id,
            event_type = %event_type,
            outcome = processed_outcome.as_str(),
            "Webhook event processed"
        );

        Ok(ack)
    }

    async fn dispatch(&self, kind: EventKind, envelope: &EventEnvelope) -> HandlerReport {
        match kind.category() {
            HandlerCategory::Checkout => self.handle_checkout(envelope).await,
            HandlerCategory::Subscription => self.handle_subscription(kind, envelope).await,
            HandlerCategory::Payment => self.handle_payment(kind, envelope).await,
            HandlerCategory::Invoice => self.handle_invoice(kind, envelope).await,
            HandlerCategory::Customer => self.handle_customer(kind, envelope).await,
            HandlerCategory::PaymentMethodSetup => self.handle_setup(kind, envelope).await,
        }
    }

    async fn append_ledger(&self, envelope: &EventEnvelope, report: &HandlerReport) -> bool {
        let entry = LedgerEntry::new(
            envelope.id.clone(),
            report.customer_id.clone(),
            envelope.event_type.clone(),
            envelope.created_at(),
            report.summary.clone(),
        );

        match self.ledger.append(entry).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Failed to append billing ledger entry"
                );
                false
            }
        }
    }

    /// Record the terminal outcome; retried once because the record is the
    /// idempotency and reconciliation source of truth.
    async fn finalize(
        &self,
        event_id: &str,
        outcome: ProcessedOutcome,
        error_message: Option<&str>,
    ) {
        if let Err(e) = self
            .events
            .record_outcome(event_id, outcome, error_message)
            .await
        {
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to record event outcome failed, retrying"
            );
            if let Err(retry_err) = self
                .events
                .record_outcome(event_id, outcome, error_message)
                .await
            {
                tracing::error!(
                    event_id = %event_id,
                    outcome = outcome.as_str(),
                    first_error = %e,
                    retry_error = %retry_err,
                    "Failed to record event outcome after retry; \
                     record may appear stuck in pending state"
                );
            }
        }
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    async fn handle_checkout(&self, envelope: &EventEnvelope) -> HandlerReport {
        let session: CheckoutSessionObject = match envelope.object() {
            Ok(s) => s,
            Err(e) => return HandlerReport::failed(e, None),
        };

        let Some(customer_id) = session.customer.clone() else {
            tracing::warn!(
                event_id = %envelope.id,
                session_id = %session.id,
                "Checkout session completed without a customer id; skipping"
            );
            return HandlerReport::new(
                HandlerOutcome::NoOp,
                None,
                json!({ "session_id": session.id, "skipped": "no_customer" }),
            );
        };

        // Initial status: a session carrying an expanded subscription tells
        // us whether it started trialing; a bare subscription id means the
        // paid path.
        let initial_status = match &session.subscription {
            Some(Expandable::Object(sub)) => {
                SubscriptionStatus::from_provider(sub.status.as_deref().unwrap_or("active"))
            }
            Some(Expandable::Id(_)) => SubscriptionStatus::Active,
            None if session.mode.as_deref() == Some("subscription") => SubscriptionStatus::Active,
            None => SubscriptionStatus::None,
        };

        let account = match self
            .accounts
            .create_account(
                &customer_id,
                NewAccount {
                    email: session.email().map(|s| s.to_string()),
                    name: session
                        .customer_details
                        .as_ref()
                        .and_then(|d| d.name.clone()),
                    subscription_status: initial_status,
                    pending_email_verification: true,
                    observed_at: Some(envelope.created_at()),
                },
            )
            .await
        {
            Ok(account) => account,
            Err(e) => return HandlerReport::failed(e, Some(customer_id)),
        };

        tracing::info!(
            customer_id = %customer_id,
            status = initial_status.as_str(),
            "Checkout completed; account ready"
        );

        // Best-effort side channel; a failure in here never fails the
        // handler.
        self.notifier.send_welcome(&account).await;
        let setup_token = Uuid::new_v4().to_string();
        self.notifier
            .send_credential_setup(&account, &setup_token)
            .await;

        HandlerReport::new(
            HandlerOutcome::Applied,
            Some(customer_id),
            json!({
                "session_id": session.id,
                "mode": session.mode,
                "amount_total": session.amount_total,
                "currency": session.currency,
                "initial_status": initial_status.as_str(),
            }),
        )
    }

    async fn handle_subscription(&self, kind: EventKind, envelope: &EventEnvelope) -> HandlerReport {
        let sub: SubscriptionObject = match envelope.object() {
            Ok(s) => s,
            Err(e) => return HandlerReport::failed(e, None),
        };

        let summary = json!({
            "subscription_id": sub.id,
            "status": sub.status,
            "current_period_end": sub.current_period_end,
            "trial_end": sub.trial_end,
            "cancel_at_period_end": sub.cancel_at_period_end,
        });

        let Some(customer_id) = sub.customer.clone() else {
            tracing::warn!(event_id = %envelope.id, subscription_id = %sub.id,
                "Subscription event without customer id; skipping");
            return HandlerReport::new(HandlerOutcome::NoOp, None, summary);
        };

        if kind == EventKind::TrialWillEnd {
            // The provider sends its own trial-ending email; this side only
            // keeps the audit trail.
            tracing::info!(
                customer_id = %customer_id,
                subscription_id = %sub.id,
                trial_end = ?sub.trial_end,
                "Trial period ending soon"
            );
            return HandlerReport::new(HandlerOutcome::NoOp, Some(customer_id), summary);
        }

        let new_status = if kind == EventKind::SubscriptionDeleted {
            SubscriptionStatus::Canceled
        } else {
            SubscriptionStatus::from_provider(sub.status.as_deref().unwrap_or(""))
        };

        self.warn_on_unexpected_transition(&customer_id, new_status).await;

        let patch = AccountPatch {
            subscription_status: Some(new_status),
            current_period_end: sub
                .current_period_end
                .and_then(|t| time::OffsetDateTime::from_unix_timestamp(t).ok()),
            ..Default::default()
        };

        self.apply_guarded(&customer_id, patch, envelope, summary).await
    }

    async fn handle_payment(&self, kind: EventKind, envelope: &EventEnvelope) -> HandlerReport {
        let (customer_id, summary) = match kind {
            EventKind::ChargeSucceeded | EventKind::ChargeFailed | EventKind::ChargeRefunded => {
                let charge: ChargeObject = match envelope.object() {
                    Ok(c) => c,
                    Err(e) => return HandlerReport::failed(e, None),
                };
                (
                    charge.customer.clone(),
                    json!({
                        "charge_id": charge.id,
                        "amount": charge.amount,
                        "currency": charge.currency,
                        "status": charge.status,
                        "refunded": charge.refunded,
                    }),
                )
            }
            EventKind::DisputeCreated => {
                let dispute: DisputeObject = match envelope.object() {
                    Ok(d) => d,
                    Err(e) => return HandlerReport::failed(e, None),
                };
                tracing::warn!(
                    event_id = %envelope.id,
                    dispute_id = %dispute.id,
                    reason = ?dispute.reason,
                    "Charge dispute created"
                );
                (
                    None,
                    json!({
                        "dispute_id": dispute.id,
                        "charge": dispute.charge,
                        "amount": dispute.amount,
                        "currency": dispute.currency,
                        "reason": dispute.reason,
                    }),
                )
            }
            _ => {
                let intent: PaymentIntentObject = match envelope.object() {
                    Ok(i) => i,
                    Err(e) => return HandlerReport::failed(e, None),
                };
                (
                    intent.customer.clone(),
                    json!({
                        "payment_intent_id": intent.id,
                        "amount": intent.amount,
                        "currency": intent.currency,
                        "status": intent.status,
                    }),
                )
            }
        };

        let is_failure =
            matches!(kind, EventKind::ChargeFailed | EventKind::PaymentIntentFailed);

        if !is_failure {
            return HandlerReport::new(HandlerOutcome::NoOp, customer_id, summary);
        }

        // A payment failure marks an active account past-due. Never
        // auto-cancel on first failure: the provider drives its own retry
        // schedule before cancellation.
        let Some(customer_id) = customer_id else {
            return HandlerReport::new(HandlerOutcome::NoOp, None, summary);
        };

        let account = match self.accounts.find_by_customer(&customer_id).await {
            Ok(Some(account)) => account,
            Ok(None) => {
                tracing::info!(
                    customer_id = %customer_id,
                    event_id = %envelope.id,
                    "Payment failure for unknown customer; skipping"
                );
                return HandlerReport::new(HandlerOutcome::AccountMissing, Some(customer_id), summary);
            }
            Err(e) => return HandlerReport::failed(e, Some(customer_id)),
        };

        if account.subscription_status != SubscriptionStatus::Active {
            return HandlerReport::new(HandlerOutcome::NoOp, Some(customer_id), summary);
        }

        let patch = AccountPatch {
            subscription_status: Some(SubscriptionStatus::PastDue),
            ..Default::default()
        };
        self.apply_guarded(&customer_id, patch, envelope, summary).await
    }

    async fn handle_invoice(&self, kind: EventKind, envelope: &EventEnvelope) -> HandlerReport {
        let invoice: InvoiceObject = match envelope.object() {
            Ok(i) => i,
            Err(e) => return HandlerReport::failed(e, None),
        };

        let summary = json!({
            "invoice_id": invoice.id,
            "status": invoice.status,
            "amount_due": invoice.amount_due,
            "amount_paid": invoice.amount_paid,
            "currency": invoice.currency,
            "period_end": invoice.period_end,
            "attempt_count": invoice.attempt_count,
        });

        let customer_id = invoice.customer.clone();

        match kind {
            EventKind::InvoicePaid | EventKind::InvoicePaymentSucceeded => {
                let Some(customer_id) = customer_id else {
                    tracing::warn!(event_id = %envelope.id, invoice_id = %invoice.id,
                        "Paid invoice without customer id; skipping");
                    return HandlerReport::new(HandlerOutcome::NoOp, None, summary);
                };

                // Successful payment extends the period and recovers a
                // past-due account; an already-active status is untouched.
                let recovery = match self.accounts.find_by_customer(&customer_id).await {
                    Ok(Some(account)) => {
                        account.subscription_status == SubscriptionStatus::PastDue
                    }
                    Ok(None) => {
                        tracing::info!(
                            customer_id = %customer_id,
                            event_id = %envelope.id,
                            "Invoice paid for unknown customer; skipping"
                        );
                        return HandlerReport::new(
                            HandlerOutcome::AccountMissing,
                            Some(customer_id),
                            summary,
                        );
                    }
                    Err(e) => return HandlerReport::failed(e, Some(customer_id)),
                };

                let patch = AccountPatch {
                    subscription_status: recovery.then_some(SubscriptionStatus::Active),
                    current_period_end: invoice
                        .period_end
                        .and_then(|t| time::OffsetDateTime::from_unix_timestamp(t).ok()),
                    ..Default::default()
                };

                if patch.is_empty() {
                    return HandlerReport::new(HandlerOutcome::NoOp, Some(customer_id), summary);
                }

                self.apply_guarded(&customer_id, patch, envelope, summary).await
            }
            EventKind::InvoicePaymentFailed => {
                // Log only: provider-driven payment retries precede any
                // cancellation, and the subscription events carry the
                // resulting status changes.
                tracing::warn!(
                    event_id = %envelope.id,
                    invoice_id = %invoice.id,
                    customer_id = ?customer_id,
                    amount_due = ?invoice.amount_due,
                    attempt_count = ?invoice.attempt_count,
                    "Invoice payment failed"
                );
                HandlerReport::new(HandlerOutcome::NoOp, customer_id, summary)
            }
            _ => HandlerReport::new(HandlerOutcome::NoOp, customer_id, summary),
        }
    }

    async fn handle_customer(&self, kind: EventKind, envelope: &EventEnvelope) -> HandlerReport {
        match kind {
            EventKind::CustomerCreated | EventKind::CustomerUpdated => {
                let customer: CustomerObject = match envelope.object() {
                    Ok(c) => c,
                    Err(e) => return HandlerReport::failed(e, None),
                };

                let summary = json!({
                    "customer_id": customer.id,
                    "has_email": customer.email.is_some(),
                    "has_name": customer.name.is_some(),
                });

                // Profile sync only. Customer-level events never touch
                // subscription fields.
                let patch = AccountPatch {
                    email: customer.email.clone(),
                    name: customer.name.clone(),
                    ..Default::default()
                };

                if patch.is_empty() {
                    return HandlerReport::new(HandlerOutcome::NoOp, Some(customer.id), summary);
                }

                self.apply_guarded(&customer.id, patch, envelope, summary).await
            }
            _ => {
                let source: PaymentSourceObject = match envelope.object() {
                    Ok(s) => s,
                    Err(e) => return HandlerReport::failed(e, None),
                };
                HandlerReport::new(
                    HandlerOutcome::NoOp,
                    source.customer.clone(),
                    json!({ "source_id": source.id }),
                )
            }
        }
    }

    async fn handle_setup(&self, kind: EventKind, envelope: &EventEnvelope) -> HandlerReport {
        let intent: SetupIntentObject = match envelope.object() {
            Ok(i) => i,
            Err(e) => return HandlerReport::failed(e, None),
        };

        let summary = json!({
            "setup_intent_id": intent.id,
            "status": intent.status,
            "has_payment_method": intent.payment_method.is_some(),
        });

        if kind != EventKind::SetupIntentSucceeded {
            return HandlerReport::new(HandlerOutcome::NoOp, intent.customer.clone(), summary);
        }

        let Some(customer_id) = intent.customer.clone() else {
            return HandlerReport::new(HandlerOutcome::NoOp, None, summary);
        };

        let patch = AccountPatch {
            has_payment_method: Some(true),
            ..Default::default()
        };
        self.apply_guarded(&customer_id, patch, envelope, summary).await
    }

    // ------------------------------------------------------------------
    // Shared plumbing
    // ------------------------------------------------------------------

    /// Apply a guarded account patch, translating the store outcome into a
    /// handler report.
    async fn apply_guarded(
        &self,
        customer_id: &str,
        patch: AccountPatch,
        envelope: &EventEnvelope,
        summary: Value,
    ) -> HandlerReport {
        match self
            .accounts
            .update_subscription_fields(customer_id, patch, envelope.created_at())
            .await
        {
            Ok(UpdateOutcome::Updated(_)) => HandlerReport::new(
                HandlerOutcome::Applied,
                Some(customer_id.to_string()),
                summary,
            ),
            Ok(UpdateOutcome::NotFound) => {
                tracing::info!(
                    customer_id = %customer_id,
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    "Event references unknown customer; account unchanged"
                );
                HandlerReport::new(
                    HandlerOutcome::AccountMissing,
                    Some(customer_id.to_string()),
                    summary,
                )
            }
            Ok(UpdateOutcome::OutOfOrder) => {
                tracing::info!(
                    customer_id = %customer_id,
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    event_created = envelope.created,
                    "Stale event; account fields already reflect a newer event"
                );
                HandlerReport::new(
                    HandlerOutcome::OutOfOrder,
                    Some(customer_id.to_string()),
                    summary,
                )
            }
            Err(e) => HandlerReport::failed(e, Some(customer_id.to_string())),
        }
    }

    /// The provider is the source of truth, so unexpected lifecycle jumps
    /// are applied anyway; this only surfaces them.
    async fn warn_on_unexpected_transition(&self, customer_id: &str, to: SubscriptionStatus) {
        if let Ok(Some(Account {
            subscription_status: from,
            ..
        })) = self.accounts.find_by_customer(customer_id).await
        {
            if !SubscriptionStatus::transition_is_expected(from, to) {
                tracing::warn!(
                    customer_id = %customer_id,
                    from = from.as_str(),
                    to = to.as_str(),
                    "Unexpected subscription lifecycle transition"
                );
            }
        }
    }
}
