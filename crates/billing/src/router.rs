//! Event routing
//!
//! A static mapping from provider event-type strings to typed event kinds,
//! built once at startup by explicit registration and immutable afterward.
//! Adding a new event type means adding an `EventKind` variant and a
//! `register` call; nothing is reflective, so a typo cannot silently
//! misroute. Unknown types route to `None` and are acknowledged as no-op
//! successes upstream, because the provider's event catalog grows over time
//! and rejecting an unknown type would make it retry forever.

use std::collections::HashMap;

/// Every provider event type this pipeline handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CheckoutSessionCompleted,

    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    TrialWillEnd,

    PaymentIntentCreated,
    PaymentIntentSucceeded,
    PaymentIntentFailed,
    ChargeSucceeded,
    ChargeFailed,
    ChargeRefunded,
    DisputeCreated,

    InvoiceCreated,
    InvoiceUpdated,
    InvoiceFinalized,
    InvoicePaid,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,

    CustomerCreated,
    CustomerUpdated,
    PaymentSourceExpiring,
    PaymentSourceUpdated,

    SetupIntentCreated,
    SetupIntentSucceeded,
    SetupIntentFailed,
}

/// Handler grouping; each kind maps to exactly one category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerCategory {
    Checkout,
    Subscription,
    Payment,
    Invoice,
    Customer,
    PaymentMethodSetup,
}

impl EventKind {
    pub fn category(&self) -> HandlerCategory {
        use EventKind::*;
        match self {
            CheckoutSessionCompleted => HandlerCategory::Checkout,

            SubscriptionCreated | SubscriptionUpdated | SubscriptionDeleted | TrialWillEnd => {
                HandlerCategory::Subscription
            }

            PaymentIntentCreated | PaymentIntentSucceeded | PaymentIntentFailed
            | ChargeSucceeded | ChargeFailed | ChargeRefunded | DisputeCreated => {
                HandlerCategory::Payment
            }

            InvoiceCreated | InvoiceUpdated | InvoiceFinalized | InvoicePaid
            | InvoicePaymentSucceeded | InvoicePaymentFailed => HandlerCategory::Invoice,

            CustomerCreated | CustomerUpdated | PaymentSourceExpiring | PaymentSourceUpdated => {
                HandlerCategory::Customer
            }

            SetupIntentCreated | SetupIntentSucceeded | SetupIntentFailed => {
                HandlerCategory::PaymentMethodSetup
            }
        }
    }
}

/// Immutable type-string → kind dispatch table
pub struct EventRouter {
    routes: HashMap<&'static str, EventKind>,
}

impl EventRouter {
    /// Build the full registration table. This is the single place a
    /// provider type string is tied to a kind.
    pub fn new() -> Self {
        let mut router = Self {
            routes: HashMap::new(),
        };

        router.register("checkout.session.completed", EventKind::CheckoutSessionCompleted);

        router.register("customer.subscription.created", EventKind::SubscriptionCreated);
        router.register("customer.subscription.updated", EventKind::SubscriptionUpdated);
        router.register("customer.subscription.deleted", EventKind::SubscriptionDeleted);
        router.register("customer.subscription.trial_will_end", EventKind::TrialWillEnd);

        router.register("payment_intent.created", EventKind::PaymentIntentCreated);
        router.register("payment_intent.succeeded", EventKind::PaymentIntentSucceeded);
        router.register("payment_intent.payment_failed", EventKind::PaymentIntentFailed);
        router.register("charge.succeeded", EventKind::ChargeSucceeded);
        router.register("charge.failed", EventKind::ChargeFailed);
        router.register("charge.refunded", EventKind::ChargeRefunded);
        router.register("charge.dispute.created", EventKind::DisputeCreated);

        router.register("invoice.created", EventKind::InvoiceCreated);
        router.register("invoice.updated", EventKind::InvoiceUpdated);
        router.register("invoice.finalized", EventKind::InvoiceFinalized);
        router.register("invoice.paid", EventKind::InvoicePaid);
        router.register("invoice.payment_succeeded", EventKind::InvoicePaymentSucceeded);
        router.register("invoice.payment_failed", EventKind::InvoicePaymentFailed);

        router.register("customer.created", EventKind::CustomerCreated);
        router.register("customer.updated", EventKind::CustomerUpdated);
        router.register("customer.source.expiring", EventKind::PaymentSourceExpiring);
        router.register("customer.source.updated", EventKind::PaymentSourceUpdated);

        router.register("setup_intent.created", EventKind::SetupIntentCreated);
        router.register("setup_intent.succeeded", EventKind::SetupIntentSucceeded);
        router.register("setup_intent.setup_failed", EventKind::SetupIntentFailed);

        router
    }

    fn register(&mut self, event_type: &'static str, kind: EventKind) {
        let previous = self.routes.insert(event_type, kind);
        debug_assert!(previous.is_none(), "duplicate registration for {event_type}");
    }

    /// Resolve a provider type string; `None` means unrouted.
    pub fn route(&self, event_type: &str) -> Option<EventKind> {
        self.routes.get(event_type).copied()
    }

    pub fn registered_types(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.routes.keys().copied()
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
