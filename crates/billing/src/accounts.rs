//! Account projection and state updater
//!
//! The account store is the external system of record for users; this
//! module owns only the billing projection of it: a row keyed by the
//! provider's billing-customer id carrying subscription status, period end,
//! payment-method presence, and mutable profile fields.
//!
//! Events can arrive out of order. Each field group (status, period,
//! payment method, profile) carries its own high-water mark of the last
//! applied event timestamp; a patch group is applied only when its
//! `observed_at` is not older than that mark. Groups are guarded
//! independently because subscription and invoice events update disjoint
//! field sets and must not block each other: an invoice extending the
//! period applies even if a later-timestamped status change already landed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;

use crate::error::BillingResult;

/// Derived subscription lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionStatus {
    #[default]
    None,
    Trialing,
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::None,
        }
    }

    /// Map a provider subscription status string onto the lifecycle.
    /// `incomplete`/`incomplete_expired` have no footprint here; `unpaid`
    /// folds into past-due.
    pub fn from_provider(s: &str) -> Self {
        match s {
            "trialing" => SubscriptionStatus::Trialing,
            "active" => SubscriptionStatus::Active,
            "past_due" | "unpaid" => SubscriptionStatus::PastDue,
            "canceled" => SubscriptionStatus::Canceled,
            _ => SubscriptionStatus::None,
        }
    }

    /// Whether `from -> to` is a step the lifecycle expects:
    /// none -> trialing -> active <-> past_due -> canceled, with canceled
    /// reachable from anywhere. The provider stays the source of truth, so
    /// an unexpected jump is still applied; callers use this to decide
    /// whether to log it.
    pub fn transition_is_expected(from: SubscriptionStatus, to: SubscriptionStatus) -> bool {
        use SubscriptionStatus::*;
        if from == to || to == Canceled {
            return true;
        }
        matches!(
            (from, to),
            (None, Trialing)
                | (None, Active)
                | (Trialing, Active)
                | (Active, PastDue)
                | (PastDue, Active)
        )
    }
}

/// Billing projection of an account, keyed by billing-customer id
#[derive(Debug, Clone, Serialize)]
pub struct Account {
    pub customer_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub has_payment_method: bool,
    pub pending_email_verification: bool,
    /// Last applied event timestamp per field group
    pub status_observed_at: Option<OffsetDateTime>,
    pub period_observed_at: Option<OffsetDateTime>,
    pub payment_method_observed_at: Option<OffsetDateTime>,
    pub profile_observed_at: Option<OffsetDateTime>,
}

impl Account {
    /// Minimal shell created by checkout-completion events.
    pub fn shell(customer_id: &str) -> Self {
        Self {
            customer_id: customer_id.to_string(),
            email: None,
            name: None,
            subscription_status: SubscriptionStatus::None,
            current_period_end: None,
            has_payment_method: false,
            pending_email_verification: false,
            status_observed_at: None,
            period_observed_at: None,
            payment_method_observed_at: None,
            profile_observed_at: None,
        }
    }
}

/// Initial fields for account creation
#[derive(Debug, Clone, Default)]
pub struct NewAccount {
    pub email: Option<String>,
    pub name: Option<String>,
    pub subscription_status: SubscriptionStatus,
    pub pending_email_verification: bool,
    /// Timestamp of the event that created the account. Stamped onto the
    /// status and profile watermarks so an older event delivered later
    /// cannot overwrite the initial fields.
    pub observed_at: Option<OffsetDateTime>,
}

/// Partial update; absent fields are untouched. Fields are grouped for the
/// out-of-order guard: status, period, payment method, profile.
#[derive(Debug, Clone, Default)]
pub struct AccountPatch {
    pub subscription_status: Option<SubscriptionStatus>,
    pub current_period_end: Option<OffsetDateTime>,
    pub has_payment_method: Option<bool>,
    pub email: Option<String>,
    pub name: Option<String>,
    pub pending_email_verification: Option<bool>,
}

impl AccountPatch {
    pub fn is_empty(&self) -> bool {
        self.subscription_status.is_none()
            && self.current_period_end.is_none()
            && self.has_payment_method.is_none()
            && self.email.is_none()
            && self.name.is_none()
            && self.pending_email_verification.is_none()
    }
}

/// Result of applying a guarded patch
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    Updated(Account),
    /// No account exists for the customer id; non-fatal, the caller logs
    /// and skips (out-of-order or test-mode events reference unknown
    /// customers).
    NotFound,
    /// Every field group the patch touched was older than its watermark.
    OutOfOrder,
}

fn group_is_fresh(watermark: Option<OffsetDateTime>, observed_at: OffsetDateTime) -> bool {
    watermark.map(|w| observed_at >= w).unwrap_or(true)
}

/// Apply `patch` to `account` under the per-group out-of-order guard.
/// Returns the names of the groups that were applied; an empty result for
/// a non-empty patch means the whole patch was stale.
pub fn apply_patch(
    account: &mut Account,
    patch: &AccountPatch,
    observed_at: OffsetDateTime,
) -> Vec<&'static str> {
    let mut applied = Vec::new();

    if let Some(status) = patch.subscription_status {
        if group_is_fresh(account.status_observed_at, observed_at) {
            account.subscription_status = status;
            account.status_observed_at = Some(observed_at);
            applied.push("status");
        }
    }

    if let Some(period_end) = patch.current_period_end {
        if group_is_fresh(account.period_observed_at, observed_at) {
            account.current_period_end = Some(period_end);
            account.period_observed_at = Some(observed_at);
            applied.push("period");
        }
    }

    if let Some(has_pm) = patch.has_payment_method {
        if group_is_fresh(account.payment_method_observed_at, observed_at) {
            account.has_payment_method = has_pm;
            account.payment_method_observed_at = Some(observed_at);
            applied.push("payment_method");
        }
    }

    let touches_profile =
        patch.email.is_some() || patch.name.is_some() || patch.pending_email_verification.is_some();
    if touches_profile && group_is_fresh(account.profile_observed_at, observed_at) {
        if let Some(email) = &patch.email {
            account.email = Some(email.clone());
        }
        if let Some(name) = &patch.name {
            account.name = Some(name.clone());
        }
        if let Some(pending) = patch.pending_email_verification {
            account.pending_email_verification = pending;
        }
        account.profile_observed_at = Some(observed_at);
        applied.push("profile");
    }

    applied
}

/// Collaborator seam over the external account store
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<Account>>;

    /// Find-or-create keyed by customer id; idempotent, so a redelivered
    /// checkout event cannot create a second account. `initial.observed_at`
    /// seeds the status and profile watermarks, which keeps an
    /// earlier-created event delivered after the checkout from overwriting
    /// the initial status.
    async fn create_account(&self, customer_id: &str, initial: NewAccount)
        -> BillingResult<Account>;

    /// Guarded partial update; see [`apply_patch`].
    async fn update_subscription_fields(
        &self,
        customer_id: &str,
        patch: AccountPatch,
        observed_at: OffsetDateTime,
    ) -> BillingResult<UpdateOutcome>;
}

#[derive(Debug, sqlx::FromRow)]
struct AccountRow {
    customer_id: String,
    email: Option<String>,
    name: Option<String>,
    subscription_status: String,
    current_period_end: Option<OffsetDateTime>,
    has_payment_method: bool,
    pending_email_verification: bool,
    status_observed_at: Option<OffsetDateTime>,
    period_observed_at: Option<OffsetDateTime>,
    payment_method_observed_at: Option<OffsetDateTime>,
    profile_observed_at: Option<OffsetDateTime>,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Account {
            customer_id: row.customer_id,
            email: row.email,
            name: row.name,
            subscription_status: SubscriptionStatus::from_str(&row.subscription_status),
            current_period_end: row.current_period_end,
            has_payment_method: row.has_payment_method,
            pending_email_verification: row.pending_email_verification,
            status_observed_at: row.status_observed_at,
            period_observed_at: row.period_observed_at,
            payment_method_observed_at: row.payment_method_observed_at,
            profile_observed_at: row.profile_observed_at,
        }
    }
}

const ACCOUNT_COLUMNS: &str = "customer_id, email, name, subscription_status, \
     current_period_end, has_payment_method, pending_email_verification, \
     status_observed_at, period_observed_at, payment_method_observed_at, profile_observed_at";

/// Postgres-backed account store. Updates run the pure [`apply_patch`]
/// guard inside a `SELECT .. FOR UPDATE` transaction: the row lock
/// serializes two concurrent deliveries touching the same customer, and
/// the group watermarks keep non-conflicting updates from overwriting each
/// other.
pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE customer_id = $1"
        ))
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Account::from))
    }

    async fn create_account(
        &self,
        customer_id: &str,
        initial: NewAccount,
    ) -> BillingResult<Account> {
        let row: AccountRow = sqlx::query_as(&format!(
            r#"
            INSERT INTO accounts
                (customer_id, email, name, subscription_status, pending_email_verification,
                 status_observed_at, profile_observed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (customer_id) DO UPDATE SET updated_at = NOW()
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(customer_id)
        .bind(&initial.email)
        .bind(&initial.name)
        .bind(initial.subscription_status.as_str())
        .bind(initial.pending_email_verification)
        .bind(initial.observed_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Account::from(row))
    }

    async fn update_subscription_fields(
        &self,
        customer_id: &str,
        patch: AccountPatch,
        observed_at: OffsetDateTime,
    ) -> BillingResult<UpdateOutcome> {
        let mut tx = self.pool.begin().await?;

        let row: Option<AccountRow> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE customer_id = $1 FOR UPDATE"
        ))
        .bind(customer_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(UpdateOutcome::NotFound);
        };

        let mut account = Account::from(row);
        let applied = apply_patch(&mut account, &patch, observed_at);
        if applied.is_empty() {
            return Ok(UpdateOutcome::OutOfOrder);
        }

        sqlx::query(
            r#"
            UPDATE accounts SET
                email = $2,
                name = $3,
                subscription_status = $4,
                current_period_end = $5,
                has_payment_method = $6,
                pending_email_verification = $7,
                status_observed_at = $8,
                period_observed_at = $9,
                payment_method_observed_at = $10,
                profile_observed_at = $11,
                updated_at = NOW()
            WHERE customer_id = $1
            "#,
        )
        .bind(&account.customer_id)
        .bind(&account.email)
        .bind(&account.name)
        .bind(account.subscription_status.as_str())
        .bind(account.current_period_end)
        .bind(account.has_payment_method)
        .bind(account.pending_email_verification)
        .bind(account.status_observed_at)
        .bind(account.period_observed_at)
        .bind(account.payment_method_observed_at)
        .bind(account.profile_observed_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(UpdateOutcome::Updated(account))
    }
}

/// In-memory account store for tests and single-instance use
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: Arc<Mutex<HashMap<String, Account>>>,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    async fn find_by_customer(&self, customer_id: &str) -> BillingResult<Option<Account>> {
        Ok(self.accounts.lock().await.get(customer_id).cloned())
    }

    async fn create_account(
        &self,
        customer_id: &str,
        initial: NewAccount,
    ) -> BillingResult<Account> {
        let mut accounts = self.accounts.lock().await;
        let account = accounts.entry(customer_id.to_string()).or_insert_with(|| {
            let mut shell = Account::shell(customer_id);
            shell.email = initial.email.clone();
            shell.name = initial.name.clone();
            shell.subscription_status = initial.subscription_status;
            shell.pending_email_verification = initial.pending_email_verification;
            shell.status_observed_at = initial.observed_at;
            shell.profile_observed_at = initial.observed_at;
            shell
        });
        Ok(account.clone())
    }

    async fn update_subscription_fields(
        &self,
        customer_id: &str,
        patch: AccountPatch,
        observed_at: OffsetDateTime,
    ) -> BillingResult<UpdateOutcome> {
        let mut accounts = self.accounts.lock().await;
        let Some(account) = accounts.get_mut(customer_id) else {
            return Ok(UpdateOutcome::NotFound);
        };

        let applied = apply_patch(account, &patch, observed_at);
        if applied.is_empty() {
            return Ok(UpdateOutcome::OutOfOrder);
        }

        Ok(UpdateOutcome::Updated(account.clone()))
    }
}
