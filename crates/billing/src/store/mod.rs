//! Persistence boundary for fulfillment state
//!
//! [`PgBillingStore`] is the production backend. [`InMemoryBillingStore`]
//! keeps the same contract in process memory for tests and local runs.

mod memory;
mod postgres;

pub use memory::InMemoryBillingStore;
pub use postgres::{PgBillingStore, PgDocumentRepository};

use async_trait::async_trait;
use chrono::NaiveDate;
use evisit_shared::{License, LicenseStatus, PlanType, User};
use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// State of the event log when a delivery arrives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventClaim {
    /// New event, or the previous attempt failed or went stale
    Claimed,
    /// Another delivery is marked as processing and has not finished
    InFlight,
    /// A previous delivery succeeded
    Completed,
}

/// Immutable record of a completed payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, FromRow)]
pub struct Receipt {
    pub id: Uuid,
    pub receipt_number: String,
    pub user_id: Uuid,
    /// External payment reference, unique per receipt
    pub stripe_payment_intent_id: String,
    pub item_description: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub issue_date: NaiveDate,
    #[serde(with = "time::serde::rfc3339::option")]
    pub delivered_at: Option<OffsetDateTime>,
    pub delivery_attempts: i32,
    pub last_delivery_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewReceipt {
    pub user_id: Uuid,
    pub payment_reference: String,
    pub item_description: String,
    pub amount: i64,
    pub currency: String,
    pub issue_date: NaiveDate,
}

/// Result of recording a receipt; `created` is false when the payment
/// reference already had one.
#[derive(Debug, Clone)]
pub struct RecordedReceipt {
    pub receipt: Receipt,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub struct NewLicense {
    pub user_id: Uuid,
    pub stripe_subscription_id: Option<String>,
    /// Stored on the user when they have no customer reference yet
    pub customer_id: Option<String>,
    pub plan: PlanType,
    pub current_period_end: Option<OffsetDateTime>,
    pub stripe_session_id: Option<String>,
    /// Coins credited together with the license
    pub bonus_coins: i64,
}

#[derive(Debug, Clone)]
pub enum LicenseActivation {
    Created(License),
    /// Another delivery created the license for this subscription first
    AlreadyExists(License),
}

/// Ledger reference used for the bonus coins bundled with a license
pub fn license_bonus_reference(license: &NewLicense, license_id: Uuid) -> String {
    match &license.stripe_subscription_id {
        Some(sub) => format!("license:{}", sub),
        None => format!("license:{}", license_id),
    }
}

#[async_trait]
pub trait BillingStore: Send + Sync {
    // Users
    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>>;

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<User>>;

    /// Store the customer reference unless the user already has one
    async fn attach_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()>;

    // Coins

    /// Add coins once per payment reference. Returns false when the
    /// reference was already credited. Fails with NotFound for unknown users.
    async fn credit_coins(&self, user_id: Uuid, coins: i64, payment_reference: &str) -> BillingResult<bool>;

    // Licenses
    async fn find_license_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<License>>;

    async fn latest_active_license(&self, user_id: Uuid) -> BillingResult<Option<License>>;

    /// Create the license, supersede the user's other active licenses and
    /// credit the bonus coins, all or nothing.
    async fn activate_license(&self, license: NewLicense) -> BillingResult<LicenseActivation>;

    async fn renew_license(
        &self,
        subscription_id: &str,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<License>>;

    async fn set_license_status(
        &self,
        subscription_id: &str,
        status: LicenseStatus,
    ) -> BillingResult<Option<License>>;

    // Receipts

    /// Insert a receipt under the next yearly receipt number, or return the
    /// existing one for the same payment reference.
    async fn record_receipt(&self, receipt: NewReceipt) -> BillingResult<RecordedReceipt>;

    async fn find_receipt(&self, receipt_id: Uuid) -> BillingResult<Option<Receipt>>;

    async fn find_receipt_by_number(&self, receipt_number: &str) -> BillingResult<Option<Receipt>>;

    async fn mark_receipt_delivered(&self, receipt_id: Uuid) -> BillingResult<()>;

    async fn record_delivery_failure(&self, receipt_id: Uuid, error: &str) -> BillingResult<()>;

    /// Undelivered receipts below the attempt cap, oldest first
    async fn pending_receipts(&self, limit: i64, max_attempts: i32) -> BillingResult<Vec<Receipt>>;

    // Webhook events

    /// Record a delivery of an event and report what earlier deliveries left
    async fn claim_webhook_event(
        &self,
        event_id: &str,
        event_type: &str,
        event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim>;

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()>;

    /// Delete finished event records older than the retention window
    async fn purge_webhook_events(&self, retention_days: i32) -> BillingResult<u64>;
}
