//! In-process backend for tests and local development
//!
//! A single mutex guards all state, which gives every operation the same
//! all-or-nothing behavior the Postgres transactions provide.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate};
use evisit_shared::{DocumentStatus, License, LicenseStatus, User};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{
    license_bonus_reference, BillingStore, EventClaim, LicenseActivation, NewLicense, NewReceipt,
    Receipt, RecordedReceipt,
};
use crate::documents::{
    Document, DocumentKind, DocumentRepository, DocumentSummary, LineItem, ValidatedDocument,
};
use crate::error::{BillingError, BillingResult};
use crate::receipts::RECEIPT_PREFIX;
use crate::sequence::{format_document_number, yearly_sequence_name, RECEIPT_SEQUENCE_FAMILY};

#[derive(Debug)]
struct WebhookEventRecord {
    result: &'static str,
    started_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Default)]
struct State {
    users: HashMap<Uuid, User>,
    licenses: Vec<License>,
    coin_credits: HashMap<String, (Uuid, i64)>,
    receipts: Vec<Receipt>,
    sequences: HashMap<String, i64>,
    documents: HashMap<(DocumentKind, Uuid), Document>,
    webhook_events: HashMap<String, WebhookEventRecord>,
}

impl State {
    fn allocate(&mut self, name: &str) -> BillingResult<i64> {
        let value = self
            .sequences
            .get_mut(name)
            .ok_or_else(|| BillingError::SequenceNotFound(name.to_string()))?;
        let current = *value;
        *value += 1;
        Ok(current)
    }
}

/// Stale `processing` claims may be taken over after this long
const PROCESSING_TIMEOUT: time::Duration = time::Duration::minutes(30);

pub struct InMemoryBillingStore {
    state: Mutex<State>,
}

impl Default for InMemoryBillingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBillingStore {
    /// Empty store with the invoice and offer sequences seeded at 1
    pub fn new() -> Self {
        let mut state = State::default();
        state
            .sequences
            .insert(DocumentKind::Invoice.sequence_name().to_string(), 1);
        state
            .sequences
            .insert(DocumentKind::Offer.sequence_name().to_string(), 1);
        Self {
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert_user(&self, user: User) -> User {
        self.lock().users.insert(user.id, user.clone());
        user
    }

    pub fn user(&self, user_id: Uuid) -> Option<User> {
        self.lock().users.get(&user_id).cloned()
    }

    pub fn licenses_for(&self, user_id: Uuid) -> Vec<License> {
        self.lock()
            .licenses
            .iter()
            .filter(|l| l.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn receipt_count(&self) -> usize {
        self.lock().receipts.len()
    }

    pub fn receipts_for(&self, user_id: Uuid) -> Vec<Receipt> {
        self.lock()
            .receipts
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect()
    }

    /// Remove a sequence row, as a broken deployment would
    pub fn drop_sequence(&self, name: &str) {
        self.lock().sequences.remove(name);
    }
}

#[async_trait]
impl BillingStore for InMemoryBillingStore {
    async fn find_user(&self, user_id: Uuid) -> BillingResult<Option<User>> {
        Ok(self.lock().users.get(&user_id).cloned())
    }

    async fn find_user_by_customer(&self, customer_id: &str) -> BillingResult<Option<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|u| u.stripe_customer_id.as_deref() == Some(customer_id))
            .cloned())
    }

    async fn attach_customer(&self, user_id: Uuid, customer_id: &str) -> BillingResult<()> {
        let mut state = self.lock();
        let user = state
            .users
            .get_mut(&user_id)
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;
        if user.stripe_customer_id.is_none() {
            user.stripe_customer_id = Some(customer_id.to_string());
        }
        Ok(())
    }

    async fn credit_coins(&self, user_id: Uuid, coins: i64, payment_reference: &str) -> BillingResult<bool> {
        let mut state = self.lock();
        if !state.users.contains_key(&user_id) {
            return Err(BillingError::NotFound(format!("user {}", user_id)));
        }
        if state.coin_credits.contains_key(payment_reference) {
            return Ok(false);
        }
        state
            .coin_credits
            .insert(payment_reference.to_string(), (user_id, coins));
        if let Some(user) = state.users.get_mut(&user_id) {
            user.coin_balance += coins;
        }
        Ok(true)
    }

    async fn find_license_by_subscription(&self, subscription_id: &str) -> BillingResult<Option<License>> {
        Ok(self
            .lock()
            .licenses
            .iter()
            .find(|l| l.stripe_subscription_id.as_deref() == Some(subscription_id))
            .cloned())
    }

    async fn latest_active_license(&self, user_id: Uuid) -> BillingResult<Option<License>> {
        Ok(self
            .lock()
            .licenses
            .iter()
            .filter(|l| l.user_id == user_id && l.is_active())
            .max_by_key(|l| l.created_at)
            .cloned())
    }

    async fn activate_license(&self, new: NewLicense) -> BillingResult<LicenseActivation> {
        let mut state = self.lock();

        if let Some(sub) = &new.stripe_subscription_id {
            if let Some(existing) = state
                .licenses
                .iter()
                .find(|l| l.stripe_subscription_id.as_deref() == Some(sub.as_str()))
            {
                return Ok(LicenseActivation::AlreadyExists(existing.clone()));
            }
        }
        if !state.users.contains_key(&new.user_id) {
            return Err(BillingError::NotFound(format!("user {}", new.user_id)));
        }

        let now = OffsetDateTime::now_utc();
        let license = License {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            stripe_subscription_id: new.stripe_subscription_id.clone(),
            plan_type: new.plan,
            subscription_status: LicenseStatus::Active,
            current_period_end: new.current_period_end,
            stripe_session_id: new.stripe_session_id.clone(),
            created_at: now,
            updated_at: now,
        };

        for other in state
            .licenses
            .iter_mut()
            .filter(|l| l.user_id == new.user_id && l.is_active())
        {
            other.subscription_status = LicenseStatus::Canceled;
            other.updated_at = now;
        }

        if new.bonus_coins > 0 {
            let reference = license_bonus_reference(&new, license.id);
            if !state.coin_credits.contains_key(&reference) {
                state
                    .coin_credits
                    .insert(reference, (new.user_id, new.bonus_coins));
                if let Some(user) = state.users.get_mut(&new.user_id) {
                    user.coin_balance += new.bonus_coins;
                }
            }
        }

        if let Some(customer_id) = &new.customer_id {
            if let Some(user) = state.users.get_mut(&new.user_id) {
                if user.stripe_customer_id.is_none() {
                    user.stripe_customer_id = Some(customer_id.clone());
                }
            }
        }

        state.licenses.push(license.clone());
        Ok(LicenseActivation::Created(license))
    }

    async fn renew_license(
        &self,
        subscription_id: &str,
        current_period_end: Option<OffsetDateTime>,
    ) -> BillingResult<Option<License>> {
        let mut state = self.lock();
        let Some(license) = state
            .licenses
            .iter_mut()
            .find(|l| l.stripe_subscription_id.as_deref() == Some(subscription_id))
        else {
            return Ok(None);
        };
        license.subscription_status = LicenseStatus::Active;
        if current_period_end.is_some() {
            license.current_period_end = current_period_end;
        }
        license.updated_at = OffsetDateTime::now_utc();
        Ok(Some(license.clone()))
    }

    async fn set_license_status(
        &self,
        subscription_id: &str,
        status: LicenseStatus,
    ) -> BillingResult<Option<License>> {
        let mut state = self.lock();
        let Some(license) = state
            .licenses
            .iter_mut()
            .find(|l| l.stripe_subscription_id.as_deref() == Some(subscription_id))
        else {
            return Ok(None);
        };
        license.subscription_status = status;
        license.updated_at = OffsetDateTime::now_utc();
        Ok(Some(license.clone()))
    }

    async fn record_receipt(&self, new: NewReceipt) -> BillingResult<RecordedReceipt> {
        let mut state = self.lock();
        if let Some(existing) = state
            .receipts
            .iter()
            .find(|r| r.stripe_payment_intent_id == new.payment_reference)
        {
            return Ok(RecordedReceipt {
                receipt: existing.clone(),
                created: false,
            });
        }

        let year = new.issue_date.year();
        let name = yearly_sequence_name(RECEIPT_SEQUENCE_FAMILY, year);
        state.sequences.entry(name.clone()).or_insert(1);
        let value = state.allocate(&name)?;

        let receipt = Receipt {
            id: Uuid::new_v4(),
            receipt_number: format_document_number(RECEIPT_PREFIX, year, value),
            user_id: new.user_id,
            stripe_payment_intent_id: new.payment_reference,
            item_description: new.item_description,
            amount: new.amount,
            currency: new.currency,
            issue_date: new.issue_date,
            delivered_at: None,
            delivery_attempts: 0,
            last_delivery_error: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.receipts.push(receipt.clone());
        Ok(RecordedReceipt {
            receipt,
            created: true,
        })
    }

    async fn find_receipt(&self, receipt_id: Uuid) -> BillingResult<Option<Receipt>> {
        Ok(self
            .lock()
            .receipts
            .iter()
            .find(|r| r.id == receipt_id)
            .cloned())
    }

    async fn find_receipt_by_number(&self, receipt_number: &str) -> BillingResult<Option<Receipt>> {
        Ok(self
            .lock()
            .receipts
            .iter()
            .find(|r| r.receipt_number == receipt_number)
            .cloned())
    }

    async fn mark_receipt_delivered(&self, receipt_id: Uuid) -> BillingResult<()> {
        let mut state = self.lock();
        if let Some(receipt) = state.receipts.iter_mut().find(|r| r.id == receipt_id) {
            receipt.delivered_at = Some(OffsetDateTime::now_utc());
            receipt.delivery_attempts += 1;
            receipt.last_delivery_error = None;
        }
        Ok(())
    }

    async fn record_delivery_failure(&self, receipt_id: Uuid, error: &str) -> BillingResult<()> {
        let mut state = self.lock();
        if let Some(receipt) = state.receipts.iter_mut().find(|r| r.id == receipt_id) {
            receipt.delivery_attempts += 1;
            receipt.last_delivery_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn pending_receipts(&self, limit: i64, max_attempts: i32) -> BillingResult<Vec<Receipt>> {
        let state = self.lock();
        let mut pending: Vec<Receipt> = state
            .receipts
            .iter()
            .filter(|r| r.delivered_at.is_none() && r.delivery_attempts < max_attempts)
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.created_at);
        pending.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(pending)
    }

    async fn claim_webhook_event(
        &self,
        event_id: &str,
        _event_type: &str,
        _event_timestamp: OffsetDateTime,
    ) -> BillingResult<EventClaim> {
        let mut state = self.lock();
        let now = OffsetDateTime::now_utc();
        let claim = match state.webhook_events.get(event_id) {
            None => EventClaim::Claimed,
            Some(record) if record.result == "success" => EventClaim::Completed,
            Some(record) if record.result == "processing" && record.started_at >= now - PROCESSING_TIMEOUT => {
                EventClaim::InFlight
            }
            Some(_) => EventClaim::Claimed,
        };
        if claim == EventClaim::Claimed {
            state.webhook_events.insert(
                event_id.to_string(),
                WebhookEventRecord {
                    result: "processing",
                    started_at: now,
                    processed_at: None,
                },
            );
        }
        Ok(claim)
    }

    async fn finish_webhook_event(&self, event_id: &str, error: Option<&str>) -> BillingResult<()> {
        let mut state = self.lock();
        if let Some(record) = state.webhook_events.get_mut(event_id) {
            record.result = if error.is_some() { "error" } else { "success" };
            record.processed_at = Some(OffsetDateTime::now_utc());
        }
        Ok(())
    }

    async fn purge_webhook_events(&self, retention_days: i32) -> BillingResult<u64> {
        let mut state = self.lock();
        let cutoff = OffsetDateTime::now_utc() - time::Duration::days(i64::from(retention_days));
        let before = state.webhook_events.len();
        state
            .webhook_events
            .retain(|_, record| record.processed_at.map_or(true, |at| at >= cutoff));
        Ok((before - state.webhook_events.len()) as u64)
    }
}

fn line_items(document: &ValidatedDocument) -> Vec<LineItem> {
    document
        .line_items
        .iter()
        .enumerate()
        .map(|(position, item)| LineItem {
            id: Uuid::new_v4(),
            position: position as i32,
            description: item.description.trim().to_string(),
            quantity: item.quantity,
            unit_price: item.unit_price,
            amount: item.quantity * item.unit_price,
        })
        .collect()
}

#[async_trait]
impl DocumentRepository for InMemoryBillingStore {
    async fn create(
        &self,
        kind: DocumentKind,
        document: &ValidatedDocument,
        created_by: Uuid,
        issue_date: NaiveDate,
    ) -> BillingResult<Document> {
        let mut state = self.lock();
        let value = state.allocate(kind.sequence_name())?;
        let now = OffsetDateTime::now_utc();
        let created = Document {
            kind,
            id: Uuid::new_v4(),
            number: format_document_number(kind.number_prefix(), issue_date.year(), value),
            recipient_name: document.recipient_name.clone(),
            recipient_email: document.recipient_email.clone(),
            issue_date,
            due_date: document.due_date,
            subtotal: document.totals.subtotal,
            tax: document.totals.tax,
            total_amount: document.totals.total,
            status: DocumentStatus::Draft,
            notes: document.notes.clone(),
            created_by,
            line_items: line_items(document),
            created_at: now,
            updated_at: now,
        };
        state.documents.insert((kind, created.id), created.clone());
        Ok(created)
    }

    async fn update(
        &self,
        kind: DocumentKind,
        id: Uuid,
        document: &ValidatedDocument,
    ) -> BillingResult<Document> {
        let mut state = self.lock();
        let existing = state
            .documents
            .get_mut(&(kind, id))
            .ok_or_else(|| BillingError::NotFound(format!("{} {}", kind, id)))?;
        existing.recipient_name = document.recipient_name.clone();
        existing.recipient_email = document.recipient_email.clone();
        existing.due_date = document.due_date;
        existing.subtotal = document.totals.subtotal;
        existing.tax = document.totals.tax;
        existing.total_amount = document.totals.total;
        existing.notes = document.notes.clone();
        existing.line_items = line_items(document);
        existing.updated_at = OffsetDateTime::now_utc();
        Ok(existing.clone())
    }

    async fn delete(&self, kind: DocumentKind, id: Uuid) -> BillingResult<()> {
        self.lock()
            .documents
            .remove(&(kind, id))
            .map(|_| ())
            .ok_or_else(|| BillingError::NotFound(format!("{} {}", kind, id)))
    }

    async fn find(&self, kind: DocumentKind, id: Uuid) -> BillingResult<Option<Document>> {
        Ok(self.lock().documents.get(&(kind, id)).cloned())
    }

    async fn list(&self, kind: DocumentKind) -> BillingResult<Vec<DocumentSummary>> {
        let state = self.lock();
        let mut documents: Vec<&Document> = state
            .documents
            .values()
            .filter(|d| d.kind == kind)
            .collect();
        documents.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.number.cmp(&a.number)));
        Ok(documents
            .into_iter()
            .map(|d| DocumentSummary {
                id: d.id,
                number: d.number.clone(),
                recipient_name: d.recipient_name.clone(),
                recipient_email: d.recipient_email.clone(),
                issue_date: d.issue_date,
                due_date: d.due_date,
                total_amount: d.total_amount,
                status: d.status,
            })
            .collect())
    }

    async fn transition_status(
        &self,
        kind: DocumentKind,
        id: Uuid,
        from: DocumentStatus,
        to: DocumentStatus,
    ) -> BillingResult<bool> {
        let mut state = self.lock();
        match state.documents.get_mut(&(kind, id)) {
            Some(document) if document.status == from => {
                document.status = to;
                document.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(BillingError::NotFound(format!("{} {}", kind, id))),
        }
    }
}
