//! Fakes for the external boundaries, shared by unit and integration tests

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use evisit_shared::{User, UserRole};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::email::{Notifier, OutboundEmail};
use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    CheckoutLink, PaymentGateway, PaymentIntentLink, PaymentIntentRequest, PaymentIntentSnapshot,
    SubscriptionCheckoutRequest, SubscriptionSnapshot,
};
use crate::pdf::{CompanyProfile, PdfRenderer, TemplateSet};

pub fn company() -> CompanyProfile {
    CompanyProfile {
        name: "E-Visiton.".into(),
        address: "Kaçanik, Kosovo".into(),
        email: "info@e-visiton.test".into(),
        logo_url: "https://e-visiton.test/logo.png".into(),
    }
}

/// The templates shipped in the repository
pub fn templates() -> TemplateSet {
    TemplateSet {
        invoice: include_str!("../../../templates/invoice.html").to_string(),
        offer: include_str!("../../../templates/offer.html").to_string(),
        receipt: include_str!("../../../templates/receipt.html").to_string(),
    }
}

pub fn sample_user() -> User {
    let id = Uuid::new_v4();
    User {
        id,
        name: "Drita".into(),
        surname: "Krasniqi".into(),
        email: format!("drita+{}@example.com", id.simple()),
        role: UserRole::Business,
        is_verified: true,
        coin_balance: 0,
        stripe_customer_id: None,
        created_at: OffsetDateTime::now_utc(),
    }
}

pub fn admin_user() -> User {
    User {
        role: UserRole::Admin,
        name: "Admin".into(),
        surname: String::new(),
        ..sample_user()
    }
}

/// Renderer returning fixed bytes, or always failing
pub struct StaticRenderer {
    fail: bool,
    calls: Mutex<usize>,
}

impl StaticRenderer {
    pub const PDF: &'static [u8] = b"%PDF-1.7 test";

    pub fn ok() -> Self {
        Self {
            fail: false,
            calls: Mutex::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PdfRenderer for StaticRenderer {
    async fn render(&self, _html: &str) -> BillingResult<Vec<u8>> {
        *self.calls.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        if self.fail {
            return Err(BillingError::Render("renderer offline".into()));
        }
        Ok(Self::PDF.to_vec())
    }
}

/// Notifier that keeps every message it was asked to send
pub struct RecordingNotifier {
    deliver: bool,
    sent: Mutex<Vec<OutboundEmail>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self {
            deliver: true,
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Every send reports a delivery failure
    pub fn rejecting() -> Self {
        Self {
            deliver: false,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Default for RecordingNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, message: OutboundEmail) -> BillingResult<bool> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(self.deliver)
    }
}

/// Gateway answering from preloaded snapshots and recording initiation calls
#[derive(Default)]
pub struct FakeGateway {
    subscriptions: Mutex<HashMap<String, SubscriptionSnapshot>>,
    payment_intents: Mutex<HashMap<String, PaymentIntentSnapshot>>,
    customers: Mutex<Vec<String>>,
    checkouts: Mutex<Vec<SubscriptionCheckoutRequest>>,
    intent_requests: Mutex<Vec<PaymentIntentRequest>>,
    canceled: Mutex<Vec<String>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscription(self, subscription: SubscriptionSnapshot) -> Self {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(subscription.id.clone(), subscription);
        self
    }

    pub fn with_payment_intent(self, intent: PaymentIntentSnapshot) -> Self {
        self.payment_intents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(intent.id.clone(), intent);
        self
    }

    /// Customer IDs handed out so far
    pub fn customers(&self) -> Vec<String> {
        self.customers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn checkouts(&self) -> Vec<SubscriptionCheckoutRequest> {
        self.checkouts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn intent_requests(&self) -> Vec<PaymentIntentRequest> {
        self.intent_requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn canceled(&self) -> Vec<String> {
        self.canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such subscription: {}", subscription_id)))
    }

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> BillingResult<PaymentIntentSnapshot> {
        self.payment_intents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(payment_intent_id)
            .cloned()
            .ok_or_else(|| BillingError::StripeApi(format!("No such payment_intent: {}", payment_intent_id)))
    }

    async fn create_customer(&self, _user_id: &str, _email: &str, _name: &str) -> BillingResult<String> {
        let mut customers = self.customers.lock().unwrap_or_else(PoisonError::into_inner);
        let id = format!("cus_test_{}", customers.len() + 1);
        customers.push(id.clone());
        Ok(id)
    }

    async fn create_subscription_checkout(&self, request: SubscriptionCheckoutRequest) -> BillingResult<CheckoutLink> {
        let mut checkouts = self.checkouts.lock().unwrap_or_else(PoisonError::into_inner);
        let session_id = format!("cs_test_{}", checkouts.len() + 1);
        checkouts.push(request);
        Ok(CheckoutLink {
            url: Some(format!("https://checkout.stripe.test/{}", session_id)),
            session_id,
        })
    }

    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> BillingResult<PaymentIntentLink> {
        let mut requests = self.intent_requests.lock().unwrap_or_else(PoisonError::into_inner);
        let payment_intent_id = format!("pi_test_{}", requests.len() + 1);
        requests.push(request);
        Ok(PaymentIntentLink {
            client_secret: format!("{}_secret", payment_intent_id),
            payment_intent_id,
        })
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String> {
        Ok(format!(
            "https://billing.stripe.test/{}?return_url={}",
            customer_id, return_url
        ))
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        self.canceled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription_id.to_string());
        Ok(())
    }
}
