//! Payment processor boundary
//!
//! Webhook payloads are not trusted for subscription state; handlers
//! re-read the subscription and payment intent through this boundary.
//! Payment initiation (customers, checkout, portal, cancel) goes through
//! it as well.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CreateCheckoutSessionSubscriptionData,
    CreateCustomer, CreatePaymentIntent, CreatePaymentIntentAutomaticPaymentMethods, Currency, Customer,
    CustomerId, PaymentIntent, PaymentIntentId, Subscription, SubscriptionId, UpdateSubscription,
};
use time::OffsetDateTime;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};

/// The parts of a Stripe subscription fulfillment cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSnapshot {
    pub id: String,
    pub customer_id: String,
    pub current_period_end: Option<OffsetDateTime>,
    pub price_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// The parts of a Stripe payment intent needed for receipts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentSnapshot {
    pub id: String,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub customer_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

/// Hosted checkout for a subscription price
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionCheckoutRequest {
    pub customer_id: String,
    pub price_id: String,
    /// Copied onto both the session and the subscription it creates
    pub metadata: HashMap<String, String>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLink {
    pub session_id: String,
    pub url: Option<String>,
}

/// One-off payment confirmed client side
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentRequest {
    pub customer_id: Option<String>,
    /// Minor currency units
    pub amount: i64,
    pub currency: String,
    pub description: String,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntentLink {
    pub payment_intent_id: String,
    pub client_secret: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot>;

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> BillingResult<PaymentIntentSnapshot>;

    /// Returns the new customer ID
    async fn create_customer(&self, user_id: &str, email: &str, name: &str) -> BillingResult<String>;

    async fn create_subscription_checkout(&self, request: SubscriptionCheckoutRequest) -> BillingResult<CheckoutLink>;

    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> BillingResult<PaymentIntentLink>;

    /// Returns the portal URL
    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String>;

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()>;
}

fn parse_id<T: std::str::FromStr>(value: &str, what: &str) -> BillingResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| BillingError::StripeApi(format!("Invalid {} ID: {}", what, e)))
}

/// [`PaymentGateway`] backed by the Stripe API
#[derive(Clone)]
pub struct StripeGateway {
    stripe: StripeClient,
}

impl StripeGateway {
    pub fn new(stripe: StripeClient) -> Self {
        Self { stripe }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn retrieve_subscription(&self, subscription_id: &str) -> BillingResult<SubscriptionSnapshot> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;

        let subscription = Subscription::retrieve(self.stripe.inner(), &id, &[]).await?;

        let price_id = subscription
            .items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.to_string());

        Ok(SubscriptionSnapshot {
            id: subscription.id.to_string(),
            customer_id: subscription.customer.id().to_string(),
            current_period_end: OffsetDateTime::from_unix_timestamp(subscription.current_period_end).ok(),
            price_id,
            metadata: subscription.metadata,
        })
    }

    async fn retrieve_payment_intent(&self, payment_intent_id: &str) -> BillingResult<PaymentIntentSnapshot> {
        let id: PaymentIntentId = parse_id(payment_intent_id, "payment intent")?;

        let intent = PaymentIntent::retrieve(self.stripe.inner(), &id, &[]).await?;

        let amount = if intent.amount_received > 0 {
            intent.amount_received
        } else {
            intent.amount
        };

        Ok(PaymentIntentSnapshot {
            id: intent.id.to_string(),
            amount,
            currency: intent.currency.to_string(),
            customer_id: intent.customer.as_ref().map(|c| c.id().to_string()),
            metadata: intent.metadata,
        })
    }

    async fn create_customer(&self, user_id: &str, email: &str, name: &str) -> BillingResult<String> {
        let mut metadata = HashMap::new();
        metadata.insert("userId".to_string(), user_id.to_string());

        let params = CreateCustomer {
            email: Some(email),
            name: Some(name),
            metadata: Some(metadata),
            ..Default::default()
        };

        let customer = Customer::create(self.stripe.inner(), params).await?;
        Ok(customer.id.to_string())
    }

    async fn create_subscription_checkout(&self, request: SubscriptionCheckoutRequest) -> BillingResult<CheckoutLink> {
        let customer_id: CustomerId = parse_id(&request.customer_id, "customer")?;

        let params = CreateCheckoutSession {
            customer: Some(customer_id),
            mode: Some(CheckoutSessionMode::Subscription),
            line_items: Some(vec![CreateCheckoutSessionLineItems {
                price: Some(request.price_id.clone()),
                quantity: Some(1),
                ..Default::default()
            }]),
            success_url: Some(&request.success_url),
            cancel_url: Some(&request.cancel_url),
            metadata: Some(request.metadata.clone()),
            subscription_data: Some(CreateCheckoutSessionSubscriptionData {
                metadata: Some(request.metadata.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };

        let session = CheckoutSession::create(self.stripe.inner(), params).await?;
        Ok(CheckoutLink {
            session_id: session.id.to_string(),
            url: session.url,
        })
    }

    async fn create_payment_intent(&self, request: PaymentIntentRequest) -> BillingResult<PaymentIntentLink> {
        let currency = match request.currency.to_ascii_lowercase().as_str() {
            "eur" => Currency::EUR,
            "usd" => Currency::USD,
            other => return Err(BillingError::Validation(format!("Unsupported currency: {}", other))),
        };

        let mut params = CreatePaymentIntent::new(request.amount, currency);
        params.automatic_payment_methods = Some(CreatePaymentIntentAutomaticPaymentMethods {
            enabled: true,
            ..Default::default()
        });
        params.description = Some(&request.description);
        params.metadata = Some(request.metadata.clone());
        if let Some(customer_id) = &request.customer_id {
            params.customer = Some(parse_id(customer_id, "customer")?);
        }

        let intent = PaymentIntent::create(self.stripe.inner(), params).await?;
        let client_secret = intent
            .client_secret
            .ok_or_else(|| BillingError::StripeApi(format!("Payment intent {} has no client secret", intent.id)))?;

        Ok(PaymentIntentLink {
            payment_intent_id: intent.id.to_string(),
            client_secret,
        })
    }

    async fn create_portal_session(&self, customer_id: &str, return_url: &str) -> BillingResult<String> {
        let customer_id: CustomerId = parse_id(customer_id, "customer")?;

        let mut params = CreateBillingPortalSession::new(customer_id);
        params.return_url = Some(return_url);

        let session = BillingPortalSession::create(self.stripe.inner(), params).await?;
        Ok(session.url)
    }

    async fn cancel_at_period_end(&self, subscription_id: &str) -> BillingResult<()> {
        let id: SubscriptionId = parse_id(subscription_id, "subscription")?;

        let params = UpdateSubscription {
            cancel_at_period_end: Some(true),
            ..Default::default()
        };
        Subscription::update(self.stripe.inner(), &id, params).await?;
        Ok(())
    }
}
