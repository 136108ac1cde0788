//! Stripe webhook verification and routing
//!
//! The raw body is verified against the `Stripe-Signature` header before it
//! is parsed. Events are then classified once into [`PaymentEvent`], claimed
//! in the event log and dispatched to a fulfillment handler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};
use crate::fulfillment::{
    CoinPayment, FulfillmentOutcome, FulfillmentService, SubscriptionRenewal, SubscriptionStart,
};
use crate::purchase::Purchase;
use crate::store::{BillingStore, EventClaim};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "stripe-signature";

/// Hex HMAC-SHA256 of `"{timestamp}.{payload}"`
pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> BillingResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BillingError::Config(format!("Invalid webhook secret: {}", e)))?;
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a `t=...,v1=...` signature header.
///
/// Any `v1` entry may match. Timestamps older than `tolerance` are
/// rejected so captured payloads cannot be replayed later.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance: Duration,
    now: OffsetDateTime,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse().ok(),
            "v1" => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        tracing::warn!("Stripe signature header has no timestamp");
        return Err(BillingError::WebhookSignatureInvalid);
    };
    if signatures.is_empty() {
        tracing::warn!("Stripe signature header has no v1 signature");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let age = now.unix_timestamp() - timestamp;
    if age > tolerance.as_secs() as i64 {
        tracing::warn!(age_secs = age, "Stripe webhook timestamp outside tolerance");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let expected = hex::decode(compute_signature(secret, timestamp, payload)?)
        .map_err(|e| BillingError::Internal(e.to_string()))?;

    if signatures
        .iter()
        .any(|candidate| bool::from(candidate.as_slice().ct_eq(expected.as_slice())))
    {
        Ok(())
    } else {
        Err(BillingError::WebhookSignatureInvalid)
    }
}

/// Accept either a bare ID or an expanded object carrying an `id`
fn expandable_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Expandable {
        Id(String),
        Object { id: String },
    }

    Ok(Option::<Expandable>::deserialize(deserializer)?.map(|e| match e {
        Expandable::Id(id) | Expandable::Object { id } => id,
    }))
}

fn nullable_map<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<HashMap<String, String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Signed event as delivered by Stripe
#[derive(Debug, Clone, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub created: i64,
    pub data: StripeEventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

impl StripeEvent {
    pub fn created_at(&self) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(self.created).unwrap_or_else(|_| OffsetDateTime::now_utc())
    }

    fn object<T: serde::de::DeserializeOwned>(&self) -> BillingResult<T> {
        serde_json::from_value(self.data.object.clone()).map_err(|e| {
            BillingError::MalformedEvent(format!("{} payload for {}: {}", self.event_type, self.id, e))
        })
    }
}

#[derive(Debug, Deserialize)]
struct PaymentIntentObject {
    id: String,
    #[serde(default)]
    amount: i64,
    #[serde(default)]
    amount_received: i64,
    #[serde(default)]
    currency: String,
    #[serde(default, deserialize_with = "nullable_map")]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CheckoutSessionObject {
    id: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_total: Option<i64>,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default, deserialize_with = "nullable_map")]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    billing_reason: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    subscription: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    customer: Option<String>,
    #[serde(default, deserialize_with = "expandable_id")]
    payment_intent: Option<String>,
    #[serde(default)]
    amount_paid: i64,
    #[serde(default)]
    currency: String,
    #[serde(default)]
    period_end: Option<i64>,
    #[serde(default, deserialize_with = "nullable_map")]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
}

/// An event resolved into what fulfillment needs to do
#[derive(Debug, Clone)]
pub enum PaymentEvent {
    CoinPaymentSucceeded(CoinPayment),
    SubscriptionStarted(SubscriptionStart),
    SubscriptionRenewed(SubscriptionRenewal),
    PaymentFailed {
        customer_id: Option<String>,
        subscription_id: Option<String>,
    },
    SubscriptionDeleted {
        subscription_id: String,
    },
    Unhandled {
        reason: String,
    },
}

impl PaymentEvent {
    pub fn classify(event: &StripeEvent) -> BillingResult<Self> {
        let unhandled = |reason: String| Ok(Self::Unhandled { reason });

        match event.event_type.as_str() {
            "payment_intent.succeeded" => {
                let intent: PaymentIntentObject = event.object()?;
                let purchase = Purchase::from_metadata(&intent.metadata);
                if !matches!(purchase, Purchase::CoinPackage { .. }) {
                    return unhandled(format!("payment intent {} is not a coin purchase", intent.id));
                }
                let amount = if intent.amount_received > 0 {
                    intent.amount_received
                } else {
                    intent.amount
                };
                Ok(Self::CoinPaymentSucceeded(CoinPayment {
                    payment_intent_id: intent.id,
                    amount,
                    currency: intent.currency,
                    purchase,
                }))
            }
            "checkout.session.completed" => {
                let session: CheckoutSessionObject = event.object()?;
                if session.mode.as_deref() != Some("subscription") {
                    return unhandled(format!("checkout session {} is not a subscription", session.id));
                }
                let subscription_id = session.subscription.ok_or_else(|| {
                    BillingError::MalformedEvent(format!("checkout session {} has no subscription", session.id))
                })?;
                Ok(Self::SubscriptionStarted(SubscriptionStart {
                    subscription_id,
                    source_id: session.id,
                    payment_intent_id: session.payment_intent,
                    amount: session.amount_total.unwrap_or(0),
                    currency: session.currency.unwrap_or_else(|| "eur".to_string()),
                    metadata: session.metadata,
                }))
            }
            "invoice.paid" => {
                let invoice: InvoiceObject = event.object()?;
                let reason = invoice.billing_reason.as_deref().unwrap_or_default();
                if reason != "subscription_create" && reason != "subscription_cycle" {
                    return unhandled(format!("invoice {} billing reason '{}'", invoice.id, reason));
                }
                let subscription_id = invoice.subscription.ok_or_else(|| {
                    BillingError::MalformedEvent(format!("invoice {} has no subscription", invoice.id))
                })?;

                if reason == "subscription_create" {
                    Ok(Self::SubscriptionStarted(SubscriptionStart {
                        subscription_id,
                        source_id: invoice.id,
                        payment_intent_id: invoice.payment_intent,
                        amount: invoice.amount_paid,
                        currency: invoice.currency,
                        metadata: invoice.metadata,
                    }))
                } else {
                    Ok(Self::SubscriptionRenewed(SubscriptionRenewal {
                        subscription_id,
                        invoice_id: invoice.id,
                        payment_intent_id: invoice.payment_intent,
                        amount: invoice.amount_paid,
                        currency: invoice.currency,
                        period_end: invoice
                            .period_end
                            .and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok()),
                    }))
                }
            }
            "invoice.payment_failed" => {
                let invoice: InvoiceObject = event.object()?;
                Ok(Self::PaymentFailed {
                    customer_id: invoice.customer,
                    subscription_id: invoice.subscription,
                })
            }
            "customer.subscription.deleted" => {
                let subscription: SubscriptionObject = event.object()?;
                Ok(Self::SubscriptionDeleted {
                    subscription_id: subscription.id,
                })
            }
            other => unhandled(format!("event type {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed {
        event_id: String,
        outcome: FulfillmentOutcome,
    },
    /// The event already succeeded on an earlier delivery
    Duplicate { event_id: String },
    Ignored { event_id: String, reason: String },
}

#[derive(Clone)]
pub struct WebhookHandler {
    store: Arc<dyn BillingStore>,
    fulfillment: FulfillmentService,
    secret: String,
    tolerance: Duration,
}

impl WebhookHandler {
    pub fn new(
        store: Arc<dyn BillingStore>,
        fulfillment: FulfillmentService,
        secret: impl Into<String>,
        tolerance: Duration,
    ) -> Self {
        Self {
            store,
            fulfillment,
            secret: secret.into(),
            tolerance,
        }
    }

    /// Verify then parse the raw body. Nothing is written before both succeed.
    pub fn construct_event(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<StripeEvent> {
        let Some(signature) = signature else {
            tracing::warn!("Stripe webhook missing signature header");
            return Err(BillingError::WebhookSignatureInvalid);
        };
        verify_signature(payload, signature, &self.secret, self.tolerance, OffsetDateTime::now_utc())?;

        serde_json::from_slice(payload)
            .map_err(|e| BillingError::MalformedEvent(format!("Invalid event JSON: {}", e)))
    }

    pub async fn handle(&self, payload: &[u8], signature: Option<&str>) -> BillingResult<WebhookOutcome> {
        let event = self.construct_event(payload, signature)?;
        self.process(event).await
    }

    /// Classify, claim, dispatch and record the result of a verified event
    pub async fn process(&self, event: StripeEvent) -> BillingResult<WebhookOutcome> {
        tracing::info!(event_id = %event.id, event_type = %event.event_type, "Stripe webhook received");

        let classified = PaymentEvent::classify(&event).map_err(|e| {
            tracing::error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %e,
                "Webhook event could not be classified"
            );
            e
        })?;

        if let PaymentEvent::Unhandled { reason } = classified {
            tracing::info!(event_id = %event.id, event_type = %event.event_type, reason = %reason, "Ignoring webhook event");
            return Ok(WebhookOutcome::Ignored {
                event_id: event.id,
                reason,
            });
        }

        match self
            .store
            .claim_webhook_event(&event.id, &event.event_type, event.created_at())
            .await?
        {
            EventClaim::Claimed => {}
            EventClaim::Completed => {
                tracing::info!(event_id = %event.id, event_type = %event.event_type, "Duplicate webhook event, skipping");
                return Ok(WebhookOutcome::Duplicate { event_id: event.id });
            }
            // The earlier delivery may have died mid-handler. Handlers are
            // idempotent, so running them again cannot double-apply.
            EventClaim::InFlight => {
                tracing::warn!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    "Webhook event still marked processing, running handlers again"
                );
            }
        }

        let result = self.dispatch(classified).await;

        let error_message = result.as_ref().err().map(|e| e.to_string());
        if let Err(e) = self
            .store
            .finish_webhook_event(&event.id, error_message.as_deref())
            .await
        {
            tracing::error!(event_id = %event.id, error = %e, "Failed to record webhook processing result");
        }

        match result {
            Ok(outcome) => {
                tracing::info!(event_id = %event.id, event_type = %event.event_type, outcome = ?outcome, "Webhook event processed");
                Ok(WebhookOutcome::Processed {
                    event_id: event.id,
                    outcome,
                })
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    error = %e,
                    retryable = e.is_retryable(),
                    "Webhook handler error"
                );
                Err(e)
            }
        }
    }

    async fn dispatch(&self, event: PaymentEvent) -> BillingResult<FulfillmentOutcome> {
        match event {
            PaymentEvent::CoinPaymentSucceeded(payment) => self.fulfillment.fulfill_coin_purchase(payment).await,
            PaymentEvent::SubscriptionStarted(start) => self.fulfillment.fulfill_initial_subscription(start).await,
            PaymentEvent::SubscriptionRenewed(renewal) => self.fulfillment.fulfill_renewal(renewal).await,
            PaymentEvent::PaymentFailed {
                customer_id,
                subscription_id,
            } => {
                self.fulfillment
                    .handle_payment_failure(customer_id.as_deref(), subscription_id.as_deref())
                    .await
            }
            PaymentEvent::SubscriptionDeleted { subscription_id } => {
                self.fulfillment.fulfill_cancellation(&subscription_id).await
            }
            PaymentEvent::Unhandled { reason } => Ok(FulfillmentOutcome::Skipped { reason }),
        }
    }
}
