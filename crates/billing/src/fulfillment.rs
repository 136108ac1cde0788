//! Fulfillment handlers
//!
//! Each handler is safe to run again for the same payment: coins are gated
//! by the credit ledger, licenses by their subscription reference and
//! receipts by their payment reference. Handlers look up current state
//! instead of assuming an earlier event was processed.

use std::collections::HashMap;
use std::sync::Arc;

use evisit_shared::{License, LicenseStatus, User};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::PlanPrice;
use crate::delivery::{DeliveryJob, DeliveryQueue};
use crate::error::{BillingError, BillingResult};
use crate::gateway::PaymentGateway;
use crate::purchase::Purchase;
use crate::receipts::{ReceiptIssuer, ReceiptPayment};
use crate::store::{BillingStore, LicenseActivation, NewLicense};

/// Payment intent for a coin package
#[derive(Debug, Clone)]
pub struct CoinPayment {
    pub payment_intent_id: String,
    pub amount: i64,
    pub currency: String,
    pub purchase: Purchase,
}

/// First payment of a subscription, from a completed checkout session or a
/// `subscription_create` invoice
#[derive(Debug, Clone)]
pub struct SubscriptionStart {
    pub subscription_id: String,
    /// Checkout session or invoice that carried the event
    pub source_id: String,
    pub payment_intent_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    /// Metadata on the session or invoice, used when the subscription has none
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRenewal {
    pub subscription_id: String,
    pub invoice_id: String,
    pub payment_intent_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    /// Period end printed on the invoice, used only if the subscription
    /// lookup has none
    pub period_end: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FulfillmentOutcome {
    CoinsCredited { user_id: Uuid, coins: i64 },
    /// The payment was already credited by an earlier delivery
    AlreadyCredited { user_id: Uuid },
    LicenseActivated { user_id: Uuid, license_id: Uuid },
    /// A license for the subscription already exists
    AlreadyFulfilled { license_id: Uuid },
    Renewed { license_id: Uuid },
    Canceled { license_id: Uuid },
    MarkedPastDue { license_id: Uuid },
    Skipped { reason: String },
}

#[derive(Clone)]
pub struct FulfillmentService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    receipts: ReceiptIssuer,
    delivery: DeliveryQueue,
    plans: Vec<PlanPrice>,
}

impl FulfillmentService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        receipts: ReceiptIssuer,
        delivery: DeliveryQueue,
        plans: Vec<PlanPrice>,
    ) -> Self {
        Self {
            store,
            gateway,
            receipts,
            delivery,
            plans,
        }
    }

    /// Credit coins once for a payment reference. A missing user ID or a
    /// non-positive amount is rejected before anything is written.
    pub async fn add_coins(&self, user_id: Option<Uuid>, coins: i64, payment_reference: &str) -> BillingResult<bool> {
        let user_id = match user_id {
            Some(id) if coins > 0 => id,
            _ => {
                return Err(BillingError::Validation(format!(
                    "Invalid data for coin fulfillment: user_id={:?}, coins={}",
                    user_id, coins
                )))
            }
        };

        let credited = self.store.credit_coins(user_id, coins, payment_reference).await?;
        if credited {
            tracing::info!(
                user_id = %user_id,
                coins,
                payment_reference = %payment_reference,
                "Added E-Tokens to user"
            );
        }
        Ok(credited)
    }

    /// `payment_intent.succeeded` for a coin package
    pub async fn fulfill_coin_purchase(&self, payment: CoinPayment) -> BillingResult<FulfillmentOutcome> {
        let Purchase::CoinPackage { user_id, coins } = payment.purchase else {
            return Ok(FulfillmentOutcome::Skipped {
                reason: format!("payment intent {} is not a coin purchase", payment.payment_intent_id),
            });
        };

        let user = self.require_user(user_id, &payment.payment_intent_id).await?;
        let credited = self.add_coins(Some(user.id), coins, &payment.payment_intent_id).await?;

        // The ledger makes a retry safe, so a failed receipt write is
        // surfaced and the event redelivered.
        self.record_and_enqueue(
            &ReceiptPayment {
                reference: payment.payment_intent_id.clone(),
                amount: payment.amount,
                currency: payment.currency,
                purchase: payment.purchase,
            },
            &user,
        )
        .await?;

        Ok(if credited {
            FulfillmentOutcome::CoinsCredited {
                user_id: user.id,
                coins,
            }
        } else {
            tracing::info!(
                user_id = %user.id,
                payment_intent_id = %payment.payment_intent_id,
                "Coin purchase already fulfilled"
            );
            FulfillmentOutcome::AlreadyCredited { user_id: user.id }
        })
    }

    /// Create the license for a new subscription, with its coin bonus
    pub async fn fulfill_initial_subscription(&self, start: SubscriptionStart) -> BillingResult<FulfillmentOutcome> {
        let subscription = self.gateway.retrieve_subscription(&start.subscription_id).await?;

        let (user_id, plan, bonus_coins) = self.resolve_license_purchase(
            &subscription.metadata,
            &start.metadata,
            subscription.price_id.as_deref(),
        );

        let user_id = match user_id {
            Some(id) if !subscription.customer_id.is_empty() => id,
            _ => {
                tracing::error!(
                    subscription_id = %start.subscription_id,
                    source_id = %start.source_id,
                    "Missing user or customer for initial subscription fulfillment"
                );
                return Err(BillingError::MalformedEvent(format!(
                    "Missing crucial data for initial subscription fulfillment of {}",
                    start.subscription_id
                )));
            }
        };

        let Some(plan) = plan else {
            return Err(BillingError::MalformedEvent(format!(
                "No plan type for subscription {}",
                start.subscription_id
            )));
        };

        let user = self
            .store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("user {}", user_id)))?;

        if let Some(existing) = self
            .store
            .find_license_by_subscription(&subscription.id)
            .await?
        {
            tracing::info!(
                subscription_id = %subscription.id,
                license_id = %existing.id,
                "License for subscription already exists, skipping"
            );
            return Ok(FulfillmentOutcome::AlreadyFulfilled {
                license_id: existing.id,
            });
        }

        let activation = self
            .store
            .activate_license(NewLicense {
                user_id,
                stripe_subscription_id: Some(subscription.id.clone()),
                customer_id: Some(subscription.customer_id.clone()),
                plan,
                current_period_end: subscription.current_period_end,
                stripe_session_id: Some(start.source_id.clone()),
                bonus_coins,
            })
            .await?;

        let license = match activation {
            LicenseActivation::Created(license) => license,
            LicenseActivation::AlreadyExists(license) => {
                tracing::info!(
                    subscription_id = %subscription.id,
                    license_id = %license.id,
                    "License created concurrently by another delivery"
                );
                return Ok(FulfillmentOutcome::AlreadyFulfilled {
                    license_id: license.id,
                });
            }
        };

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan = %plan,
            bonus_coins,
            "Initial license created"
        );

        let purchase = Purchase::License {
            user_id: Some(user_id),
            plan: Some(plan),
            bonus_coins,
        };
        self.best_effort_receipt(
            start.payment_intent_id.as_deref(),
            &start.source_id,
            start.amount,
            &start.currency,
            purchase,
            &user,
        )
        .await;

        Ok(FulfillmentOutcome::LicenseActivated {
            user_id,
            license_id: license.id,
        })
    }

    /// `invoice.paid` for a billing cycle. An unknown subscription is fatal.
    pub async fn fulfill_renewal(&self, renewal: SubscriptionRenewal) -> BillingResult<FulfillmentOutcome> {
        let Some(license) = self
            .store
            .find_license_by_subscription(&renewal.subscription_id)
            .await?
        else {
            tracing::error!(
                subscription_id = %renewal.subscription_id,
                invoice_id = %renewal.invoice_id,
                "Received renewal for unknown subscription"
            );
            return Err(BillingError::UnknownSubscription(renewal.subscription_id));
        };

        let subscription = self.gateway.retrieve_subscription(&renewal.subscription_id).await?;
        let period_end = subscription.current_period_end.or(renewal.period_end);

        let renewed = self
            .store
            .renew_license(&renewal.subscription_id, period_end)
            .await?
            .unwrap_or(license);

        tracing::info!(
            user_id = %renewed.user_id,
            subscription_id = %renewal.subscription_id,
            "Subscription renewed"
        );

        match self.store.find_user(renewed.user_id).await {
            Ok(Some(user)) => {
                let purchase = Purchase::License {
                    user_id: Some(user.id),
                    plan: Some(renewed.plan_type),
                    bonus_coins: 0,
                };
                self.best_effort_receipt(
                    renewal.payment_intent_id.as_deref(),
                    &renewal.invoice_id,
                    renewal.amount,
                    &renewal.currency,
                    purchase,
                    &user,
                )
                .await;
            }
            Ok(None) => tracing::warn!(
                user_id = %renewed.user_id,
                "Renewed license has no user - no receipt issued"
            ),
            Err(e) => tracing::error!(
                user_id = %renewed.user_id,
                error = %e,
                "Failed to load user for renewal receipt - non-fatal"
            ),
        }

        Ok(FulfillmentOutcome::Renewed {
            license_id: renewed.id,
        })
    }

    /// `customer.subscription.deleted`. An unknown subscription is not an error.
    pub async fn fulfill_cancellation(&self, subscription_id: &str) -> BillingResult<FulfillmentOutcome> {
        match self
            .store
            .set_license_status(subscription_id, LicenseStatus::Canceled)
            .await?
        {
            Some(license) => {
                tracing::info!(
                    user_id = %license.user_id,
                    subscription_id = %subscription_id,
                    "Subscription marked as canceled"
                );
                Ok(FulfillmentOutcome::Canceled {
                    license_id: license.id,
                })
            }
            None => {
                tracing::warn!(
                    subscription_id = %subscription_id,
                    "Received cancellation for unknown subscription"
                );
                Ok(FulfillmentOutcome::Skipped {
                    reason: format!("no license for subscription {}", subscription_id),
                })
            }
        }
    }

    /// `invoice.payment_failed`. Skipped silently when the customer is unknown.
    pub async fn handle_payment_failure(
        &self,
        customer_id: Option<&str>,
        subscription_id: Option<&str>,
    ) -> BillingResult<FulfillmentOutcome> {
        let user = match customer_id {
            Some(customer_id) => self.store.find_user_by_customer(customer_id).await?,
            None => None,
        };
        let Some(user) = user else {
            tracing::info!(customer_id = ?customer_id, "Payment failed for unknown customer, skipping");
            return Ok(FulfillmentOutcome::Skipped {
                reason: "unknown customer".into(),
            });
        };

        let license: Option<License> = match subscription_id {
            Some(sub) => self.store.set_license_status(sub, LicenseStatus::PastDue).await?,
            None => None,
        };

        match license {
            Some(license) => {
                tracing::warn!(
                    user_id = %user.id,
                    email = %user.email,
                    subscription_id = ?subscription_id,
                    "Payment failed, license set to past_due"
                );
                Ok(FulfillmentOutcome::MarkedPastDue {
                    license_id: license.id,
                })
            }
            None => {
                tracing::info!(
                    user_id = %user.id,
                    subscription_id = ?subscription_id,
                    "Payment failed but no license matches the subscription"
                );
                Ok(FulfillmentOutcome::Skipped {
                    reason: "no license for subscription".into(),
                })
            }
        }
    }

    async fn require_user(&self, user_id: Option<Uuid>, reference: &str) -> BillingResult<User> {
        let Some(user_id) = user_id else {
            return Err(BillingError::Validation(format!(
                "No user ID in metadata for {}",
                reference
            )));
        };
        self.store
            .find_user(user_id)
            .await?
            .ok_or_else(|| BillingError::NotFound(format!("User not found for {}", reference)))
    }

    /// Subscription metadata wins; the event's own metadata and the price
    /// catalog fill the gaps.
    fn resolve_license_purchase(
        &self,
        subscription_metadata: &HashMap<String, String>,
        event_metadata: &HashMap<String, String>,
        price_id: Option<&str>,
    ) -> (Option<Uuid>, Option<evisit_shared::PlanType>, i64) {
        let from_subscription = Purchase::from_metadata(subscription_metadata);
        let from_event = Purchase::from_metadata(event_metadata);
        let catalog = price_id.and_then(|id| self.plans.iter().find(|p| p.price_id == id));

        let (mut user_id, mut plan, mut bonus) = match from_subscription {
            Purchase::License {
                user_id,
                plan,
                bonus_coins,
            } => (user_id, plan, Some(bonus_coins)),
            other => (other.user_id(), None, None),
        };

        if let Purchase::License {
            user_id: event_user,
            plan: event_plan,
            bonus_coins,
        } = from_event
        {
            user_id = user_id.or(event_user);
            plan = plan.or(event_plan);
            bonus = bonus.or(Some(bonus_coins));
        }

        if let Some(entry) = catalog {
            plan = plan.or(Some(entry.plan));
            bonus = bonus.or(Some(entry.bonus_coins));
        }

        (user_id, plan, bonus.unwrap_or(0).max(0))
    }

    async fn record_and_enqueue(&self, payment: &ReceiptPayment, user: &User) -> BillingResult<()> {
        let recorded = self.receipts.record(payment, user).await?;
        if recorded.created {
            self.delivery.enqueue(DeliveryJob::Receipt {
                receipt_id: recorded.receipt.id,
            });
        }
        Ok(())
    }

    /// Receipt for a license payment. The license is already committed, so
    /// any failure here is logged and swallowed.
    async fn best_effort_receipt(
        &self,
        payment_intent_id: Option<&str>,
        fallback_reference: &str,
        fallback_amount: i64,
        fallback_currency: &str,
        purchase: Purchase,
        user: &User,
    ) {
        let payment = match payment_intent_id {
            Some(pi) => match self.gateway.retrieve_payment_intent(pi).await {
                Ok(intent) => ReceiptPayment {
                    reference: intent.id,
                    amount: intent.amount,
                    currency: intent.currency,
                    purchase,
                },
                Err(e) => {
                    tracing::warn!(
                        payment_intent_id = %pi,
                        error = %e,
                        "Payment intent lookup failed, using event totals for receipt"
                    );
                    ReceiptPayment {
                        reference: pi.to_string(),
                        amount: fallback_amount,
                        currency: fallback_currency.to_string(),
                        purchase,
                    }
                }
            },
            None => ReceiptPayment {
                reference: fallback_reference.to_string(),
                amount: fallback_amount,
                currency: fallback_currency.to_string(),
                purchase,
            },
        };

        if let Err(e) = self.record_and_enqueue(&payment, user).await {
            tracing::error!(
                user_id = %user.id,
                payment_reference = %payment.reference,
                error = %e,
                "Fulfillment succeeded but receipt could not be issued - non-fatal"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{PaymentIntentSnapshot, SubscriptionSnapshot};
    use crate::store::InMemoryBillingStore;
    use crate::testing::{company, sample_user, templates, FakeGateway, StaticRenderer};
    use evisit_shared::PlanType;
    use tokio::sync::mpsc;

    struct Harness {
        store: Arc<InMemoryBillingStore>,
        service: FulfillmentService,
        jobs: mpsc::Receiver<DeliveryJob>,
    }

    fn harness(gateway: FakeGateway) -> Harness {
        let store = Arc::new(InMemoryBillingStore::new());
        let issuer = ReceiptIssuer::new(
            store.clone(),
            Arc::new(StaticRenderer::ok()),
            Arc::new(templates()),
            company(),
        );
        let (queue, jobs) = DeliveryQueue::channel(16);
        let plans = vec![PlanPrice {
            price_id: "price_yearly".into(),
            plan: PlanType::Yearly,
            bonus_coins: 25,
        }];
        let service = FulfillmentService::new(store.clone(), Arc::new(gateway), issuer, queue, plans);
        Harness {
            store,
            service,
            jobs,
        }
    }

    fn subscription(id: &str, metadata: Purchase) -> SubscriptionSnapshot {
        SubscriptionSnapshot {
            id: id.into(),
            customer_id: "cus_1".into(),
            current_period_end: OffsetDateTime::from_unix_timestamp(1_800_000_000).ok(),
            price_id: Some("price_yearly".into()),
            metadata: metadata.to_metadata(),
        }
    }

    fn start(sub: &str) -> SubscriptionStart {
        SubscriptionStart {
            subscription_id: sub.into(),
            source_id: "cs_1".into(),
            payment_intent_id: None,
            amount: 4999,
            currency: "eur".into(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_add_coins_rejects_bad_input() {
        let h = harness(FakeGateway::new());
        let user = h.store.insert_user(sample_user());

        for (user_id, coins) in [(None, 10), (Some(user.id), 0), (Some(user.id), -5)] {
            let err = h.service.add_coins(user_id, coins, "pi_x").await.unwrap_err();
            assert!(matches!(err, BillingError::Validation(_)));
        }
        assert_eq!(h.store.user(user.id).unwrap().coin_balance, 0);
    }

    #[tokio::test]
    async fn test_coin_purchase_credits_once_and_enqueues_one_receipt() {
        let mut h = harness(FakeGateway::new());
        let user = h.store.insert_user(sample_user());
        let payment = CoinPayment {
            payment_intent_id: "pi_coins".into(),
            amount: 999,
            currency: "eur".into(),
            purchase: Purchase::CoinPackage {
                user_id: Some(user.id),
                coins: 50,
            },
        };

        let first = h.service.fulfill_coin_purchase(payment.clone()).await.unwrap();
        let second = h.service.fulfill_coin_purchase(payment).await.unwrap();

        assert_eq!(
            first,
            FulfillmentOutcome::CoinsCredited {
                user_id: user.id,
                coins: 50
            }
        );
        assert_eq!(second, FulfillmentOutcome::AlreadyCredited { user_id: user.id });
        assert_eq!(h.store.user(user.id).unwrap().coin_balance, 50);
        assert_eq!(h.store.receipt_count(), 1);
        assert!(h.jobs.try_recv().is_ok());
        assert!(h.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_coin_purchase_for_unknown_user_fails() {
        let h = harness(FakeGateway::new());
        let payment = CoinPayment {
            payment_intent_id: "pi_coins".into(),
            amount: 999,
            currency: "eur".into(),
            purchase: Purchase::CoinPackage {
                user_id: Some(Uuid::new_v4()),
                coins: 50,
            },
        };
        let err = h.service.fulfill_coin_purchase(payment).await.unwrap_err();
        assert!(matches!(err, BillingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_replayed_initial_subscription_creates_one_license() {
        let user = sample_user();
        let purchase = Purchase::License {
            user_id: Some(user.id),
            plan: Some(PlanType::Yearly),
            bonus_coins: 25,
        };
        let gateway = FakeGateway::new().with_subscription(subscription("sub_1", purchase));
        let h = harness(gateway);
        h.store.insert_user(user.clone());

        let first = h.service.fulfill_initial_subscription(start("sub_1")).await.unwrap();
        let second = h.service.fulfill_initial_subscription(start("sub_1")).await.unwrap();

        let licenses = h.store.licenses_for(user.id);
        assert_eq!(licenses.len(), 1);
        assert!(matches!(first, FulfillmentOutcome::LicenseActivated { .. }));
        assert_eq!(
            second,
            FulfillmentOutcome::AlreadyFulfilled {
                license_id: licenses[0].id
            }
        );

        let stored = h.store.user(user.id).unwrap();
        assert_eq!(stored.coin_balance, 25);
        assert_eq!(stored.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(licenses[0].plan_type, PlanType::Yearly);
        assert_eq!(licenses[0].current_period_end.map(|t| t.unix_timestamp()), Some(1_800_000_000));
        assert_eq!(h.store.receipt_count(), 1);
    }

    #[tokio::test]
    async fn test_new_license_supersedes_previous_active_one() {
        let user = sample_user();
        let purchase = Purchase::License {
            user_id: Some(user.id),
            plan: Some(PlanType::Monthly),
            bonus_coins: 0,
        };
        let gateway = FakeGateway::new()
            .with_subscription(subscription("sub_old", purchase.clone()))
            .with_subscription(subscription("sub_new", purchase));
        let h = harness(gateway);
        h.store.insert_user(user.clone());

        h.service.fulfill_initial_subscription(start("sub_old")).await.unwrap();
        h.service.fulfill_initial_subscription(start("sub_new")).await.unwrap();

        let active: Vec<_> = h
            .store
            .licenses_for(user.id)
            .into_iter()
            .filter(|l| l.is_active())
            .collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].stripe_subscription_id.as_deref(), Some("sub_new"));
    }

    #[tokio::test]
    async fn test_plan_falls_back_to_price_catalog() {
        let user = sample_user();
        let mut snapshot = subscription("sub_1", Purchase::Unknown);
        snapshot
            .metadata
            .insert("userId".into(), user.id.to_string());
        let h = harness(FakeGateway::new().with_subscription(snapshot));
        h.store.insert_user(user.clone());

        h.service.fulfill_initial_subscription(start("sub_1")).await.unwrap();

        let licenses = h.store.licenses_for(user.id);
        assert_eq!(licenses[0].plan_type, PlanType::Yearly);
        assert_eq!(h.store.user(user.id).unwrap().coin_balance, 25);
    }

    #[tokio::test]
    async fn test_initial_subscription_without_user_is_rejected() {
        let snapshot = subscription("sub_1", Purchase::Unknown);
        let h = harness(FakeGateway::new().with_subscription(snapshot));

        let err = h
            .service
            .fulfill_initial_subscription(start("sub_1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::MalformedEvent(_)));
    }

    #[tokio::test]
    async fn test_receipt_failure_does_not_undo_license() {
        let user = sample_user();
        let purchase = Purchase::License {
            user_id: Some(user.id),
            plan: Some(PlanType::Yearly),
            bonus_coins: 0,
        };
        let h = harness(FakeGateway::new().with_subscription(subscription("sub_1", purchase)));
        h.store.insert_user(user.clone());

        // A negative amount cannot be recorded as a receipt
        let mut event = start("sub_1");
        event.amount = -1;
        let outcome = h.service.fulfill_initial_subscription(event).await.unwrap();

        assert!(matches!(outcome, FulfillmentOutcome::LicenseActivated { .. }));
        assert_eq!(h.store.receipt_count(), 0);
        assert_eq!(h.store.licenses_for(user.id).len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_for_unknown_subscription_is_fatal() {
        let h = harness(FakeGateway::new());
        let err = h
            .service
            .fulfill_renewal(SubscriptionRenewal {
                subscription_id: "sub_missing".into(),
                invoice_id: "in_1".into(),
                payment_intent_id: None,
                amount: 100,
                currency: "eur".into(),
                period_end: None,
            })
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::UnknownSubscription(_)));
        assert!(!err.is_retryable());
        assert!(h.store.licenses_for(Uuid::new_v4()).is_empty());
    }

    #[tokio::test]
    async fn test_renewal_reactivates_and_advances_period() {
        let user = sample_user();
        let purchase = Purchase::License {
            user_id: Some(user.id),
            plan: Some(PlanType::Monthly),
            bonus_coins: 0,
        };
        let mut snapshot = subscription("sub_1", purchase);
        let h = harness(FakeGateway::new().with_subscription(snapshot.clone()));
        h.store.insert_user(user.clone());
        h.service.fulfill_initial_subscription(start("sub_1")).await.unwrap();
        h.store
            .set_license_status("sub_1", LicenseStatus::PastDue)
            .await
            .unwrap();

        snapshot.current_period_end = OffsetDateTime::from_unix_timestamp(1_900_000_000).ok();
        let pi = PaymentIntentSnapshot {
            id: "pi_renew".into(),
            amount: 999,
            currency: "eur".into(),
            customer_id: Some("cus_1".into()),
            metadata: HashMap::new(),
        };
        let gateway = FakeGateway::new().with_subscription(snapshot).with_payment_intent(pi);
        let service = FulfillmentService {
            gateway: Arc::new(gateway),
            ..h.service.clone()
        };

        let outcome = service
            .fulfill_renewal(SubscriptionRenewal {
                subscription_id: "sub_1".into(),
                invoice_id: "in_2".into(),
                payment_intent_id: Some("pi_renew".into()),
                amount: 0,
                currency: "eur".into(),
                period_end: None,
            })
            .await
            .unwrap();

        assert!(matches!(outcome, FulfillmentOutcome::Renewed { .. }));
        let license = &h.store.licenses_for(user.id)[0];
        assert_eq!(license.subscription_status, LicenseStatus::Active);
        assert_eq!(license.current_period_end.map(|t| t.unix_timestamp()), Some(1_900_000_000));

        let receipts = h.store.receipts_for(user.id);
        assert_eq!(receipts.len(), 2);
        assert!(receipts.iter().any(|r| r.stripe_payment_intent_id == "pi_renew" && r.amount == 999));
    }

    #[tokio::test]
    async fn test_cancellation_of_unknown_subscription_is_not_an_error() {
        let h = harness(FakeGateway::new());
        let outcome = h.service.fulfill_cancellation("sub_gone").await.unwrap();
        assert!(matches!(outcome, FulfillmentOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_payment_failure_marks_known_customer_past_due() {
        let user = sample_user();
        let purchase = Purchase::License {
            user_id: Some(user.id),
            plan: Some(PlanType::Monthly),
            bonus_coins: 0,
        };
        let h = harness(FakeGateway::new().with_subscription(subscription("sub_1", purchase)));
        h.store.insert_user(user.clone());
        h.service.fulfill_initial_subscription(start("sub_1")).await.unwrap();

        let outcome = h
            .service
            .handle_payment_failure(Some("cus_1"), Some("sub_1"))
            .await
            .unwrap();
        assert!(matches!(outcome, FulfillmentOutcome::MarkedPastDue { .. }));
        assert_eq!(
            h.store.licenses_for(user.id)[0].subscription_status,
            LicenseStatus::PastDue
        );
    }

    #[tokio::test]
    async fn test_payment_failure_for_unknown_customer_is_skipped() {
        let h = harness(FakeGateway::new());
        let outcome = h
            .service
            .handle_payment_failure(Some("cus_unknown"), Some("sub_1"))
            .await
            .unwrap();
        assert!(matches!(outcome, FulfillmentOutcome::Skipped { .. }));
    }
}
