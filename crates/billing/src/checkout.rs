//! Payment initiation: checkout, coin payments, portal and cancellation

use std::collections::HashMap;
use std::sync::Arc;

use evisit_shared::{LicenseStatus, User};
use serde::{Deserialize, Serialize};

use crate::client::PlanPrice;
use crate::error::{BillingError, BillingResult};
use crate::gateway::{PaymentGateway, PaymentIntentRequest, SubscriptionCheckoutRequest};
use crate::purchase::{
    COINS_KEY, PLAN_TYPE_KEY, PURCHASE_TYPE_COINS, PURCHASE_TYPE_KEY, PURCHASE_TYPE_SUBSCRIPTION, USER_ID_KEY,
};
use crate::store::BillingStore;

pub const COIN_CURRENCY: &str = "eur";

/// Coin package chosen on the client
#[derive(Debug, Clone, Deserialize)]
pub struct CoinPackageRequest {
    pub name: String,
    /// Price in cents
    pub unit_amount: i64,
    pub coins_to_add: i64,
}

/// Response for creating a checkout session
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntentResponse {
    pub client_secret: String,
}

/// Response for creating a portal session
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PortalResponse {
    pub url: String,
}

#[derive(Clone)]
pub struct CheckoutService {
    store: Arc<dyn BillingStore>,
    gateway: Arc<dyn PaymentGateway>,
    plans: Vec<PlanPrice>,
    frontend_url: String,
}

impl CheckoutService {
    pub fn new(
        store: Arc<dyn BillingStore>,
        gateway: Arc<dyn PaymentGateway>,
        plans: Vec<PlanPrice>,
        frontend_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            plans,
            frontend_url: frontend_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Existing customer reference, or a new Stripe customer stored on the user
    pub async fn get_or_create_customer(&self, user: &User) -> BillingResult<String> {
        if let Some(customer_id) = &user.stripe_customer_id {
            return Ok(customer_id.clone());
        }

        let customer_id = self
            .gateway
            .create_customer(&user.id.to_string(), &user.email, &user.full_name())
            .await?;
        self.store.attach_customer(user.id, &customer_id).await?;

        tracing::info!(
            user_id = %user.id,
            customer_id = %customer_id,
            "Created Stripe customer"
        );
        Ok(customer_id)
    }

    /// Hosted checkout for a license plan. The plan and its coin bonus ride
    /// along as subscription metadata so fulfillment can resolve them.
    pub async fn create_subscription_checkout(&self, user: &User, price_id: &str) -> BillingResult<CheckoutResponse> {
        let plan = self
            .plans
            .iter()
            .find(|p| p.price_id == price_id)
            .ok_or_else(|| BillingError::Validation("Invalid subscription plan selected.".into()))?;

        let customer_id = self.get_or_create_customer(user).await?;

        let mut metadata = HashMap::new();
        metadata.insert(USER_ID_KEY.to_string(), user.id.to_string());
        metadata.insert(PURCHASE_TYPE_KEY.to_string(), PURCHASE_TYPE_SUBSCRIPTION.to_string());
        metadata.insert(PLAN_TYPE_KEY.to_string(), plan.plan.to_string());
        metadata.insert(COINS_KEY.to_string(), plan.bonus_coins.to_string());

        let link = self
            .gateway
            .create_subscription_checkout(SubscriptionCheckoutRequest {
                customer_id,
                price_id: plan.price_id.clone(),
                metadata,
                success_url: format!(
                    "{}/dashboard/purchases?session_id={{CHECKOUT_SESSION_ID}}",
                    self.frontend_url
                ),
                cancel_url: format!("{}/dashboard/billing", self.frontend_url),
            })
            .await?;

        tracing::info!(
            user_id = %user.id,
            session_id = %link.session_id,
            plan = %plan.plan,
            "Created checkout session"
        );

        Ok(CheckoutResponse {
            session_id: link.session_id,
            url: link.url,
        })
    }

    /// Payment intent for a coin package, confirmed client side
    pub async fn create_coin_payment(
        &self,
        user: &User,
        package: &CoinPackageRequest,
    ) -> BillingResult<PaymentIntentResponse> {
        if package.name.trim().is_empty() || package.unit_amount <= 0 || package.coins_to_add <= 0 {
            return Err(BillingError::Validation("Missing payment information.".into()));
        }

        let mut metadata = HashMap::new();
        metadata.insert(PURCHASE_TYPE_KEY.to_string(), PURCHASE_TYPE_COINS.to_string());
        metadata.insert(USER_ID_KEY.to_string(), user.id.to_string());
        metadata.insert(COINS_KEY.to_string(), package.coins_to_add.to_string());

        let link = self
            .gateway
            .create_payment_intent(PaymentIntentRequest {
                customer_id: user.stripe_customer_id.clone(),
                amount: package.unit_amount,
                currency: COIN_CURRENCY.to_string(),
                description: format!("Purchase of {}", package.name.trim()),
                metadata,
            })
            .await?;

        tracing::info!(
            user_id = %user.id,
            payment_intent_id = %link.payment_intent_id,
            coins = package.coins_to_add,
            "Created coin payment intent"
        );

        Ok(PaymentIntentResponse {
            client_secret: link.client_secret,
        })
    }

    pub async fn create_portal_session(&self, user: &User) -> BillingResult<PortalResponse> {
        let customer_id = user
            .stripe_customer_id
            .as_deref()
            .ok_or_else(|| BillingError::Validation("User is not a Stripe customer.".into()))?;

        let return_url = format!("{}/dashboard/purchases", self.frontend_url);
        let url = self.gateway.create_portal_session(customer_id, &return_url).await?;

        tracing::info!(user_id = %user.id, customer_id = %customer_id, "Created billing portal session");
        Ok(PortalResponse { url })
    }

    /// Cancel the active subscription at period end and mark the license
    /// canceled right away
    pub async fn cancel_subscription(&self, user: &User) -> BillingResult<()> {
        let subscription_id = self
            .store
            .latest_active_license(user.id)
            .await?
            .and_then(|license| license.stripe_subscription_id)
            .ok_or_else(|| BillingError::NotFound("No active subscription found to cancel.".into()))?;

        self.gateway.cancel_at_period_end(&subscription_id).await?;
        self.store
            .set_license_status(&subscription_id, LicenseStatus::Canceled)
            .await?;

        tracing::info!(
            user_id = %user.id,
            subscription_id = %subscription_id,
            "Subscription scheduled for cancellation"
        );
        Ok(())
    }
}
