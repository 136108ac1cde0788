//! Payment initiation routes: checkout, coin payments, portal and cancellation

use axum::{extract::State, Json};
use evisit_billing::{
    BillingService, BillingStore, CheckoutResponse, CoinPackageRequest, PaymentIntentResponse, PortalResponse,
};
use evisit_shared::User;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct SubscriptionCheckoutRequest {
    #[serde(alias = "priceId")]
    pub price_id: String,
}

async fn billing_user<'a>(state: &'a AppState, auth: &AuthUser) -> ApiResult<(&'a BillingService, User)> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let user = billing
        .store
        .find_user(auth.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    Ok((billing, user))
}

/// Start a subscription checkout for a plan price
pub async fn subscription_checkout(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<SubscriptionCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let (billing, user) = billing_user(&state, &auth).await?;
    let session = billing
        .checkout
        .create_subscription_checkout(&user, &req.price_id)
        .await?;
    Ok(Json(session))
}

/// Create a payment intent for a coin package
pub async fn coin_checkout(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<CoinPackageRequest>,
) -> ApiResult<Json<PaymentIntentResponse>> {
    let (billing, user) = billing_user(&state, &auth).await?;
    let intent = billing.checkout.create_coin_payment(&user, &req).await?;
    Ok(Json(intent))
}

/// Open the Stripe billing portal
pub async fn portal(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<PortalResponse>> {
    let (billing, user) = billing_user(&state, &auth).await?;
    let session = billing.checkout.create_portal_session(&user).await?;
    Ok(Json(session))
}

/// Cancel the active subscription at the end of its period
pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<Value>> {
    let (billing, user) = billing_user(&state, &auth).await?;
    billing.checkout.cancel_subscription(&user).await?;
    Ok(Json(json!({
        "message": "Your subscription will be canceled at the end of the current billing period."
    })))
}
