//! Stripe webhook endpoint

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    Json,
};
use evisit_billing::{webhooks::SIGNATURE_HEADER, WebhookOutcome};
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Handle Stripe webhook events.
///
/// The body is taken as raw bytes: the signature covers the exact payload.
/// Only an unverifiable request answers 400. Once the event is verified,
/// every failure answers 500 so Stripe redelivers it.
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    tracing::info!(body_len = body.len(), "Stripe webhook received");

    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;

    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    let event = billing
        .webhooks
        .construct_event(&body, signature)
        .map_err(|e| {
            tracing::warn!(error = %e, "Stripe webhook rejected");
            ApiError::from(e)
        })?;

    let outcome = billing.webhooks.process(event).await.map_err(|e| {
        tracing::error!(error = %e, retryable = e.is_retryable(), "Webhook handling error");
        ApiError::WebhookFailed
    })?;

    match &outcome {
        WebhookOutcome::Processed { event_id, outcome } => {
            tracing::info!(event_id = %event_id, outcome = ?outcome, "Stripe webhook processed successfully");
        }
        WebhookOutcome::Duplicate { event_id } => {
            tracing::info!(event_id = %event_id, "Stripe webhook already handled");
        }
        WebhookOutcome::Ignored { event_id, reason } => {
            tracing::info!(event_id = %event_id, reason = %reason, "Stripe webhook ignored");
        }
    }

    Ok(Json(json!({ "received": true })))
}
