//! Receipt lookup for its owner (admins may view any receipt)

use axum::{
    extract::{Path, State},
    response::Response,
    Json,
};
use evisit_billing::{BillingService, BillingStore, Receipt};

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    routes::pdf_response,
    state::AppState,
};

/// Receipts owned by someone else answer 404, not 403
async fn visible_receipt<'a>(
    state: &'a AppState,
    auth: &AuthUser,
    number: &str,
) -> ApiResult<(&'a BillingService, Receipt)> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let receipt = billing
        .store
        .find_receipt_by_number(number)
        .await?
        .ok_or(ApiError::NotFound)?;

    if receipt.user_id != auth.user_id && !auth.is_admin() {
        tracing::warn!(
            user_id = %auth.user_id,
            receipt_number = %number,
            "Receipt requested by non-owner"
        );
        return Err(ApiError::NotFound);
    }
    Ok((billing, receipt))
}

pub async fn get_receipt(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(number): Path<String>,
) -> ApiResult<Json<Receipt>> {
    let (_, receipt) = visible_receipt(&state, &auth, &number).await?;
    Ok(Json(receipt))
}

pub async fn download_receipt(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(number): Path<String>,
) -> ApiResult<Response> {
    let (billing, receipt) = visible_receipt(&state, &auth, &number).await?;
    let owner = billing
        .store
        .find_user(receipt.user_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let pdf = billing.receipts.render(&receipt, &owner).await?;
    Ok(pdf_response(&receipt.receipt_number, pdf))
}

#[cfg(test)]
mod tests {
    use axum::http::{header, StatusCode};
    use evisit_billing::receipts::ReceiptPayment;
    use evisit_billing::testing::{admin_user, sample_user};
    use evisit_billing::Purchase;
    use evisit_shared::User;

    use crate::routes::test_support::{app, authed, TestApp};

    async fn receipt_for(app: &TestApp, user: &User) -> String {
        let payment = ReceiptPayment {
            reference: format!("pi_{}", user.id.simple()),
            amount: 999,
            currency: "eur".into(),
            purchase: Purchase::CoinPackage {
                user_id: Some(user.id),
                coins: 100,
            },
        };
        let recorded = app
            .state
            .billing
            .as_ref()
            .unwrap()
            .receipts
            .record(&payment, user)
            .await
            .unwrap();
        recorded.receipt.receipt_number
    }

    #[tokio::test]
    async fn test_owner_can_view_receipt() {
        let app = app();
        let user = app.store.insert_user(sample_user());
        let number = receipt_for(&app, &user).await;
        let token = app.token_for(&user);

        let (status, body) = app
            .send_json(authed("GET", &format!("/api/v1/receipts/{}", number), &token, None))
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["receipt_number"], number.as_str());
        assert_eq!(body["item_description"], "100 E-Tokens Package");
        assert_eq!(body["amount"], 999);
    }

    #[tokio::test]
    async fn test_other_users_receipt_is_hidden() {
        let app = app();
        let owner = app.store.insert_user(sample_user());
        let stranger = app.store.insert_user(sample_user());
        let number = receipt_for(&app, &owner).await;

        let (status, _) = app
            .send_json(authed(
                "GET",
                &format!("/api/v1/receipts/{}", number),
                &app.token_for(&stranger),
                None,
            ))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_admin_downloads_any_receipt_pdf() {
        let app = app();
        let owner = app.store.insert_user(sample_user());
        let admin = app.store.insert_user(admin_user());
        let number = receipt_for(&app, &owner).await;

        let response = {
            use tower::ServiceExt;
            app.router
                .clone()
                .oneshot(authed(
                    "GET",
                    &format!("/api/v1/receipts/{}/pdf", number),
                    &app.token_for(&admin),
                    None,
                ))
                .await
                .unwrap()
        };

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/pdf");
        assert!(response.headers()[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .contains(&number));
    }

    #[tokio::test]
    async fn test_unknown_receipt_is_not_found() {
        let app = app();
        let user = app.store.insert_user(sample_user());

        let (status, _) = app
            .send_json(authed("GET", "/api/v1/receipts/INV-2026-9999", &app.token_for(&user), None))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
