//! API routes

mod billing;
mod documents;
mod health;
mod license;
mod payments;
mod receipts;

use axum::{
    extract::DefaultBodyLimit,
    http::header,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Extension, Router,
};
use evisit_billing::DocumentKind;

use crate::state::AppState;

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // Health check routes (no auth required)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let mut api_v1_routes = Router::new();

    if state.config.enable_billing {
        api_v1_routes = api_v1_routes
            // Stripe webhook (signature checked in the handler)
            .route("/billing/webhook", post(billing::webhook))
            // Payment initiation
            .route("/payments/subscription-checkout", post(payments::subscription_checkout))
            .route("/payments/coin-checkout", post(payments::coin_checkout))
            .route("/payments/portal", post(payments::portal))
            .route("/payments/cancel-subscription", post(payments::cancel_subscription))
            .route("/license/status", get(license::status))
            // Receipts
            .route("/receipts/:number", get(receipts::get_receipt))
            .route("/receipts/:number/pdf", get(receipts::download_receipt))
            // Admin documents
            .nest("/invoices", document_routes(DocumentKind::Invoice))
            .nest("/offers", document_routes(DocumentKind::Offer));
    }

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_v1_routes)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .with_state(state)
}

/// Invoices and offers share handlers; the kind travels as an extension
fn document_routes(kind: DocumentKind) -> Router<AppState> {
    Router::new()
        .route("/", get(documents::list).post(documents::create))
        .route(
            "/:id",
            get(documents::get)
                .put(documents::update)
                .delete(documents::delete),
        )
        .route("/:id/status", patch(documents::update_status))
        .route("/:id/send", post(documents::send))
        .route("/:id/pdf", get(documents::download))
        .layer(Extension(kind))
}

/// PDF body served as a download
pub(crate) fn pdf_response(filename: &str, pdf: Vec<u8>) -> Response {
    (
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.pdf\"", filename),
            ),
        ],
        pdf,
    )
        .into_response()
}
