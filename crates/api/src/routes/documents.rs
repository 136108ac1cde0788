//! Admin invoice and offer management
//!
//! Every handler serves both kinds; the router attaches the kind as an
//! extension on the `/invoices` and `/offers` nests.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    Extension, Json,
};
use evisit_billing::{Document, DocumentInput, DocumentKind, DocumentService, DocumentSummary};
use evisit_shared::DocumentStatus;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    auth::AdminUser,
    error::{ApiError, ApiResult},
    routes::pdf_response,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: DocumentStatus,
}

fn documents(state: &AppState) -> ApiResult<&DocumentService> {
    state
        .billing
        .as_ref()
        .map(|billing| &billing.documents)
        .ok_or(ApiError::ServiceUnavailable)
}

pub async fn list(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    _admin: AdminUser,
) -> ApiResult<Json<Vec<DocumentSummary>>> {
    Ok(Json(documents(&state)?.list(kind).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    AdminUser(admin): AdminUser,
    Json(input): Json<DocumentInput>,
) -> ApiResult<(StatusCode, Json<Document>)> {
    let document = documents(&state)?.create(kind, input, admin.user_id).await?;
    Ok((StatusCode::CREATED, Json(document)))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Document>> {
    Ok(Json(documents(&state)?.get(kind, id).await?))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(input): Json<DocumentInput>,
) -> ApiResult<Json<Document>> {
    Ok(Json(documents(&state)?.update(kind, id, input).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    documents(&state)?.delete(kind, id).await?;
    tracing::info!(admin_id = %admin.user_id, kind = %kind, document_id = %id, "Document deleted by admin");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn update_status(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
    Json(update): Json<StatusUpdate>,
) -> ApiResult<Json<Document>> {
    Ok(Json(
        documents(&state)?
            .update_status(kind, id, update.status)
            .await?,
    ))
}

/// Email the document to its recipient and mark it sent
pub async fn send(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Document>> {
    Ok(Json(documents(&state)?.send(kind, id).await?))
}

pub async fn download(
    State(state): State<AppState>,
    Extension(kind): Extension<DocumentKind>,
    _admin: AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Response> {
    let (document, pdf) = documents(&state)?.render_pdf(kind, id).await?;
    Ok(pdf_response(&document.number, pdf))
}
