//! License status for the signed-in user

use axum::{extract::State, Json};
use evisit_billing::BillingStore;
use evisit_shared::License;
use serde::Serialize;

use crate::{
    auth::AuthUser,
    error::{ApiError, ApiResult},
    state::AppState,
};

#[derive(Debug, Serialize)]
pub struct LicenseStatusResponse {
    pub has_active_license: bool,
    pub license: Option<License>,
}

pub async fn status(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<LicenseStatusResponse>> {
    let billing = state.billing.as_ref().ok_or(ApiError::ServiceUnavailable)?;
    let license = billing.store.latest_active_license(auth.user_id).await?;

    Ok(Json(LicenseStatusResponse {
        has_active_license: license.is_some(),
        license,
    }))
}
