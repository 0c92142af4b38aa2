use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use serde::Deserialize;
use utoipa::ToSchema;

use crate::AppState;
use crate::auth::PlanTier;
use crate::routes::{ErrorResponse, SuccessResponse, api_error};

#[derive(Deserialize, ToSchema)]
pub struct SetPlanRequest {
    /// Target plan: "free" or "pro"
    pub plan: String,
}

/// Manual plan override, used for support and for local setups that run
/// without the payments provider
#[utoipa::path(
    put,
    path = "/accounts/{id}/plan",
    tag = "admin",
    params(("id" = String, Path, description = "Account ID")),
    request_body = SetPlanRequest,
    responses(
        (status = 200, body = SuccessResponse),
        (status = 400, body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    )
)]
pub async fn set_account_plan(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Json(body): Json<SetPlanRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let Some(plan) = PlanTier::parse(body.plan.trim()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "Invalid plan. Use: free or pro".into(),
            }),
        ));
    };

    state
        .ledger
        .set_plan(&account_id, plan)
        .await
        .map_err(|e| api_error(e, &state))?;
    tracing::info!("Plan for account {} set to {}", account_id, plan.as_str());

    Ok(Json(SuccessResponse { success: true }))
}
