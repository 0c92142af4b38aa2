use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use crate::AppState;
use crate::auth::authenticate;
use crate::constants::{MAX_LATENCY_MS, MAX_TOKENS_PER_RECORD};
use crate::error::GatewayError;
use crate::ledger::{DayUsage, UsageTotals, month_start_utc, today_utc};
use crate::routes::{ErrorResponse, SuccessResponse, api_error};
use crate::usage::UsageEvent;

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummaryResponse {
    pub plan: String,
    pub today: UsageTotals,
    pub month: UsageTotals,
}

#[derive(Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Days of history to return, clamped to 1..=90
    pub days: Option<u32>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UsageHistoryResponse {
    pub days: u32,
    pub entries: Vec<DayUsage>,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RecordUsageRequest {
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    #[serde(default)]
    pub latency_ms: Option<i64>,
    #[serde(default)]
    pub tool_name: Option<String>,
}

fn clamp_days(days: Option<u32>) -> u32 {
    days.unwrap_or(30).clamp(1, 90)
}

/// Client-reported counts are untrusted input; bound everything
fn validate_reported_usage(request: &RecordUsageRequest) -> Result<(), &'static str> {
    if request.input_tokens < 0 || request.output_tokens < 0 {
        return Err("token counts must be non-negative");
    }
    if request.input_tokens > MAX_TOKENS_PER_RECORD
        || request.output_tokens > MAX_TOKENS_PER_RECORD
    {
        return Err("token counts exceed the per-request maximum");
    }
    if let Some(latency) = request.latency_ms
        && !(0..=MAX_LATENCY_MS).contains(&latency)
    {
        return Err("latency is out of range");
    }
    if request.model.is_empty()
        || request.model.len() > 100
        || request.model.chars().any(|c| c.is_control())
    {
        return Err("model name is invalid");
    }
    if let Some(tool) = &request.tool_name
        && tool.len() > 100
    {
        return Err("tool name is too long");
    }
    Ok(())
}

/// Plan and token totals for today and the current month
#[utoipa::path(
    get,
    path = "/usage",
    tag = "usage",
    responses(
        (status = 200, description = "Usage summary for the account", body = UsageSummaryResponse),
        (status = 401, description = "Invalid credential", body = ErrorResponse)
    )
)]
pub async fn get_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UsageSummaryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&headers, &state)
        .await
        .map_err(|e| api_error(e, &state))?;

    let plan = state
        .ledger
        .get_plan(&user.id)
        .await
        .map_err(|e| api_error(e, &state))?;
    let today = state
        .ledger
        .daily_totals(&user.id, &today_utc())
        .await
        .map_err(|e| api_error(e, &state))?;
    let month = state
        .ledger
        .totals_since(&user.id, &month_start_utc())
        .await
        .map_err(|e| api_error(e, &state))?;

    Ok(Json(UsageSummaryResponse {
        plan: plan.as_str().to_string(),
        today,
        month,
    }))
}

/// Per-day usage for the last N days
#[utoipa::path(
    get,
    path = "/usage/history",
    tag = "usage",
    params(HistoryQuery),
    responses(
        (status = 200, description = "Daily usage, newest first", body = UsageHistoryResponse),
        (status = 401, description = "Invalid credential", body = ErrorResponse)
    )
)]
pub async fn get_usage_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<UsageHistoryResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&headers, &state)
        .await
        .map_err(|e| api_error(e, &state))?;

    let days = clamp_days(query.days);
    let entries = state
        .ledger
        .usage_history(&user.id, days)
        .await
        .map_err(|e| api_error(e, &state))?;

    Ok(Json(UsageHistoryResponse { days, entries }))
}

/// Accept client-reported token counts, used to finalize streaming
/// requests the gateway recorded with zero tokens
#[utoipa::path(
    post,
    path = "/usage/record",
    tag = "usage",
    request_body = RecordUsageRequest,
    responses(
        (status = 200, description = "Usage recorded", body = SuccessResponse),
        (status = 400, description = "Invalid usage report", body = ErrorResponse),
        (status = 401, description = "Invalid credential", body = ErrorResponse)
    )
)]
pub async fn record_usage(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<RecordUsageRequest>,
) -> Result<Json<SuccessResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&headers, &state)
        .await
        .map_err(|e| api_error(e, &state))?;

    if let Err(reason) = validate_reported_usage(&request) {
        return Err(api_error(
            GatewayError::InvalidRequest(reason.to_string()),
            &state,
        ));
    }

    let event = UsageEvent {
        account_id: user.id,
        model: request.model,
        input_tokens: request.input_tokens as u64,
        output_tokens: request.output_tokens as u64,
        latency_ms: request.latency_ms.unwrap_or(0) as u64,
        streaming: true,
        tool_name: request.tool_name,
    };
    // Written inline rather than queued so the totals are visible to an
    // immediate follow-up read
    crate::usage::persist(&state.ledger, &event).await;

    Ok(Json(SuccessResponse { success: true }))
}
