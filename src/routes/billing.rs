use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use utoipa::ToSchema;

use crate::AppState;
use crate::auth::authenticate;
use crate::billing::webhook::{self, EventDisposition};
use crate::error::GatewayError;
use crate::routes::{ErrorResponse, api_error};

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    #[serde(default)]
    pub success_url: Option<String>,
    #[serde(default)]
    pub cancel_url: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub url: String,
}

#[derive(Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortalRequest {
    #[serde(default)]
    pub return_url: Option<String>,
}

#[derive(Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BillingStatusResponse {
    pub plan: String,
    pub billing_configured: bool,
    pub has_customer: bool,
}

/// Redirect targets come from the client; only absolute http(s) URLs pass
fn validate_redirect_url(raw: &str) -> Result<(), GatewayError> {
    match url::Url::parse(raw) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => Ok(()),
        _ => Err(GatewayError::InvalidRequest(format!(
            "invalid redirect url: {raw}"
        ))),
    }
}

/// Start a subscription checkout for the calling account
#[utoipa::path(
    post,
    path = "/billing/checkout",
    tag = "billing",
    request_body = CheckoutRequest,
    responses(
        (status = 200, description = "Hosted checkout URL", body = CheckoutResponse),
        (status = 401, description = "Invalid credential", body = ErrorResponse),
        (status = 503, description = "Billing is not configured", body = ErrorResponse)
    )
)]
pub async fn create_checkout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<CheckoutRequest>,
) -> Result<Json<CheckoutResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&headers, &state)
        .await
        .map_err(|e| api_error(e, &state))?;

    if !state.billing.is_configured() {
        return Err(api_error(GatewayError::BillingNotConfigured, &state));
    }

    let success_url = request
        .success_url
        .unwrap_or_else(|| format!("{}/billing/success", state.config.app_url));
    let cancel_url = request
        .cancel_url
        .unwrap_or_else(|| format!("{}/billing/cancel", state.config.app_url));
    validate_redirect_url(&success_url).map_err(|e| api_error(e, &state))?;
    validate_redirect_url(&cancel_url).map_err(|e| api_error(e, &state))?;

    let customer = state
        .billing
        .ensure_customer(&state.ledger, &user.id, &user.email)
        .await
        .map_err(|e| api_error(e, &state))?;
    let url = state
        .billing
        .create_checkout_session(&customer, &user.id, &success_url, &cancel_url)
        .await
        .map_err(|e| api_error(e, &state))?;

    Ok(Json(CheckoutResponse { url }))
}

/// Open the subscription management portal
#[utoipa::path(
    post,
    path = "/billing/portal",
    tag = "billing",
    request_body = PortalRequest,
    responses(
        (status = 200, description = "Hosted portal URL", body = CheckoutResponse),
        (status = 401, description = "Invalid credential", body = ErrorResponse),
        (status = 503, description = "Billing is not configured", body = ErrorResponse)
    )
)]
pub async fn create_portal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<PortalRequest>,
) -> Result<Json<CheckoutResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&headers, &state)
        .await
        .map_err(|e| api_error(e, &state))?;

    if !state.billing.is_configured() {
        return Err(api_error(GatewayError::BillingNotConfigured, &state));
    }

    let return_url = request
        .return_url
        .unwrap_or_else(|| format!("{}/account", state.config.app_url));
    validate_redirect_url(&return_url).map_err(|e| api_error(e, &state))?;

    let customer = state
        .billing
        .ensure_customer(&state.ledger, &user.id, &user.email)
        .await
        .map_err(|e| api_error(e, &state))?;
    let url = state
        .billing
        .create_portal_session(&customer, &return_url)
        .await
        .map_err(|e| api_error(e, &state))?;

    Ok(Json(CheckoutResponse { url }))
}

/// Current plan and billing linkage for the calling account
#[utoipa::path(
    get,
    path = "/billing/status",
    tag = "billing",
    responses(
        (status = 200, description = "Billing status", body = BillingStatusResponse),
        (status = 401, description = "Invalid credential", body = ErrorResponse)
    )
)]
pub async fn billing_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BillingStatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let user = authenticate(&headers, &state)
        .await
        .map_err(|e| api_error(e, &state))?;

    let plan = state
        .ledger
        .get_plan(&user.id)
        .await
        .map_err(|e| api_error(e, &state))?;
    let has_customer = state
        .ledger
        .get_customer(&user.id)
        .await
        .map_err(|e| api_error(e, &state))?
        .is_some();

    Ok(Json(BillingStatusResponse {
        plan: plan.as_str().to_string(),
        billing_configured: state.billing.is_configured(),
        has_customer,
    }))
}

/// Webhook receiver for the payments provider. Authenticates by the
/// signature over the raw body, never by caller credential.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let verbose = state.config.expose_error_detail();

    let Some(secret) = state.config.stripe_webhook_secret.as_deref() else {
        tracing::error!("Webhook received but no webhook secret is configured");
        return GatewayError::BillingNotConfigured.to_api_response(verbose);
    };

    let Some(signature) = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
    else {
        return GatewayError::InvalidSignature("missing stripe-signature header")
            .to_api_response(verbose);
    };

    if let Err(e) = webhook::verify_signature(secret, signature, &body, Utc::now().timestamp()) {
        tracing::warn!("Rejected webhook delivery: {}", e);
        return e.to_api_response(verbose);
    }

    let event: Value = match serde_json::from_slice(&body) {
        Ok(event) => event,
        Err(_) => {
            return GatewayError::InvalidRequest("event payload is not valid JSON".to_string())
                .to_api_response(verbose);
        }
    };

    match webhook::apply_event(&state.ledger, &event).await {
        Ok(EventDisposition::Applied(plan)) => {
            Json(json!({"received": true, "plan": plan.as_str()})).into_response()
        }
        Ok(EventDisposition::Duplicate) => {
            Json(json!({"received": true, "duplicate": true})).into_response()
        }
        Ok(EventDisposition::Ignored) => Json(json!({"received": true})).into_response(),
        Err(e) => e.to_api_response(verbose),
    }
}
