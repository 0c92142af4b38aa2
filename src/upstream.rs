use axum::http::{HeaderMap, StatusCode};
use reqwest::Client;
use serde_json::Value;

use crate::constants::DEFAULT_ANTHROPIC_VERSION;
use crate::error::GatewayError;

/// Forwards validated requests to the model API, re-keyed with the
/// gateway's own upstream credential. Caller credentials never leave
/// the gateway.
pub struct UpstreamForwarder {
    client: Client,
    base_url: String,
    api_key: String,
}

impl UpstreamForwarder {
    pub fn new(client: Client, base_url: String, api_key: String) -> Self {
        Self {
            client,
            base_url,
            api_key,
        }
    }

    /// POST the request body upstream. Returns the raw response on 2xx so
    /// the caller decides between buffering and streaming relay; any other
    /// status is translated into a gateway error with the upstream body
    /// kept out of it.
    pub async fn forward(
        &self,
        path: &str,
        headers: &HeaderMap,
        body: &Value,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);

        let version = headers
            .get("anthropic-version")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(DEFAULT_ANTHROPIC_VERSION);

        let mut request = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", version)
            .header("content-type", "application/json");

        if let Some(beta) = headers.get("anthropic-beta").and_then(|v| v.to_str().ok()) {
            request = request.header("anthropic-beta", beta);
        }

        let response = request.json(body).send().await.map_err(|e| {
            tracing::error!("Upstream request failed: {}", e);
            GatewayError::UpstreamUnavailable(format!("Upstream request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            // Log the upstream detail server-side only
            let detail = response.text().await.unwrap_or_default();
            tracing::warn!("Upstream returned {}: {}", status, detail);
            return Err(map_upstream_status(status.as_u16()));
        }

        Ok(response)
    }
}

/// Translate an upstream failure status into the gateway's own error.
/// An upstream 401/403 means the gateway's key is bad, not the caller's
/// credential, so it surfaces as a 502.
pub fn map_upstream_status(status: u16) -> GatewayError {
    match status {
        400 => GatewayError::UpstreamError {
            status: StatusCode::BAD_REQUEST,
            message: "invalid request to model",
        },
        401 | 403 => GatewayError::UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            message: "upstream auth error",
        },
        429 => GatewayError::UpstreamError {
            status: StatusCode::TOO_MANY_REQUESTS,
            message: "upstream rate limited, retry later",
        },
        529 => GatewayError::UpstreamError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "upstream overloaded",
        },
        _ => GatewayError::UpstreamError {
            status: StatusCode::BAD_GATEWAY,
            message: "upstream error",
        },
    }
}
