use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::constants::ALLOWED_MODELS;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Malformed credential: {0}")]
    MalformedCredential(&'static str),

    #[error("Invalid or expired credential")]
    InvalidCredential,

    #[error("Credential verification failed: {0}")]
    VerificationFailed(String),

    #[error("Rate limit exceeded ({limit} requests per minute)")]
    RateLimitExceeded { limit: u32, retry_after_secs: u64 },

    #[error("Daily token quota exceeded ({used}/{limit} tokens)")]
    QuotaExceeded {
        used: u64,
        limit: u64,
        retry_after_secs: u64,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Model {0} is not available")]
    ModelNotAllowed(String),

    #[error("Upstream provider unreachable: {0}")]
    UpstreamUnavailable(String),

    #[error("{message}")]
    UpstreamError {
        status: StatusCode,
        message: &'static str,
    },

    #[error("Invalid webhook signature: {0}")]
    InvalidSignature(&'static str),

    #[error("Billing is not configured")]
    BillingNotConfigured,

    #[error("Billing provider error: {0}")]
    BillingUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MissingCredential
            | GatewayError::MalformedCredential(_)
            | GatewayError::InvalidCredential => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimitExceeded { .. } | GatewayError::QuotaExceeded { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            GatewayError::InvalidRequest(_)
            | GatewayError::ModelNotAllowed(_)
            | GatewayError::InvalidSignature(_) => StatusCode::BAD_REQUEST,
            GatewayError::UpstreamUnavailable(_) | GatewayError::BillingUnavailable(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::UpstreamError { status, .. } => *status,
            GatewayError::BillingNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::VerificationFailed(_) | GatewayError::DatabaseError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message shown to the caller. Internal detail is stripped unless
    /// `verbose` is set (never in production); the full text is always
    /// available to server-side logs via Display.
    pub fn public_message(&self, verbose: bool) -> String {
        if verbose {
            return match self {
                GatewayError::ModelNotAllowed(_) => {
                    format!("{self}; allowed models: {}", ALLOWED_MODELS.join(", "))
                }
                _ => self.to_string(),
            };
        }
        match self {
            GatewayError::VerificationFailed(_) => "Credential verification failed".to_string(),
            GatewayError::UpstreamUnavailable(_) => "Upstream provider unreachable".to_string(),
            GatewayError::BillingUnavailable(_) => "Billing provider error".to_string(),
            GatewayError::DatabaseError(_) => "Internal server error".to_string(),
            GatewayError::ModelNotAllowed(_) => {
                format!("{self}; allowed models: {}", ALLOWED_MODELS.join(", "))
            }
            _ => self.to_string(),
        }
    }

    /// Seconds the caller should wait before retrying, when applicable
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            GatewayError::RateLimitExceeded {
                retry_after_secs, ..
            }
            | GatewayError::QuotaExceeded {
                retry_after_secs, ..
            } => Some(*retry_after_secs),
            _ => None,
        }
    }

    fn model_error_type(&self) -> &'static str {
        match self {
            GatewayError::MissingCredential
            | GatewayError::MalformedCredential(_)
            | GatewayError::InvalidCredential => "authentication_error",
            GatewayError::RateLimitExceeded { .. } | GatewayError::QuotaExceeded { .. } => {
                "rate_limit_error"
            }
            GatewayError::InvalidRequest(_)
            | GatewayError::ModelNotAllowed(_)
            | GatewayError::InvalidSignature(_) => "invalid_request_error",
            GatewayError::UpstreamError { status, .. } => match status.as_u16() {
                429 => "rate_limit_error",
                503 => "overloaded_error",
                400 => "invalid_request_error",
                _ => "api_error",
            },
            _ => "api_error",
        }
    }

    /// Error response in the upstream model API's format, for /v1/* callers
    pub fn to_model_response(&self, verbose: bool) -> Response {
        let mut body = json!({
            "type": "error",
            "error": {
                "type": self.model_error_type(),
                "message": self.public_message(verbose),
            }
        });
        if let Some(retry) = self.retry_after_secs() {
            body["error"]["retryAfter"] = json!(retry);
        }

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(retry) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry));
        }
        response
    }

    /// Flat error response for /api/* callers
    pub fn to_api_response(&self, verbose: bool) -> Response {
        let mut body = json!({ "error": self.public_message(verbose) });
        if let Some(retry) = self.retry_after_secs() {
            body["retryAfter"] = json!(retry);
        }

        let mut response = (self.status(), Json(body)).into_response();
        if let Some(retry) = self.retry_after_secs() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry));
        }
        response
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        // Default to the model API format without internal detail
        self.to_model_response(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn rate_limit_response_carries_retry_after() {
        let err = GatewayError::RateLimitExceeded {
            limit: 10,
            retry_after_secs: 42,
        };
        let response = err.to_model_response(true);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER),
            Some(&HeaderValue::from_static("42"))
        );

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["retryAfter"], 42);
    }

    #[tokio::test]
    async fn internal_detail_is_hidden_without_verbose() {
        let err = GatewayError::DatabaseError("disk full at /var/db".to_string());

        let response = err.to_api_response(false);
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Internal server error");

        let err = GatewayError::DatabaseError("disk full at /var/db".to_string());
        assert!(err.public_message(true).contains("disk full"));
    }

    #[test]
    fn upstream_error_keeps_mapped_status() {
        let err = GatewayError::UpstreamError {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: "upstream overloaded",
        };
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.model_error_type(), "overloaded_error");
    }

    #[test]
    fn model_not_allowed_lists_alternatives() {
        let err = GatewayError::ModelNotAllowed("gpt-4".to_string());
        let message = err.public_message(false);
        assert!(message.contains("gpt-4"));
        assert!(message.contains("allowed models"));
        assert!(message.contains(ALLOWED_MODELS[0]));
    }
}
