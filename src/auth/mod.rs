use axum::http::HeaderMap;

pub mod plans;
pub mod rate_limit;
pub mod verifier;

pub use plans::{PlanLimits, PlanTier};
pub use rate_limit::{InMemoryRateWindows, RateGovernor, RateWindowStore};
pub use verifier::{AuthedUser, CredentialVerifier};

use crate::AppState;
use crate::error::GatewayError;

/// Pull the raw credential out of the request headers. `x-api-key` wins
/// over `Authorization` when both are present.
pub fn extract_credential(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get("x-api-key").and_then(|v| v.to_str().ok())
        && !value.trim().is_empty()
    {
        return Some(value);
    }
    headers.get("authorization").and_then(|v| v.to_str().ok())
}

/// Resolve the caller from request headers via the identity service
pub async fn authenticate(
    headers: &HeaderMap,
    state: &AppState,
) -> Result<AuthedUser, GatewayError> {
    let Some(raw) = extract_credential(headers) else {
        return Err(GatewayError::MissingCredential);
    };
    let user = state.verifier.verify(raw).await?;
    tracing::debug!("Authenticated account {} (role {})", user.id, user.role);
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn api_key_header_wins_over_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("aaaa.bbbb.cccc"));
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer dddd.eeee.ffff"),
        );
        assert_eq!(extract_credential(&headers), Some("aaaa.bbbb.cccc"));
    }

    #[test]
    fn authorization_header_is_the_fallback() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer dddd.eeee.ffff"),
        );
        assert_eq!(extract_credential(&headers), Some("Bearer dddd.eeee.ffff"));
    }

    #[test]
    fn no_credential_headers_yields_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_credential(&headers), None);
    }
}
