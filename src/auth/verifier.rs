use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;

use crate::error::GatewayError;

/// Identity confirmed by the identity service
#[derive(Debug, Clone)]
pub struct AuthedUser {
    pub id: String,
    pub email: String,
    pub role: String,
}

#[derive(Deserialize)]
struct IdentityUser {
    id: String,
    email: Option<String>,
    role: Option<String>,
}

/// Validates bearer credentials against the external identity service.
/// Obviously broken tokens are rejected locally before any network call.
#[derive(Clone)]
pub struct CredentialVerifier {
    client: Client,
    identity_url: String,
    service_key: String,
}

impl CredentialVerifier {
    pub fn new(client: Client, identity_url: String, service_key: String) -> Self {
        Self {
            client,
            identity_url,
            service_key,
        }
    }

    /// Cheap local shape check. Strips an optional `Bearer ` prefix and
    /// rejects tokens that cannot possibly be valid.
    pub fn precheck(raw: &str) -> Result<&str, GatewayError> {
        let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
        if token.is_empty() {
            return Err(GatewayError::MissingCredential);
        }
        if token.len() < 10 {
            return Err(GatewayError::MalformedCredential("token too short"));
        }
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(GatewayError::MalformedCredential(
                "credential is not a well-formed token",
            ));
        }
        Ok(token)
    }

    /// Resolve the credential to a user. Any definitive answer from the
    /// identity service other than a user record means the credential is
    /// invalid; only a transport failure surfaces as a server error.
    pub async fn verify(&self, raw: &str) -> Result<AuthedUser, GatewayError> {
        let token = Self::precheck(raw)?;

        let url = format!("{}/auth/v1/user", self.identity_url.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .header("apikey", &self.service_key)
            .header("authorization", format!("Bearer {token}"))
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Identity service unreachable: {}", e);
                GatewayError::VerificationFailed(format!("Identity service unreachable: {e}"))
            })?;

        if !response.status().is_success() {
            tracing::debug!("Identity service rejected credential: {}", response.status());
            return Err(GatewayError::InvalidCredential);
        }

        let user: IdentityUser = response
            .json()
            .await
            .map_err(|_| GatewayError::InvalidCredential)?;
        if user.id.is_empty() {
            return Err(GatewayError::InvalidCredential);
        }

        Ok(AuthedUser {
            id: user.id,
            email: user.email.unwrap_or_default(),
            role: user.role.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_token_is_missing() {
        assert!(matches!(
            CredentialVerifier::precheck(""),
            Err(GatewayError::MissingCredential)
        ));
        assert!(matches!(
            CredentialVerifier::precheck("Bearer "),
            Err(GatewayError::MissingCredential)
        ));
    }

    #[test]
    fn short_token_is_rejected_as_too_short() {
        let err = CredentialVerifier::precheck("short").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::MalformedCredential("token too short")
        ));
        let err = CredentialVerifier::precheck("Bearer short").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::MalformedCredential("token too short")
        ));
    }

    #[test]
    fn token_without_three_segments_is_malformed() {
        let err = CredentialVerifier::precheck("abcdefghijklmnop").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedCredential(_)));

        let err = CredentialVerifier::precheck("abcde.fghij").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedCredential(_)));
    }

    #[test]
    fn empty_segment_is_malformed() {
        let err = CredentialVerifier::precheck("abcdefgh..ijklmnop").unwrap_err();
        assert!(matches!(err, GatewayError::MalformedCredential(_)));
    }

    #[test]
    fn well_formed_token_passes_precheck() {
        let token = CredentialVerifier::precheck("aaaa.bbbb.cccc").unwrap();
        assert_eq!(token, "aaaa.bbbb.cccc");
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let token = CredentialVerifier::precheck("Bearer aaaa.bbbb.cccc").unwrap();
        assert_eq!(token, "aaaa.bbbb.cccc");
    }
}
