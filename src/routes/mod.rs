use axum::Json;
use axum::http::StatusCode;
use serde::Serialize;
use utoipa::ToSchema;

pub mod admin;
pub mod billing;
pub mod health;
pub mod messages;
pub mod usage;

use crate::AppState;
use crate::error::GatewayError;

#[derive(Serialize, ToSchema)]
pub struct SuccessResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Render a gateway error for the JSON API surface, with internal detail
/// only outside production
pub(crate) fn api_error(err: GatewayError, state: &AppState) -> (StatusCode, Json<ErrorResponse>) {
    (
        err.status(),
        Json(ErrorResponse {
            error: err.public_message(state.config.expose_error_detail()),
        }),
    )
}

/// Handler-level test rig: stub identity and model services on ephemeral
/// ports plus an `AppState` wired to them
#[cfg(test)]
pub(crate) mod test_app {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Json, Router, routing::{get, post}};
    use reqwest::Client;
    use serde_json::json;

    use crate::AppState;
    use crate::auth::{CredentialVerifier, InMemoryRateWindows, RateGovernor};
    use crate::billing::BillingClient;
    use crate::config::{Config, CorsMode, Environment};
    use crate::db;
    use crate::ledger::SubscriptionLedger;
    use crate::upstream::UpstreamForwarder;
    use crate::usage::UsageRecorder;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Identity service double: any credential resolves to the given account
    pub async fn spawn_identity_stub(account_id: &'static str) -> String {
        let app = Router::new().route(
            "/auth/v1/user",
            get(move || async move {
                Json(json!({
                    "id": account_id,
                    "email": "caller@example.com",
                    "role": "authenticated"
                }))
            }),
        );
        serve(app).await
    }

    /// Model API double that counts how often it is called
    pub async fn spawn_counting_upstream() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/v1/messages",
            post(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Json(json!({
                        "id": "msg_test",
                        "type": "message",
                        "role": "assistant",
                        "model": "claude-sonnet-4-5",
                        "content": [{"type": "text", "text": "ok"}],
                        "usage": {"input_tokens": 7, "output_tokens": 3}
                    }))
                }
            }),
        );
        (serve(app).await, hits)
    }

    /// Application state wired to the given service URLs
    pub async fn state_for(upstream_url: String, identity_url: String) -> Arc<AppState> {
        db::init_test_db().await;

        let client = Client::new();
        let config = Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            data_dir: PathBuf::from("."),
            upstream_url: upstream_url.clone(),
            upstream_api_key: "upstream-test-key".to_string(),
            identity_url: identity_url.clone(),
            identity_service_key: "identity-test-key".to_string(),
            app_url: "http://localhost:3000".to_string(),
            stripe_secret_key: None,
            stripe_webhook_secret: None,
            stripe_pro_price_id: None,
            admin_username: None,
            admin_password: None,
            cors_mode: CorsMode::LocalhostOnly,
            environment: Environment::Development,
        };

        let ledger = SubscriptionLedger::new();
        let verifier =
            CredentialVerifier::new(client.clone(), identity_url, "identity-test-key".to_string());
        let governor = RateGovernor::new(Arc::new(InMemoryRateWindows::new()), ledger.clone());
        let forwarder =
            UpstreamForwarder::new(client.clone(), upstream_url, "upstream-test-key".to_string());
        let recorder = UsageRecorder::spawn(ledger.clone());
        let billing = BillingClient::new(client, None, None);

        Arc::new(AppState {
            config,
            verifier,
            governor,
            forwarder,
            ledger,
            recorder,
            billing,
        })
    }
}
