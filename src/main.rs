mod auth;
mod billing;
mod config;
mod constants;
mod db;
mod error;
mod ledger;
mod routes;
mod upstream;
mod usage;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    extract::State,
    http::{HeaderValue, Method, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use base64::Engine;
use clap::Parser;
use config::{Config, CorsMode};
use reqwest::Client;
use subtle::ConstantTimeEq;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa_axum::{router::OpenApiRouter, routes};

use auth::{CredentialVerifier, InMemoryRateWindows, RateGovernor};
use billing::BillingClient;
use ledger::SubscriptionLedger;
use upstream::UpstreamForwarder;
use usage::UsageRecorder;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const GIT_HASH: &str = env!("GIT_HASH");
pub const BUILD_TIME: &str = env!("BUILD_TIME");

pub struct AppState {
    pub config: Config,
    pub verifier: CredentialVerifier,
    pub governor: RateGovernor,
    pub forwarder: UpstreamForwarder,
    pub ledger: SubscriptionLedger,
    pub recorder: UsageRecorder,
    pub billing: BillingClient,
}

#[derive(Parser)]
#[command(name = "tokengate")]
#[command(about = "Metered gateway in front of the Anthropic API")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "TOKENGATE_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "TOKENGATE_PORT")]
    port: Option<u16>,
}

/// Middleware guarding the admin surface with Basic Auth
async fn admin_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: axum::extract::Request,
    next: Next,
) -> Response {
    // No configured credentials means the surface stays closed
    let (Some(username), Some(password)) = (
        state.config.admin_username.as_deref(),
        state.config.admin_password.as_deref(),
    ) else {
        return unauthorized_response();
    };

    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    let Some(auth_value) = auth_header else {
        return unauthorized_response();
    };

    let Some(encoded) = auth_value.strip_prefix("Basic ") else {
        return unauthorized_response();
    };

    let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
        return unauthorized_response();
    };

    let Ok(credentials) = String::from_utf8(decoded) else {
        return unauthorized_response();
    };

    let Some((provided_user, provided_pass)) = credentials.split_once(':') else {
        return unauthorized_response();
    };

    // Constant-time comparison to prevent timing attacks
    let user_match = provided_user.as_bytes().ct_eq(username.as_bytes());
    let pass_match = provided_pass.as_bytes().ct_eq(password.as_bytes());

    if user_match.into() && pass_match.into() {
        next.run(request).await
    } else {
        unauthorized_response()
    }
}

fn unauthorized_response() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    // Initialize database (before anything that can record usage)
    db::init_db(&config.db_path())
        .await
        .expect("Failed to initialize database");

    let host = args.host.unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    // Shared HTTP client with connection pooling
    let http_client = Client::builder()
        .timeout(Duration::from_secs(300)) // 5 min timeout for long model requests
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let ledger = SubscriptionLedger::new();
    let verifier = CredentialVerifier::new(
        http_client.clone(),
        config.identity_url.clone(),
        config.identity_service_key.clone(),
    );
    let governor = RateGovernor::new(Arc::new(InMemoryRateWindows::new()), ledger.clone());
    let forwarder = UpstreamForwarder::new(
        http_client.clone(),
        config.upstream_url.clone(),
        config.upstream_api_key.clone(),
    );
    let recorder = UsageRecorder::spawn(ledger.clone());
    let billing = BillingClient::new(
        http_client,
        config.stripe_secret_key.clone(),
        config.stripe_pro_price_id.clone(),
    );

    if config.stripe_webhook_secret.is_none() {
        info!("No webhook secret configured; billing webhooks will be rejected");
    }
    if config.admin_username.is_none() || config.admin_password.is_none() {
        info!("Admin credentials not configured; the admin surface is disabled");
    }

    let state = Arc::new(AppState {
        config,
        verifier,
        governor,
        forwarder,
        ledger,
        recorder,
        billing,
    });

    // CORS configuration based on environment
    let cors_origins = state.config.cors_mode.clone();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let Ok(origin_str) = origin.to_str() else {
                return false;
            };

            match &cors_origins {
                CorsMode::AllowAll => true,
                CorsMode::LocalhostOnly => {
                    let Ok(url) = url::Url::parse(origin_str) else {
                        return false;
                    };
                    matches!(
                        url.host_str(),
                        Some("localhost") | Some("127.0.0.1") | Some("::1")
                    )
                }
                CorsMode::AllowList(allowed) => allowed.iter().any(|a| a == origin_str),
            }
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-api-key"),
            header::HeaderName::from_static("anthropic-version"),
            header::HeaderName::from_static("anthropic-beta"),
        ])
        .allow_credentials(true);

    match &state.config.cors_mode {
        CorsMode::AllowAll => info!("CORS: Allowing all origins"),
        CorsMode::LocalhostOnly => info!("CORS: Localhost only"),
        CorsMode::AllowList(list) => info!("CORS: Allowing origins: {:?}", list),
    }

    // Account-facing API with OpenAPI spec generation
    let (api_router, openapi) = OpenApiRouter::with_openapi(Default::default())
        // Usage
        .routes(routes!(routes::usage::get_usage))
        .routes(routes!(routes::usage::get_usage_history))
        .routes(routes!(routes::usage::record_usage))
        // Billing
        .routes(routes!(routes::billing::create_checkout))
        .routes(routes!(routes::billing::create_portal))
        .routes(routes!(routes::billing::billing_status))
        .split_for_parts();

    // Admin routes share the OpenAPI document but live behind Basic Auth
    let (admin_router, openapi) = OpenApiRouter::with_openapi(openapi)
        .routes(routes!(routes::admin::set_account_plan))
        .split_for_parts();

    // Swagger UI + OpenAPI spec (accessible without authentication)
    let swagger_routes = Router::new().merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger").url("/api-docs/openapi.json", openapi),
    );

    // The webhook authenticates by signature, not caller credential
    let api_routes = api_router.route("/billing/webhook", post(routes::billing::receive_webhook));

    let admin_routes = admin_router.layer(middleware::from_fn_with_state(
        state.clone(),
        admin_auth_middleware,
    ));

    // Model-facing routes speak the model API's error dialect
    let v1_routes = Router::new().route("/messages", post(routes::messages::messages));

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .merge(swagger_routes)
            .nest("/api", api_routes)
            .nest("/admin", admin_routes)
            .nest("/v1", v1_routes)
            .layer(cors)
            .with_state(state),
    );

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .expect("Invalid address");
    info!(
        "Starting tokengate v{}-{} (built {})",
        VERSION, GIT_HASH, BUILD_TIME
    );
    info!("Listening on http://{}", addr);
    info!("API docs: http://{}/swagger", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .await
    .unwrap();
}
