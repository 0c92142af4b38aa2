use std::env;
use std::path::PathBuf;

use dotenvy::dotenv;

/// CORS configuration mode
#[derive(Debug, Clone)]
pub enum CorsMode {
    /// Only allow localhost origins (default, for local development)
    LocalhostOnly,
    /// Allow all origins
    AllowAll,
    /// Allow specific origins (comma-separated list)
    AllowList(Vec<String>),
}

/// Deployment environment. Internal error detail is echoed to clients
/// everywhere except production.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub upstream_url: String,
    pub upstream_api_key: String,
    pub identity_url: String,
    pub identity_service_key: String,
    /// Front-end base URL, used for default billing redirect targets
    pub app_url: String,
    pub stripe_secret_key: Option<String>,
    pub stripe_webhook_secret: Option<String>,
    pub stripe_pro_price_id: Option<String>,
    pub admin_username: Option<String>,
    pub admin_password: Option<String>,
    pub cors_mode: CorsMode,
    pub environment: Environment,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok();

        let host = env::var("TOKENGATE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("TOKENGATE_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8787);

        let data_dir = env::var("TOKENGATE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("tokengate")
            });

        let upstream_url = env::var("TOKENGATE_UPSTREAM_URL")
            .unwrap_or_else(|_| "https://api.anthropic.com".to_string());
        let upstream_api_key =
            env::var("TOKENGATE_UPSTREAM_API_KEY").expect("TOKENGATE_UPSTREAM_API_KEY must be set");

        let identity_url =
            env::var("TOKENGATE_IDENTITY_URL").expect("TOKENGATE_IDENTITY_URL must be set");
        let identity_service_key = env::var("TOKENGATE_IDENTITY_SERVICE_KEY")
            .expect("TOKENGATE_IDENTITY_SERVICE_KEY must be set");

        let app_url =
            env::var("TOKENGATE_APP_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let stripe_secret_key = optional_var("TOKENGATE_STRIPE_SECRET_KEY");
        let stripe_webhook_secret = optional_var("TOKENGATE_STRIPE_WEBHOOK_SECRET");
        let stripe_pro_price_id = optional_var("TOKENGATE_STRIPE_PRO_PRICE_ID");

        let admin_username = optional_var("TOKENGATE_ADMIN_USERNAME");
        let admin_password = optional_var("TOKENGATE_ADMIN_PASSWORD");

        // CORS configuration: "localhost" (default), "*" (allow all), or comma-separated origins
        let cors_mode = match env::var("TOKENGATE_CORS_ORIGINS").as_deref() {
            Ok("*") => CorsMode::AllowAll,
            Ok(origins) if !origins.is_empty() => {
                CorsMode::AllowList(origins.split(',').map(|s| s.trim().to_string()).collect())
            }
            _ => CorsMode::LocalhostOnly,
        };

        let environment = Environment::parse(
            env::var("TOKENGATE_ENV")
                .as_deref()
                .unwrap_or("development"),
        );

        Self {
            host,
            port,
            data_dir,
            upstream_url,
            upstream_api_key,
            identity_url,
            identity_service_key,
            app_url,
            stripe_secret_key,
            stripe_webhook_secret,
            stripe_pro_price_id,
            admin_username,
            admin_password,
            cors_mode,
            environment,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("gateway.db")
    }

    /// Whether internal error detail may be echoed to clients
    pub fn expose_error_detail(&self) -> bool {
        self.environment != Environment::Production
    }
}

fn optional_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn environment_parse_recognizes_production() {
        assert_eq!(Environment::parse("production"), Environment::Production);
        assert_eq!(Environment::parse("PROD"), Environment::Production);
        assert_eq!(Environment::parse("development"), Environment::Development);
        assert_eq!(Environment::parse("staging"), Environment::Development);
    }
}
