use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::error::GatewayError;
use crate::ledger::SubscriptionLedger;

pub mod webhook;

const STRIPE_API_URL: &str = "https://api.stripe.com/v1";

/// Thin client for the payments provider's form-encoded API. All calls
/// fail with 503 when the gateway runs without billing keys.
#[derive(Clone)]
pub struct BillingClient {
    client: Client,
    secret_key: Option<String>,
    pro_price_id: Option<String>,
}

impl BillingClient {
    pub fn new(client: Client, secret_key: Option<String>, pro_price_id: Option<String>) -> Self {
        Self {
            client,
            secret_key,
            pro_price_id,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret_key.is_some() && self.pro_price_id.is_some()
    }

    async fn post_form(&self, path: &str, params: &[(&str, &str)]) -> Result<Value, GatewayError> {
        let Some(secret) = self.secret_key.as_deref() else {
            return Err(GatewayError::BillingNotConfigured);
        };

        let response = self
            .client
            .post(format!("{STRIPE_API_URL}{path}"))
            .header("authorization", format!("Bearer {secret}"))
            .form(params)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| {
                tracing::error!("Payments provider unreachable: {}", e);
                GatewayError::BillingUnavailable(format!("Payments provider unreachable: {e}"))
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            GatewayError::BillingUnavailable(format!("Invalid payments provider response: {e}"))
        })?;

        if !status.is_success() {
            let message = body
                .pointer("/error/message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            tracing::warn!("Payments provider returned {}: {}", status, message);
            return Err(GatewayError::BillingUnavailable(format!(
                "payments provider returned {status}"
            )));
        }
        Ok(body)
    }

    /// Find or create the provider customer for an account
    pub async fn ensure_customer(
        &self,
        ledger: &SubscriptionLedger,
        account_id: &str,
        email: &str,
    ) -> Result<String, GatewayError> {
        if let Some(customer) = ledger.get_customer(account_id).await? {
            return Ok(customer);
        }

        let body = self
            .post_form(
                "/customers",
                &[("email", email), ("metadata[account_id]", account_id)],
            )
            .await?;
        let Some(customer) = body.get("id").and_then(Value::as_str) else {
            return Err(GatewayError::BillingUnavailable(
                "Customer response missing id".to_string(),
            ));
        };

        ledger.put_customer(account_id, customer).await?;
        Ok(customer.to_string())
    }

    /// Start a subscription checkout. The account id rides along as
    /// metadata on both the session and the subscription it creates, so
    /// every later webhook can be tied back to the account.
    pub async fn create_checkout_session(
        &self,
        customer: &str,
        account_id: &str,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<String, GatewayError> {
        let Some(price) = self.pro_price_id.as_deref() else {
            return Err(GatewayError::BillingNotConfigured);
        };

        let body = self
            .post_form(
                "/checkout/sessions",
                &[
                    ("mode", "subscription"),
                    ("customer", customer),
                    ("line_items[0][price]", price),
                    ("line_items[0][quantity]", "1"),
                    ("success_url", success_url),
                    ("cancel_url", cancel_url),
                    ("metadata[account_id]", account_id),
                    ("subscription_data[metadata][account_id]", account_id),
                ],
            )
            .await?;

        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::BillingUnavailable("Checkout session missing url".to_string())
            })
    }

    pub async fn create_portal_session(
        &self,
        customer: &str,
        return_url: &str,
    ) -> Result<String, GatewayError> {
        let body = self
            .post_form(
                "/billing_portal/sessions",
                &[("customer", customer), ("return_url", return_url)],
            )
            .await?;

        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                GatewayError::BillingUnavailable("Portal session missing url".to_string())
            })
    }
}
