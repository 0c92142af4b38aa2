use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::auth::PlanTier;
use crate::constants::WEBHOOK_TOLERANCE_SECS;
use crate::error::GatewayError;
use crate::ledger::SubscriptionLedger;

type HmacSha256 = Hmac<Sha256>;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        out.push(HEX_CHARS[(byte >> 4) as usize] as char);
        out.push(HEX_CHARS[(byte & 0x0f) as usize] as char);
    }
    out
}

struct SignatureHeader {
    timestamp: i64,
    candidates: Vec<String>,
}

/// Parse a `t=...,v1=...` signature header. Every v1 entry is kept as a
/// candidate; unknown schemes are skipped.
fn parse_signature_header(header: &str) -> Result<SignatureHeader, GatewayError> {
    let mut timestamp = None;
    let mut candidates = Vec::new();

    for pair in header.split(',') {
        let Some((key, value)) = pair.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => timestamp = value.parse::<i64>().ok(),
            "v1" => candidates.push(value.to_string()),
            _ => {}
        }
    }

    let Some(timestamp) = timestamp else {
        return Err(GatewayError::InvalidSignature("missing timestamp"));
    };
    if candidates.is_empty() {
        return Err(GatewayError::InvalidSignature("missing v1 signature"));
    }
    Ok(SignatureHeader {
        timestamp,
        candidates,
    })
}

/// Verify a webhook signature header against the raw request body.
/// The signed payload is `{timestamp}.{body}`; timestamps more than
/// five minutes from `now` are rejected before any HMAC work.
pub fn verify_signature(
    secret: &str,
    header: &str,
    body: &[u8],
    now: i64,
) -> Result<(), GatewayError> {
    let parsed = parse_signature_header(header)?;

    if (now - parsed.timestamp).abs() > WEBHOOK_TOLERANCE_SECS {
        return Err(GatewayError::InvalidSignature("timestamp outside tolerance"));
    }

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| GatewayError::InvalidSignature("invalid webhook secret"))?;
    mac.update(parsed.timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(body);
    let expected = hex_encode(&mac.finalize().into_bytes());

    let matched = parsed.candidates.iter().any(|candidate| {
        bool::from(
            candidate
                .to_ascii_lowercase()
                .as_bytes()
                .ct_eq(expected.as_bytes()),
        )
    });
    if !matched {
        return Err(GatewayError::InvalidSignature("signature mismatch"));
    }
    Ok(())
}

/// What applying a webhook event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventDisposition {
    Applied(PlanTier),
    Duplicate,
    Ignored,
}

/// Map an event type to the plan it implies. Events the gateway does not
/// subscribe to map to None.
fn plan_for_event(event_type: &str, object: &Value) -> Option<PlanTier> {
    match event_type {
        "customer.subscription.created"
        | "customer.subscription.updated"
        | "checkout.session.completed" => {
            let status = object
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if matches!(status, "active" | "trialing") {
                Some(PlanTier::Pro)
            } else {
                Some(PlanTier::Free)
            }
        }
        "customer.subscription.deleted" | "invoice.payment_failed" => Some(PlanTier::Free),
        _ => None,
    }
}

/// Apply a verified webhook event to the ledger. The event row is written
/// before the plan; a replayed delivery finds the row and changes nothing.
pub async fn apply_event(
    ledger: &SubscriptionLedger,
    event: &Value,
) -> Result<EventDisposition, GatewayError> {
    let Some(event_id) = event.get("id").and_then(Value::as_str) else {
        return Err(GatewayError::InvalidRequest(
            "event id is required".to_string(),
        ));
    };
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or_default();
    let object = event.pointer("/data/object").cloned().unwrap_or(Value::Null);

    let Some(account_id) = object
        .pointer("/metadata/account_id")
        .and_then(Value::as_str)
    else {
        tracing::debug!("Webhook event {} carries no account id, ignoring", event_id);
        return Ok(EventDisposition::Ignored);
    };

    let Some(plan) = plan_for_event(event_type, &object) else {
        return Ok(EventDisposition::Ignored);
    };

    if ledger.has_subscription_event(event_id).await? {
        return Ok(EventDisposition::Duplicate);
    }
    let inserted = ledger
        .insert_subscription_event(event_id, account_id, event_type, plan)
        .await?;
    if !inserted {
        // Lost the race against a concurrent delivery of the same event
        return Ok(EventDisposition::Duplicate);
    }

    ledger.set_plan(account_id, plan).await?;
    tracing::info!(
        "Account {} moved to {} plan by {}",
        account_id,
        plan.as_str(),
        event_type
    );
    Ok(EventDisposition::Applied(plan))
}
