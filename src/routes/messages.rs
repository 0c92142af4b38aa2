use std::sync::Arc;
use std::time::Instant;

use axum::{
    Json,
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures_util::TryStreamExt;
use serde_json::Value;

use crate::AppState;
use crate::auth::authenticate;
use crate::constants::ALLOWED_MODELS;
use crate::error::GatewayError;
use crate::usage::{UsageEvent, usage_counts_from_json};

/// Validate the request shape before spending auth or upstream work.
/// Unknown models are rejected here so they never reach the upstream.
fn validate_messages_body(body: &Value) -> Result<&str, GatewayError> {
    let Some(model) = body.get("model").and_then(Value::as_str) else {
        return Err(GatewayError::InvalidRequest("model is required".to_string()));
    };
    if !ALLOWED_MODELS.contains(&model) {
        return Err(GatewayError::ModelNotAllowed(model.to_string()));
    }
    match body.get("messages") {
        Some(Value::Array(messages)) if !messages.is_empty() => {}
        _ => {
            return Err(GatewayError::InvalidRequest(
                "messages must be a non-empty array".to_string(),
            ));
        }
    }
    Ok(model)
}

/// Metered relay for the messages endpoint: validate, authenticate,
/// rate-check, forward, record.
pub async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let verbose = state.config.expose_error_detail();

    let model = match validate_messages_body(&body) {
        Ok(model) => model.to_string(),
        Err(e) => return e.to_model_response(verbose),
    };

    let user = match authenticate(&headers, &state).await {
        Ok(user) => user,
        Err(e) => return e.to_model_response(verbose),
    };

    if let Err(e) = state.governor.check(&user.id).await {
        return e.to_model_response(verbose);
    }

    let started = Instant::now();
    let response = match state.forwarder.forward("/v1/messages", &headers, &body).await {
        Ok(response) => response,
        Err(e) => return e.to_model_response(verbose),
    };
    let latency_ms = started.elapsed().as_millis() as u64;

    let upstream_status = response.status();
    let is_stream = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.starts_with("text/event-stream"))
        .unwrap_or(false);

    if is_stream {
        // Token counts arrive inside the event stream; record the request
        // now with zero tokens and let the client report exact counts.
        if upstream_status.as_u16() == 200 {
            state.recorder.enqueue(UsageEvent {
                account_id: user.id.clone(),
                model: model.clone(),
                input_tokens: 0,
                output_tokens: 0,
                latency_ms,
                streaming: true,
                tool_name: None,
            });
        }

        let stream = response.bytes_stream().map_err(|e| {
            tracing::warn!("Upstream stream aborted: {e}");
            std::io::Error::other(e)
        });
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::CONNECTION, "keep-alive")
            .header("x-gateway-latency-ms", latency_ms)
            .body(Body::from_stream(stream))
            .unwrap();
    }

    let json_response: Value = match response.json().await {
        Ok(value) => value,
        Err(e) => {
            tracing::error!("Failed to read upstream response: {}", e);
            return GatewayError::UpstreamUnavailable(format!(
                "Failed to read upstream response: {e}"
            ))
            .to_model_response(verbose);
        }
    };

    if upstream_status.as_u16() == 200
        && let Some(usage) = json_response.get("usage")
    {
        let (input_tokens, output_tokens) = usage_counts_from_json(usage);
        state.recorder.enqueue(UsageEvent {
            account_id: user.id,
            model,
            input_tokens,
            output_tokens,
            latency_ms,
            streaming: false,
            tool_name: None,
        });
    }

    let status = StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::OK);
    let mut response = (status, Json(json_response)).into_response();
    response
        .headers_mut()
        .insert("x-gateway-latency-ms", HeaderValue::from(latency_ms));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::test_app;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[test]
    fn body_without_model_is_invalid() {
        let err = validate_messages_body(&json!({"messages": [{"role": "user"}]})).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn unknown_model_is_rejected() {
        let body = json!({
            "model": "gpt-1",
            "messages": [{"role": "user", "content": "hi"}]
        });
        let err = validate_messages_body(&body).unwrap_err();
        assert!(matches!(err, GatewayError::ModelNotAllowed(_)));
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn empty_messages_are_invalid() {
        let body = json!({"model": "claude-sonnet-4-5", "messages": []});
        assert!(validate_messages_body(&body).is_err());

        let body = json!({"model": "claude-sonnet-4-5", "messages": "hello"});
        assert!(validate_messages_body(&body).is_err());

        let body = json!({"model": "claude-sonnet-4-5"});
        assert!(validate_messages_body(&body).is_err());
    }

    #[test]
    fn allowed_model_with_messages_passes() {
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        });
        assert_eq!(validate_messages_body(&body).unwrap(), "claude-sonnet-4-5");
    }

    #[tokio::test]
    async fn disallowed_model_never_reaches_the_upstream() {
        let (upstream_url, hits) = test_app::spawn_counting_upstream().await;
        let identity_url = test_app::spawn_identity_stub("acct-msg-block").await;
        let state = test_app::state_for(upstream_url, identity_url).await;

        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("aaaa.bbbb.cccc"));
        let body = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "hi"}]
        });

        let response = messages(State(state), headers, Json(body)).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let error: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(error["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn allowed_model_with_a_verified_credential_is_forwarded() {
        let (upstream_url, hits) = test_app::spawn_counting_upstream().await;
        let identity_url = test_app::spawn_identity_stub("acct-msg-forward").await;
        let state = test_app::state_for(upstream_url, identity_url).await;

        let mut headers = HeaderMap::new();
        headers.insert(
            "authorization",
            HeaderValue::from_static("Bearer aaaa.bbbb.cccc"),
        );
        let body = json!({
            "model": "claude-sonnet-4-5",
            "messages": [{"role": "user", "content": "hi"}]
        });

        let response = messages(State(state), headers, Json(body)).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(response.headers().contains_key("x-gateway-latency-ms"));

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let relayed: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(relayed["usage"]["input_tokens"], 7);
        assert_eq!(relayed["usage"]["output_tokens"], 3);
    }
}
