//! POST /chat/completions — the proxied OpenAI-compatible chat endpoint.
//!
//! Admission order mirrors the billing contract: key lookup (401), enabled
//! check (403), credit estimate (402), then body preprocessing (400), then
//! dispatch. Streaming responses debit the admission estimate once at stream
//! start; JSON responses debit the measured count at completion.

use axum::{
    body::Body,
    extract::State,
    http::{header::HeaderValue, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chatmux_credits::AdmitError;
use chatmux_dispatch::{usage, DispatchError, Reply};
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use crate::app::AppState;
use crate::http::{extract_bearer, ApiError};

const DEFAULT_MODEL: &str = "gpt-4";
const DEFAULT_MAX_TOKENS: u64 = 10240;

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let api_key = match extract_bearer(&headers) {
        Some(key) => key.to_string(),
        None => {
            return ApiError::response(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "API key required",
            )
        }
    };

    let estimated_tokens = usage::estimate_request_tokens(&body);
    if let Err(e) = state.ledger.admit(&api_key, estimated_tokens) {
        return admit_error_response(e);
    }

    let stream_mode = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    info!(stream = stream_mode, estimated_tokens, "chat completion request");

    let body = match preprocess_request_body(body) {
        Ok(body) => body,
        Err(msg) => {
            return ApiError::response(StatusCode::BAD_REQUEST, "invalid_request_error", &msg)
        }
    };

    let accept = if stream_mode {
        "text/event-stream"
    } else {
        "application/json"
    };

    match state.router.dispatch(&body, None, accept, stream_mode).await {
        Ok(Reply::Json { body, tokens }) => {
            if !state.ledger.debit(&api_key, tokens) {
                warn!(tokens, "post-response debit failed");
            }
            Json(body).into_response()
        }
        Ok(Reply::Stream(upstream)) => {
            // The precise count is unknowable until the stream drains, so the
            // estimate is charged up front - the relay only observes.
            if !state.ledger.debit(&api_key, estimated_tokens) {
                warn!(estimated_tokens, "stream-start debit failed");
            }
            sse_response(upstream)
        }
        Err(e) => dispatch_error_response(e),
    }
}

fn admit_error_response(e: AdmitError) -> Response {
    match e {
        AdmitError::UnknownKey => ApiError::response(
            StatusCode::UNAUTHORIZED,
            "authentication_error",
            "Invalid API key",
        ),
        AdmitError::Disabled => ApiError::response(
            StatusCode::FORBIDDEN,
            "authentication_error",
            "API key is disabled",
        ),
        AdmitError::InsufficientCredits => ApiError::response(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_credits",
            "Insufficient credits for estimated token usage",
        ),
    }
}

pub(crate) fn dispatch_error_response(e: DispatchError) -> Response {
    match e {
        DispatchError::RateLimited | DispatchError::Exhausted => ApiError::response(
            StatusCode::TOO_MANY_REQUESTS,
            "rate_limit_error",
            "All providers exhausted due to rate limits",
        ),
        DispatchError::NoProvider => ApiError::response(
            StatusCode::SERVICE_UNAVAILABLE,
            "service_unavailable",
            "No usable provider available",
        ),
        DispatchError::Upstream { status, body } => {
            // Relay the upstream status and body untouched.
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            response.headers_mut().insert(
                axum::http::header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
            response
        }
        other => {
            warn!(err = %other, "dispatch failed");
            ApiError::response(StatusCode::INTERNAL_SERVER_ERROR, "api_error", &other.to_string())
        }
    }
}

/// Wire the relay's lazy byte stream into the response body with the SSE
/// header set intact.
fn sse_response(upstream: chatmux_dispatch::provider::ByteStream) -> Response {
    let body = Body::from_stream(upstream.map(Ok::<_, std::convert::Infallible>));
    let mut response = Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("text/event-stream"),
    );
    headers.insert(
        axum::http::header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        axum::http::header::CONNECTION,
        HeaderValue::from_static("keep-alive"),
    );
    // Disable buffering for nginx front-ends.
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    headers.insert(
        axum::http::header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    response
}

/// Flatten array-form message content (text parts only), rewrite system roles
/// for o1 models, and fill in the model / max_tokens defaults.
fn preprocess_request_body(mut body: Value) -> Result<Value, String> {
    let model_is_o1 = body
        .get("model")
        .and_then(Value::as_str)
        .map(|m| m.starts_with("o1"))
        .unwrap_or(false);

    if let Some(Value::Array(messages)) = body.get("messages").cloned() {
        let mut processed = Vec::with_capacity(messages.len());
        for message in messages {
            let role = message.get("role").cloned().unwrap_or(json!("user"));
            match message.get("content") {
                Some(Value::Array(parts)) => {
                    for part in parts {
                        if part.get("type").and_then(Value::as_str) != Some("text") {
                            return Err(
                                "Only text type is supported in content array".to_string()
                            );
                        }
                        let text = part.get("text").cloned().unwrap_or(json!(""));
                        processed.push(json!({"role": role, "content": text}));
                    }
                }
                _ => processed.push(message),
            }
        }

        if model_is_o1 {
            // o1 models reject system messages.
            for message in processed.iter_mut() {
                if message.get("role").and_then(Value::as_str) == Some("system") {
                    message["role"] = json!("user");
                }
            }
        }

        body["messages"] = Value::Array(processed);
    }

    if body.get("model").is_none() {
        body["model"] = json!(DEFAULT_MODEL);
    }
    if body.get("max_tokens").is_none() {
        body["max_tokens"] = json!(DEFAULT_MAX_TOKENS);
    }

    Ok(body)
}
