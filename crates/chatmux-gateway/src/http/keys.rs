//! /v1 key administration: create, balance, top-up, enable/disable.
//!
//! Creation is an operator-facing route (no auth); everything else
//! authenticates with the key it operates on.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

use crate::app::AppState;
use crate::http::{extract_bearer, ApiError};

#[derive(Deserialize)]
pub struct CreateKeyRequest {
    #[serde(default)]
    pub initial_credits: f64,
}

#[derive(Serialize)]
pub struct ApiKeyResponse {
    pub key: String,
    pub credits: f64,
    pub total_tokens_used: u64,
    pub enabled: bool,
}

#[derive(Serialize)]
pub struct BalanceResponse {
    pub credits: f64,
    pub total_tokens_used: u64,
}

#[derive(Deserialize)]
pub struct AddCreditsRequest {
    pub amount: f64,
}

/// POST /v1/api-keys
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateKeyRequest>,
) -> Response {
    let user_id = format!("user-{}", uuid::Uuid::new_v4());
    let key = state.ledger.create(&user_id, req.initial_credits);

    match state.ledger.info(&key) {
        Some(info) => Json(ApiKeyResponse {
            key: info.key,
            credits: info.credits,
            total_tokens_used: info.total_tokens_used,
            enabled: info.enabled,
        })
        .into_response(),
        None => {
            warn!("freshly created key missing from the ledger");
            ApiError::response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "api_error",
                "Error retrieving API key info",
            )
        }
    }
}

/// GET /v1/balance
pub async fn balance(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(api_key) = extract_bearer(&headers) else {
        return unauthorized("API key required");
    };
    match state.ledger.info(api_key) {
        Some(info) => Json(BalanceResponse {
            credits: info.credits,
            total_tokens_used: info.total_tokens_used,
        })
        .into_response(),
        None => unauthorized("Invalid API key"),
    }
}

/// POST /v1/add-credits
pub async fn add_credits(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<AddCreditsRequest>,
) -> Response {
    let Some(api_key) = extract_bearer(&headers) else {
        return unauthorized("API key required");
    };
    if req.amount <= 0.0 {
        return ApiError::response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "Amount must be positive",
        );
    }
    if !state.ledger.add_credits(api_key, req.amount) {
        return unauthorized("Invalid API key");
    }

    match state.ledger.info(api_key) {
        Some(info) => Json(json!({
            "credits": info.credits,
            "message": format!("Successfully added {} credits", req.amount),
        }))
        .into_response(),
        None => unauthorized("Invalid API key"),
    }
}

/// POST /v1/disable
pub async fn disable_key(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    toggle_key(&state, &headers, false)
}

/// POST /v1/enable
pub async fn enable_key(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    toggle_key(&state, &headers, true)
}

fn toggle_key(state: &AppState, headers: &HeaderMap, enabled: bool) -> Response {
    let Some(api_key) = extract_bearer(headers) else {
        return unauthorized("API key required");
    };
    let changed = if enabled {
        state.ledger.enable(api_key)
    } else {
        state.ledger.disable(api_key)
    };
    if !changed {
        return unauthorized("Invalid API key");
    }
    let message = if enabled {
        "API key enabled"
    } else {
        "API key disabled"
    };
    Json(json!({"message": message})).into_response()
}

fn unauthorized(message: &str) -> Response {
    ApiError::response(StatusCode::UNAUTHORIZED, "authentication_error", message)
}
