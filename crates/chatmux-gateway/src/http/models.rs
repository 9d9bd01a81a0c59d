//! GET /models — relays the upstream model list through the provider rotation.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;

use crate::app::AppState;
use crate::http::{extract_bearer, ApiError};

pub async fn list_models(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let api_key = match extract_bearer(&headers) {
        Some(key) => key,
        None => {
            return ApiError::response(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "API key required",
            )
        }
    };

    let key_info = match state.ledger.info(api_key) {
        Some(info) => info,
        None => {
            return ApiError::response(
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                "Invalid API key",
            )
        }
    };
    if !key_info.enabled {
        return ApiError::response(
            StatusCode::FORBIDDEN,
            "authentication_error",
            "API key is disabled",
        );
    }

    match state.router.list_models().await {
        Ok(models) => Json(models).into_response(),
        Err(e) => super::chat::dispatch_error_response(e),
    }
}
