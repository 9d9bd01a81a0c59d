pub mod chat;
pub mod health;
pub mod keys;
pub mod models;

use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

/// OpenAI-style error envelope returned on every non-2xx JSON response.
#[derive(Serialize)]
pub struct ApiError {
    error: ApiErrorBody,
}

#[derive(Serialize)]
struct ApiErrorBody {
    message: String,
    #[serde(rename = "type")]
    kind: String,
}

impl ApiError {
    pub fn response(status: StatusCode, kind: &str, message: &str) -> Response {
        let body = ApiError {
            error: ApiErrorBody {
                message: message.to_string(),
                kind: kind.to_string(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub(crate) fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
