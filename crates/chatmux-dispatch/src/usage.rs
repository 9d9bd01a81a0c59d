//! Token accounting helpers. Upstream-reported usage is authoritative; the
//! four-characters-per-token heuristic is the fallback. Nothing here
//! re-tokenizes.

use serde_json::Value;

/// Response tokens to fall back to when the request carries no `max_tokens`.
const DEFAULT_RESPONSE_ESTIMATE: u64 = 1000;

/// Token count for a parsed (non-streaming) completion body:
/// `usage.total_tokens` when present, else the heuristic over the choices.
pub fn response_tokens(body: &Value) -> u64 {
    if let Some(total) = body.pointer("/usage/total_tokens").and_then(Value::as_u64) {
        return total;
    }

    let mut total = 0u64;
    if let Some(choices) = body.get("choices").and_then(Value::as_array) {
        for choice in choices {
            if let Some(content) = choice.pointer("/message/content").and_then(Value::as_str) {
                total += (content.len() / 4) as u64;
            }
        }
    }
    total
}

/// Pre-request estimate used for the credit admission check and the
/// stream-start debit: heuristic over the string message contents plus the
/// requested `max_tokens` budget.
pub fn estimate_request_tokens(body: &Value) -> u64 {
    let mut estimated = 0u64;
    if let Some(messages) = body.get("messages").and_then(Value::as_array) {
        for message in messages {
            if let Some(content) = message.get("content").and_then(Value::as_str) {
                estimated += (content.len() / 4) as u64;
            }
        }
    }
    estimated
        + body
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_RESPONSE_ESTIMATE)
}
