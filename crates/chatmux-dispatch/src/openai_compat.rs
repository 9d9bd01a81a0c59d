//! OpenAI-compatible provider — any upstream speaking the OpenAI chat API,
//! reached with a static bearer key. Public model names are rewritten through
//! the configured mapping before dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chatmux_core::config::OpenAiCompatConfig;
use futures_util::TryStreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::limiter::EXTERNAL_LIMIT_SECS;
use crate::provider::{looks_rate_limited, DispatchError, Lease, Provider, Reply};
use crate::relay::{relay_sse, RelayFault};
use crate::usage;

pub struct OpenAiCompatProvider {
    base_url: String,
    api_key: String,
    model_mapping: HashMap<String, String>,
    /// Unix seconds until which the whole provider sits out (atomic: written
    /// on 429, read on every availability check).
    rate_limited_until: AtomicI64,
    request_timeout: Duration,
}

impl OpenAiCompatProvider {
    pub fn new(config: &OpenAiCompatConfig, request_timeout: Duration) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model_mapping: config.model_mapping.clone(),
            rate_limited_until: AtomicI64::new(0),
            request_timeout,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    fn client(&self) -> Result<reqwest::Client, DispatchError> {
        Ok(reqwest::Client::builder()
            .timeout(self.request_timeout)
            .build()?)
    }

    fn mark_rate_limited(&self, now: i64) {
        let until = now + EXTERNAL_LIMIT_SECS as i64;
        self.rate_limited_until.store(until, Ordering::Relaxed);
        warn!(provider = self.name(), until, "provider rate limited");
    }

    pub fn rate_limited_until(&self) -> i64 {
        self.rate_limited_until.load(Ordering::Relaxed)
    }
}

/// `None` targets the chat completions route; an absolute URL passes through;
/// a relative path is joined onto the base.
fn resolve_endpoint(base_url: &str, endpoint: Option<&str>) -> String {
    match endpoint {
        None => format!("{base_url}/chat/completions"),
        Some(e) if e.starts_with("http") => e.to_string(),
        Some(e) => format!("{}/{}", base_url, e.trim_start_matches('/')),
    }
}

/// Rewrite `model` through the mapping when a translation exists.
fn apply_model_mapping(body: &Value, mapping: &HashMap<String, String>) -> Value {
    let mut body = body.clone();
    if let Some(model) = body.get("model").and_then(Value::as_str) {
        if let Some(upstream_name) = mapping.get(model) {
            body["model"] = Value::String(upstream_name.clone());
        }
    }
    body
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &'static str {
        "openai-compatible"
    }

    async fn available(&self, now: i64) -> bool {
        !self.api_key.is_empty() && now >= self.rate_limited_until.load(Ordering::Relaxed)
    }

    async fn acquire(&self, _now: i64) -> Result<Lease, DispatchError> {
        if self.api_key.is_empty() {
            return Err(DispatchError::NoToken);
        }
        Ok(Lease::StaticKey)
    }

    async fn execute(
        &self,
        _lease: &Lease,
        body: &Value,
        endpoint: Option<&str>,
        accept: &str,
        stream: bool,
    ) -> Result<Reply, DispatchError> {
        let body = apply_model_mapping(body, &self.model_mapping);
        let url = resolve_endpoint(&self.base_url, endpoint);
        debug!(url, stream, "sending request to OpenAI-compatible upstream");

        let resp = self
            .client()?
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let text = resp.text().await.unwrap_or_default();
            warn!(body = %text, "rate limit hit");
            self.mark_rate_limited(Self::now());
            return Err(DispatchError::RateLimited);
        }

        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            if looks_rate_limited(&text) {
                warn!(status, "rate limit detected in error body");
                self.mark_rate_limited(Self::now());
                return Err(DispatchError::RateLimited);
            }
            warn!(status, body = %text, "upstream API error");
            return Err(DispatchError::Upstream { status, body: text });
        }

        if stream {
            let upstream = resp.bytes_stream().map_err(RelayFault::from);
            return Ok(Reply::Stream(relay_sse(upstream)));
        }

        let body: Value = resp
            .json()
            .await
            .map_err(|e| DispatchError::Parse(e.to_string()))?;
        let tokens = usage::response_tokens(&body);
        Ok(Reply::Json { body, tokens })
    }

    async fn models(&self) -> Result<Value, DispatchError> {
        let url = resolve_endpoint(&self.base_url, Some("models"));
        let resp = self
            .client()?
            .get(&url)
            .bearer_auth(&self.api_key)
            .header("Accept", "application/json")
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            self.mark_rate_limited(Self::now());
            return Err(DispatchError::RateLimited);
        }
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            return Err(DispatchError::Upstream { status, body: text });
        }

        resp.json()
            .await
            .map_err(|e| DispatchError::Parse(e.to_string()))
    }

    async fn on_rate_limit(&self, _lease: &Lease, now: i64) {
        self.mark_rate_limited(now);
    }
}
