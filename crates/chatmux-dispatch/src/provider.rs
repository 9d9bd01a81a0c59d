//! Common interface over the upstream provider kinds.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::account::{AccessToken, Account};

/// Lazy byte sequence produced by the stream relay. Yields raw SSE chunks on
/// demand without materializing the response.
pub type ByteStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

/// What `execute` hands back on success.
pub enum Reply {
    /// Full JSON body plus the token count extracted from it.
    Json { body: serde_json::Value, tokens: u64 },
    /// Relayed SSE stream; bytes flow as the upstream produces them.
    Stream(ByteStream),
}

/// Authentication handle for one dispatch, produced by `acquire`.
/// Copilot leases pin the selected account; compat providers carry a static key.
pub enum Lease {
    Account {
        account: Arc<Account>,
        token: AccessToken,
    },
    StaticKey,
}

/// Common interface for all upstream providers (Copilot, OpenAI-compatible).
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider name for logging and error messages.
    fn name(&self) -> &'static str;

    /// Whether the provider can currently take a request.
    async fn available(&self, now: i64) -> bool;

    /// Select credentials for one request and record it against any
    /// per-account rate limits.
    async fn acquire(&self, now: i64) -> Result<Lease, DispatchError>;

    /// Run the request. `endpoint: None` targets the provider's chat
    /// completions URL; a relative path is resolved against its base.
    async fn execute(
        &self,
        lease: &Lease,
        body: &serde_json::Value,
        endpoint: Option<&str>,
        accept: &str,
        stream: bool,
    ) -> Result<Reply, DispatchError>;

    /// Relay the upstream model list.
    async fn models(&self) -> Result<serde_json::Value, DispatchError>;

    /// React to an upstream rate-limit signal for the given lease.
    async fn on_rate_limit(&self, lease: &Lease, now: i64);
}

/// Upstreams sometimes report limits as plain errors rather than 429s.
pub(crate) fn looks_rate_limited(body: &str) -> bool {
    body.to_lowercase().contains("rate")
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("no access token available")]
    NoToken,

    #[error("bad credentials")]
    BadCredentials,

    #[error("token refresh failed ({status}): {body}")]
    RefreshFailed { status: u16, body: String },

    #[error("rate limited upstream")]
    RateLimited,

    #[error("upstream error ({status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("no provider available")]
    NoProvider,

    #[error("all providers exhausted on rate limits")]
    Exhausted,
}
