//! One GitHub account: refresh credential, optional SOCKS5 proxy, cached
//! access token, and rate-limit state.
//!
//! Token flow: the long-lived refresh token is exchanged at
//! `copilot_internal/v2/token` for a short-lived access token, cached until
//! 60 s before expiry. A 401 (or a "Bad credentials" body) latches the
//! account out of rotation for the process lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chatmux_core::config::{AccountConfig, ProxyConfig, RateLimitWindow};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::limiter::{RateLimiter, EXTERNAL_LIMIT_SECS};
use crate::provider::DispatchError;

pub const GITHUB_TOKEN_URL: &str = "https://api.github.com/copilot_internal/v2/token";

pub(crate) const EDITOR_VERSION: &str = "vscode/1.95.3";

/// Tokens are treated as expired this many seconds early.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Short-lived bearer credential minted from the refresh token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: i64,
}

impl AccessToken {
    pub fn is_valid(&self, now: i64) -> bool {
        now + EXPIRY_SKEW_SECS < self.expires_at
    }
}

#[derive(Deserialize)]
struct TokenPayload {
    token: String,
    expires_at: i64,
}

/// Mutable per-account state, serialized under one lock. The lock is never
/// held across a network call — the refresh happens outside it and the new
/// token is swapped in afterwards, so callers only ever observe a complete
/// token.
struct AccountState {
    access_token: Option<AccessToken>,
    limiter: RateLimiter,
    last_used: i64,
}

pub struct Account {
    pub id: String,
    refresh_token: String,
    proxy: Option<ProxyConfig>,
    request_timeout: Duration,
    bad_credentials: AtomicBool,
    state: Mutex<AccountState>,
}

impl Account {
    pub fn new(
        config: &AccountConfig,
        windows: Vec<RateLimitWindow>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            id: config.id.clone(),
            refresh_token: config.token.clone(),
            proxy: config.proxy.clone(),
            request_timeout,
            bad_credentials: AtomicBool::new(false),
            state: Mutex::new(AccountState {
                access_token: None,
                limiter: RateLimiter::new(windows),
                last_used: 0,
            }),
        }
    }

    pub(crate) fn refresh_token(&self) -> &str {
        &self.refresh_token
    }

    pub fn has_bad_credentials(&self) -> bool {
        self.bad_credentials.load(Ordering::Relaxed)
    }

    pub fn is_rate_limited(&self, now: i64) -> bool {
        self.state.lock().unwrap().limiter.is_limited(now)
    }

    /// An account with no token yet is still usable — one is minted lazily.
    pub fn is_usable(&self, now: i64) -> bool {
        !self.has_bad_credentials() && !self.is_rate_limited(now)
    }

    pub fn record_request(&self, now: i64) {
        self.state.lock().unwrap().limiter.record(now);
    }

    pub fn mark_rate_limited(&self, now: i64, duration_secs: u64) {
        self.state.lock().unwrap().limiter.mark_external(now, duration_secs);
        warn!(account = %self.id, duration_secs, "account marked rate limited");
    }

    pub fn mark_rate_limited_default(&self, now: i64) {
        self.mark_rate_limited(now, EXTERNAL_LIMIT_SECS);
    }

    pub fn touch(&self, now: i64) {
        self.state.lock().unwrap().last_used = now;
    }

    /// Fresh client per request-response pair, routed through this account's
    /// SOCKS5 proxy when one is configured. Clients are never shared across
    /// accounts (distinct proxy identities).
    pub fn http_client(&self) -> Result<reqwest::Client, DispatchError> {
        let mut builder = reqwest::Client::builder().timeout(self.request_timeout);
        if let Some(proxy) = &self.proxy {
            builder = builder.proxy(reqwest::Proxy::all(proxy.url())?);
        }
        Ok(builder.build()?)
    }

    /// Return the cached token, refreshing when missing or near expiry.
    ///
    /// Concurrent callers may race into the refresh; the exchange is
    /// idempotent and the winner's token simply lands last.
    pub async fn access_token(&self, now: i64) -> Result<AccessToken, DispatchError> {
        if self.has_bad_credentials() {
            return Err(DispatchError::BadCredentials);
        }

        {
            let state = self.state.lock().unwrap();
            if let Some(token) = &state.access_token {
                if token.is_valid(now) {
                    return Ok(token.clone());
                }
            }
        }

        info!(account = %self.id, "minting fresh access token");
        let minted = self.refresh().await?;
        debug!(account = %self.id, expires_at = minted.expires_at, "access token updated");

        let mut state = self.state.lock().unwrap();
        state.access_token = Some(minted.clone());
        Ok(minted)
    }

    async fn refresh(&self) -> Result<AccessToken, DispatchError> {
        let client = self.http_client()?;
        let resp = client
            .get(GITHUB_TOKEN_URL)
            .header("Authorization", format!("token {}", self.refresh_token))
            .header("editor-version", EDITOR_VERSION)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 200 {
            let payload: TokenPayload = resp
                .json()
                .await
                .map_err(|e| DispatchError::Parse(e.to_string()))?;
            return Ok(AccessToken {
                token: payload.token,
                expires_at: payload.expires_at,
            });
        }

        let body = resp.text().await.unwrap_or_default();
        if status == 401 || body.contains("Bad credentials") {
            self.bad_credentials.store(true, Ordering::Relaxed);
            warn!(account = %self.id, "bad credentials, dropping account from rotation");
            return Err(DispatchError::BadCredentials);
        }

        warn!(account = %self.id, status, body = %body, "token refresh failed");
        Err(DispatchError::RefreshFailed { status, body })
    }
}
