//! GitHub Copilot provider.
//!
//! Serves requests from a pool of accounts in round-robin rotation. Each
//! dispatch leases one account, mints/fetches its access token, and records
//! the request against the account's sliding windows. Outgoing requests carry
//! the editor headers Copilot expects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chatmux_core::config::CopilotProviderConfig;
use futures_util::TryStreamExt;
use tracing::{debug, warn};

use crate::account::{Account, EDITOR_VERSION};
use crate::pool::AccountPool;
use crate::provider::{looks_rate_limited, DispatchError, Lease, Provider, Reply};
use crate::relay::{relay_sse, RelayFault};
use crate::usage;

pub const CHAT_COMPLETIONS_URL: &str =
    "https://api.individual.githubcopilot.com/chat/completions";
pub const MODELS_URL: &str = "https://api.individual.githubcopilot.com/models";

const EDITOR_PLUGIN_VERSION: &str = "github.copilot/1.277.0";
const USER_AGENT: &str = "GithubCopilot/1.155.0";

pub struct CopilotProvider {
    pool: AccountPool,
}

impl CopilotProvider {
    pub fn new(config: &CopilotProviderConfig, request_timeout: Duration) -> Self {
        let pool = AccountPool::new();
        for account in &config.accounts {
            let windows = account
                .rate_limits
                .clone()
                .unwrap_or_else(|| config.rate_limits.clone());
            pool.add(Arc::new(Account::new(account, windows, request_timeout)));
        }
        Self { pool }
    }

    pub fn pool(&self) -> &AccountPool {
        &self.pool
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }
}

#[async_trait]
impl Provider for CopilotProvider {
    fn name(&self) -> &'static str {
        "github-copilot"
    }

    async fn available(&self, now: i64) -> bool {
        self.pool.has_usable(now)
    }

    async fn acquire(&self, now: i64) -> Result<Lease, DispatchError> {
        let account = self.pool.next_usable(now).ok_or(DispatchError::NoProvider)?;
        let token = account.access_token(now).await?;
        account.record_request(now);
        Ok(Lease::Account { account, token })
    }

    async fn execute(
        &self,
        lease: &Lease,
        body: &serde_json::Value,
        endpoint: Option<&str>,
        accept: &str,
        stream: bool,
    ) -> Result<Reply, DispatchError> {
        let Lease::Account { account, token } = lease else {
            return Err(DispatchError::NoToken);
        };

        let url = endpoint.unwrap_or(CHAT_COMPLETIONS_URL);
        debug!(account = %account.id, url, stream, "sending request to GitHub Copilot");

        let client = account.http_client()?;
        let resp = client
            .post(url)
            .bearer_auth(&token.token)
            .header("Content-Type", "application/json")
            .header("Accept", accept)
            .header("editor-version", EDITOR_VERSION)
            .header("editor-plugin-version", EDITOR_PLUGIN_VERSION)
            .header("user-agent", USER_AGENT)
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            let text = resp.text().await.unwrap_or_default();
            warn!(account = %account.id, body = %text, "Copilot rate limit hit");
            self.on_rate_limit(lease, Self::now()).await;
            return Err(DispatchError::RateLimited);
        }

        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            if looks_rate_limited(&text) {
                warn!(account = %account.id, status, "rate limit detected in error body");
                self.on_rate_limit(lease, Self::now()).await;
                return Err(DispatchError::RateLimited);
            }
            warn!(account = %account.id, status, body = %text, "Copilot API error");
            return Err(DispatchError::Upstream { status, body: text });
        }

        if stream {
            let upstream = resp.bytes_stream().map_err(RelayFault::from);
            return Ok(Reply::Stream(relay_sse(upstream)));
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| DispatchError::Parse(e.to_string()))?;
        let tokens = usage::response_tokens(&body);
        Ok(Reply::Json { body, tokens })
    }

    async fn models(&self) -> Result<serde_json::Value, DispatchError> {
        let now = Self::now();
        let account = self.pool.next_usable(now).ok_or(DispatchError::NoProvider)?;
        let token = account.access_token(now).await?;

        debug!(account = %account.id, "fetching Copilot model list");
        let client = account.http_client()?;
        let resp = client
            .get(MODELS_URL)
            .bearer_auth(&token.token)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .header("editor-version", EDITOR_VERSION)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if status == 429 {
            account.mark_rate_limited_default(Self::now());
            return Err(DispatchError::RateLimited);
        }
        if status != 200 {
            let text = resp.text().await.unwrap_or_default();
            if looks_rate_limited(&text) {
                account.mark_rate_limited_default(Self::now());
                return Err(DispatchError::RateLimited);
            }
            return Err(DispatchError::Upstream { status, body: text });
        }

        resp.json()
            .await
            .map_err(|e| DispatchError::Parse(e.to_string()))
    }

    async fn on_rate_limit(&self, lease: &Lease, now: i64) {
        if let Lease::Account { account, .. } = lease {
            account.mark_rate_limited_default(now);
        }
    }
}
