//! Routes requests across providers in priority order with automatic
//! failover. Rate-limit signals advance to the next candidate; after the
//! attempt budget the caller sees the exhaustion (or the last real upstream
//! error, whose body is relayed).

use std::time::Duration;

use chatmux_core::config::{ChatmuxConfig, ProviderConfig};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::copilot::CopilotProvider;
use crate::openai_compat::OpenAiCompatProvider;
use crate::provider::{DispatchError, Provider, Reply};

/// Attempt budget for one inbound request, shared across all providers.
pub const MAX_ATTEMPTS: u32 = 3;

pub struct ProviderRouter {
    /// Sorted ascending by priority at construction.
    providers: Vec<Box<dyn Provider>>,
}

impl ProviderRouter {
    /// `slots` is (priority, provider); disabled providers must already be
    /// filtered out by the caller.
    pub fn new(mut slots: Vec<(i32, Box<dyn Provider>)>) -> Self {
        slots.sort_by_key(|(priority, _)| *priority);
        Self {
            providers: slots.into_iter().map(|(_, p)| p).collect(),
        }
    }

    pub fn from_config(config: &ChatmuxConfig) -> Self {
        let timeout = Duration::from_secs(config.request_timeout);
        let mut slots: Vec<(i32, Box<dyn Provider>)> = Vec::new();

        for provider in &config.providers {
            if !provider.enabled() {
                continue;
            }
            match provider {
                ProviderConfig::GithubCopilot(c) => {
                    info!(accounts = c.accounts.len(), "initialized GitHub Copilot provider");
                    slots.push((c.priority, Box::new(CopilotProvider::new(c, timeout))));
                }
                ProviderConfig::OpenaiCompatible(c) => {
                    info!(base_url = %c.base_url, "initialized OpenAI-compatible provider");
                    slots.push((c.priority, Box::new(OpenAiCompatProvider::new(c, timeout))));
                }
            }
        }

        Self::new(slots)
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Run one request with failover.
    ///
    /// Streaming replies return as soon as the upstream starts producing —
    /// once the first byte is out there is no retry, faults become in-band
    /// SSE frames inside the relay.
    pub async fn dispatch(
        &self,
        body: &Value,
        endpoint: Option<&str>,
        accept: &str,
        stream: bool,
    ) -> Result<Reply, DispatchError> {
        let mut saw_rate_limit = false;
        let mut attempts: u32 = 0;
        let mut last_err: Option<DispatchError> = None;

        while attempts < MAX_ATTEMPTS {
            let mut attempted_this_round = false;

            for provider in &self.providers {
                if attempts >= MAX_ATTEMPTS {
                    break;
                }
                let now = chrono::Utc::now().timestamp();
                if !provider.available(now).await {
                    debug!(provider = provider.name(), "provider unavailable, skipping");
                    continue;
                }
                // Selecting a provider consumes one unit of the shared budget,
                // whether it fails at acquire or at execute.
                attempts += 1;
                attempted_this_round = true;

                let lease = match provider.acquire(now).await {
                    Ok(lease) => lease,
                    Err(e) => {
                        warn!(provider = provider.name(), err = %e, "failed to acquire credentials");
                        last_err = Some(e);
                        continue;
                    }
                };

                match provider.execute(&lease, body, endpoint, accept, stream).await {
                    Ok(reply) => {
                        if attempts > 1 {
                            info!(provider = provider.name(), attempts, "request succeeded after retry");
                        }
                        return Ok(reply);
                    }
                    Err(DispatchError::RateLimited) => {
                        saw_rate_limit = true;
                        last_err = Some(DispatchError::RateLimited);
                    }
                    Err(e) => {
                        warn!(provider = provider.name(), err = %e, "provider request failed");
                        last_err = Some(e);
                    }
                }
            }

            // Nothing usable this sweep — retrying immediately cannot help.
            if !attempted_this_round {
                break;
            }
        }

        if attempts == 0 {
            return Err(DispatchError::NoProvider);
        }
        if saw_rate_limit {
            return Err(DispatchError::Exhausted);
        }
        Err(last_err.unwrap_or(DispatchError::NoProvider))
    }

    /// Relay the model list from the first provider that can serve it.
    pub async fn list_models(&self) -> Result<Value, DispatchError> {
        let mut saw_rate_limit = false;
        let mut attempts: u32 = 0;
        let mut last_err: Option<DispatchError> = None;

        while attempts < MAX_ATTEMPTS {
            let mut attempted_this_round = false;

            for provider in &self.providers {
                if attempts >= MAX_ATTEMPTS {
                    break;
                }
                let now = chrono::Utc::now().timestamp();
                if !provider.available(now).await {
                    continue;
                }
                attempts += 1;
                attempted_this_round = true;

                match provider.models().await {
                    Ok(models) => return Ok(models),
                    Err(DispatchError::RateLimited) => {
                        saw_rate_limit = true;
                        last_err = Some(DispatchError::RateLimited);
                    }
                    Err(e) => {
                        warn!(provider = provider.name(), err = %e, "models request failed");
                        last_err = Some(e);
                    }
                }
            }

            if !attempted_this_round {
                break;
            }
        }

        if attempts == 0 {
            return Err(DispatchError::NoProvider);
        }
        if saw_rate_limit {
            return Err(DispatchError::Exhausted);
        }
        Err(last_err.unwrap_or(DispatchError::NoProvider))
    }
}
