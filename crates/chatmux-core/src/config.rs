use std::collections::HashMap;

use figment::{
    providers::{Env, Format, Json},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 9377;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Top-level config (chatmux.json + CHATMUX_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatmuxConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound in seconds for every upstream HTTP call.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

impl Default for ChatmuxConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            providers: Vec::new(),
        }
    }
}

/// One upstream provider entry. The `type` field selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ProviderConfig {
    GithubCopilot(CopilotProviderConfig),
    OpenaiCompatible(OpenAiCompatConfig),
}

impl ProviderConfig {
    pub fn priority(&self) -> i32 {
        match self {
            ProviderConfig::GithubCopilot(c) => c.priority,
            ProviderConfig::OpenaiCompatible(c) => c.priority,
        }
    }

    pub fn enabled(&self) -> bool {
        match self {
            ProviderConfig::GithubCopilot(c) => c.enabled,
            ProviderConfig::OpenaiCompatible(c) => c.enabled,
        }
    }
}

/// GitHub Copilot provider — a pool of accounts, each holding a long-lived
/// refresh token exchanged for short-lived access tokens at runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopilotProviderConfig {
    #[serde(default = "default_copilot_priority")]
    pub priority: i32,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Sliding windows applied to every account that has no override of its own.
    #[serde(default = "default_rate_limit_windows")]
    pub rate_limits: Vec<RateLimitWindow>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Any OpenAI-compatible endpoint reached with a static bearer key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiCompatConfig {
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_compat_priority")]
    pub priority: i32,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Rewrites the public model name to the upstream one before dispatch.
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
}

/// One GitHub account: refresh token plus optional SOCKS5 proxy and
/// per-account rate-limit windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountConfig {
    pub id: String,
    /// Long-lived refresh token (`gho_...`).
    pub token: String,
    #[serde(default)]
    pub proxy: Option<ProxyConfig>,
    /// Overrides the provider-level windows when set.
    #[serde(default)]
    pub rate_limits: Option<Vec<RateLimitWindow>>,
}

/// SOCKS5 proxy settings for a single account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyConfig {
    /// socks5:// URL with inline credentials when both are configured.
    pub fn url(&self) -> String {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => {
                format!("socks5://{}:{}@{}:{}", user, pass, self.host, self.port)
            }
            _ => format!("socks5://{}:{}", self.host, self.port),
        }
    }
}

/// `(duration, max_requests)` pair for the sliding-window limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitWindow {
    /// Window length in seconds.
    pub duration: u64,
    pub max_requests: u32,
}

pub fn default_rate_limit_windows() -> Vec<RateLimitWindow> {
    vec![
        RateLimitWindow { duration: 10, max_requests: 2 },
        RateLimitWindow { duration: 60, max_requests: 10 },
        RateLimitWindow { duration: 3600, max_requests: 40 },
    ]
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_request_timeout() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}
fn default_copilot_priority() -> i32 {
    1
}
fn default_compat_priority() -> i32 {
    2
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

impl ChatmuxConfig {
    /// Load config from a JSON file with CHATMUX_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ./chatmux.json
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path.unwrap_or("chatmux.json");

        let config: ChatmuxConfig = Figment::new()
            .merge(Json::file(path))
            .merge(Env::prefixed("CHATMUX_"))
            .extract()
            .map_err(|e| crate::error::ChatmuxError::Config(e.to_string()))?;

        Ok(config)
    }
}
