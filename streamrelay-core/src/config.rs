use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::model::DIRECTIVE_PREAMBLE;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    /// Socket address the relay endpoint listens on.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Perplexity,
    OpenAI,
    Null,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    #[serde(default = "default_provider")]
    pub provider: ProviderKind,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
    /// Name of the environment variable that contains the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Ceiling on generated tokens; hitting it truncates the reply.
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    /// Overrides the built-in directive preamble.
    #[serde(default)]
    pub directive: Option<String>,
}

impl UpstreamCfg {
    pub fn directive(&self) -> &str {
        self.directive.as_deref().unwrap_or(DIRECTIVE_PREAMBLE)
    }
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            max_output_tokens: default_max_output_tokens(),
            directive: None,
        }
    }
}

fn default_provider() -> ProviderKind {
    ProviderKind::Perplexity
}
fn default_base_url() -> String {
    "https://api.perplexity.ai".to_string()
}
fn default_chat_path() -> String {
    "/chat/completions".to_string()
}
fn default_api_key_env() -> String {
    "PERPLEXITY_API_KEY".to_string()
}
fn default_model() -> String {
    "llama-3.1-sonar-large-128k-online".to_string()
}
fn default_max_output_tokens() -> u32 {
    1000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds. Unset means none: a streamed
    /// reply may legitimately take minutes.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
    /// Optional per-host idle connection pool cap (None = reqwest default)
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: None,
            pool_max_idle_per_host: None,
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ClientCfg {
    /// Full URL of the relay endpoint.
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
}

impl Default for ClientCfg {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
        }
    }
}

fn default_relay_url() -> String {
    "http://127.0.0.1:3000/api/chat".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub upstream: UpstreamCfg,
    /// HTTP client configuration (timeouts, pooling). Missing → defaults.
    #[serde(default)]
    pub http: HttpCfg,
    #[serde(default)]
    pub client: ClientCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::RelayError::from)?;
        let s =
            std::str::from_utf8(&bytes).map_err(|e| crate::error::RelayError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::RelayError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::RelayError::Other(e.into()))
                })?,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would make the relay unusable.
    pub fn validate(&self) -> crate::error::CoreResult<()> {
        if self.upstream.max_output_tokens == 0 {
            return Err(crate::error::RelayError::Validation(
                "upstream.max_output_tokens must be at least 1".into(),
            ));
        }
        if self.upstream.model.trim().is_empty() {
            return Err(crate::error::RelayError::Validation(
                "upstream.model must not be empty".into(),
            ));
        }
        Ok(())
    }
}
