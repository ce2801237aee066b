use std::sync::Arc;

use secrecy::SecretString;

use crate::config::{Config, ProviderKind};
use crate::error::{CoreResult, RelayError};
use crate::http_client::HttpClient;
use crate::provider::{ChatStreamProvider, NullProvider};
use crate::providers::openai_compat::OpenAiCompat;

impl ProviderKind {
    /// Name used in logs, telemetry and upstream error variants.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Perplexity => "perplexity",
            Self::OpenAI => "openai",
            Self::Null => "null",
        }
    }
}

/// Build the configured upstream, reading the API key from the environment
/// variable named by `upstream.api_key_env`.
pub fn from_config(cfg: &Config) -> CoreResult<Arc<dyn ChatStreamProvider>> {
    let api_key = std::env::var(&cfg.upstream.api_key_env)
        .ok()
        .filter(|k| !k.trim().is_empty());
    from_parts(cfg, api_key)
}

/// Build the configured upstream with an explicitly supplied API key.
pub fn from_parts(cfg: &Config, api_key: Option<String>) -> CoreResult<Arc<dyn ChatStreamProvider>> {
    let up = &cfg.upstream;
    match up.provider {
        ProviderKind::Null => Ok(Arc::new(NullProvider)),
        kind @ (ProviderKind::Perplexity | ProviderKind::OpenAI) => {
            let api_key = api_key.ok_or_else(|| {
                RelayError::Validation(format!(
                    "{} requires an API key in ${}",
                    kind.as_str(),
                    up.api_key_env
                ))
            })?;
            let http = HttpClient::from_cfg(&cfg.http)?;
            Ok(Arc::new(OpenAiCompat::new(
                http,
                kind.as_str(),
                SecretString::new(api_key.into_boxed_str()),
                up.base_url.clone(),
                up.chat_path.clone(),
            )))
        }
    }
}
