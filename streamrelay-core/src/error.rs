use thiserror::Error;

/// Core error type for streamrelay.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// Request body did not parse into the expected shape.
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    #[error("rate limited by provider {provider}")]
    RateLimited {
        provider: String,
        retry_after: Option<u64>,
    },

    #[error("provider unavailable: {provider}")]
    ProviderUnavailable { provider: String },

    #[error("upstream error from {provider}: {code} {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    /// Client side: the relay request or its body stream failed.
    #[error("transport failure: {0}")]
    Transport(String),

    /// An exchange is already in flight on this consumer.
    #[error("an exchange is already in flight")]
    Busy,

    /// Input was empty or whitespace only.
    #[error("input is empty")]
    EmptyInput,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RelayError {
    /// Stable short name used in logs and telemetry (`error.kind`).
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::MalformedRequest(_) => "malformed_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::ProviderError { .. } => "provider_error",
            Self::Transport(_) => "transport",
            Self::Busy => "busy",
            Self::EmptyInput => "empty_input",
            Self::Io(_) => "io",
            Self::Other(_) => "other",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable() {
        assert_eq!(RelayError::Busy.kind(), "busy");
        assert_eq!(
            RelayError::ProviderUnavailable { provider: "perplexity".into() }.kind(),
            "provider_unavailable"
        );
        let io: RelayError = std::io::Error::other("boom").into();
        assert_eq!(io.kind(), "io");
    }

    #[test]
    fn display_keeps_provider_detail() {
        let err = RelayError::ProviderError {
            provider: "perplexity".into(),
            code: "400".into(),
            message: "bad model".into(),
        };
        assert_eq!(err.to_string(), "upstream error from perplexity: 400 bad model");
    }
}
