use serde::{Deserialize, Serialize};

/// How a relayed exchange ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeOutcome {
    /// Upstream finished and the body was closed cleanly.
    #[default]
    Completed,
    /// Failed before any byte reached the caller; a 500 was sent.
    FailedBeforeFlush,
    /// Failed after bytes were flushed; the body was aborted.
    FailedMidStream,
    /// The caller went away before the upstream finished.
    Abandoned,
}

/// Provider-agnostic record of one relayed exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExchangeTrace {
    /// Relay-generated id for the request.
    pub request_id: Option<String>,

    /// Provider identifier, e.g. "perplexity".
    pub provider: Option<String>,

    /// Model identifier sent upstream.
    pub model: Option<String>,

    /// Conversation turns received from the caller (preamble excluded).
    pub turns: usize,

    /// Non-empty fragments forwarded, and their total size in bytes.
    pub fragments: u64,
    pub bytes: u64,

    pub latency_ms: Option<u64>,
    pub outcome: ExchangeOutcome,

    /// Normalized stop reason ("stop", "length", ...).
    pub finish_reason: Option<String>,

    /// Error metadata. Never sent to the caller.
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

impl ExchangeTrace {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn request_id(mut self, rid: &str) -> Self {
        self.request_id = Some(rid.to_string());
        self
    }
    pub fn provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }
    pub fn model(mut self, model: &str) -> Self {
        self.model = Some(model.to_string());
        self
    }
    pub fn latency_ms(mut self, ms: u64) -> Self {
        self.latency_ms = Some(ms);
        self
    }
    pub fn finish_reason_opt(mut self, reason: Option<&str>) -> Self {
        self.finish_reason = reason.map(|s| s.to_string());
        self
    }

    /// Count one forwarded fragment.
    pub fn record_fragment(&mut self, len: usize) {
        self.fragments += 1;
        self.bytes += len as u64;
    }

    /// Mark the exchange failed, choosing the outcome from whether anything was flushed.
    pub fn record_error(&mut self, err: &crate::error::RelayError) {
        self.outcome = if self.fragments == 0 {
            ExchangeOutcome::FailedBeforeFlush
        } else {
            ExchangeOutcome::FailedMidStream
        };
        self.error_kind = Some(err.kind().to_string());
        self.error_message = Some(err.to_string());
    }
}
