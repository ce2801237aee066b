//! Streaming primitives produced by upstream providers.
//!
//! Contract:
//! - Providers emit 0..n `DeltaText` / `Metadata` events.
//! - The stream ends either with exactly one terminal event (`Stop` or `Error`)
//!   or simply by running out; running out counts as a normal completion.
//! - After a terminal event, no further events are emitted.
//!
//! `Error` carries `RelayError`, which is not `Clone`, so neither is this enum.

/// One unit of upstream output.
#[non_exhaustive]
#[derive(Debug)]
pub enum StreamEvent {
    /// Partial assistant text.
    DeltaText(String),
    /// A unit carrying no text (role announcement, usage, citations...).
    Metadata,
    /// Provider finished generating.
    Stop {
        reason: Option<crate::model::StopReason>,
    },
    /// Transport/parse error surfaced mid-stream; stream ends after this.
    Error(crate::error::RelayError),
}

impl StreamEvent {
    /// Returns true if this event terminates the stream (`Stop` or `Error`).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stop { .. } | Self::Error(_))
    }

    /// Text carried by this unit; empty for every non-text unit.
    pub fn text_delta(&self) -> &str {
        match self {
            Self::DeltaText(s) => s.as_str(),
            _ => "",
        }
    }
}

/// Boxed stream of streaming events. Providers return this.
pub type BoxStreamEv = futures::stream::BoxStream<'static, StreamEvent>;
