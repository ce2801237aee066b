use async_trait::async_trait;
use futures::stream;

use crate::error::CoreResult;
use crate::model::{ChatRequest, StopReason};
use crate::stream::{BoxStreamEv, StreamEvent};

/// An upstream that turns a conversation into a stream of text fragments.
///
/// Establishment failures are returned as `Err`; failures after the stream
/// has started arrive as a terminal `StreamEvent::Error`.
#[async_trait]
pub trait ChatStreamProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv>;
}

/// Offline provider that streams a canned reply word by word.
/// Useful for local runs without an API key.
pub struct NullProvider;

impl NullProvider {
    pub const REPLY: &'static str = "## Null provider\nNo upstream is configured, so this canned reply was streamed instead.";
}

#[async_trait]
impl ChatStreamProvider for NullProvider {
    fn name(&self) -> &str {
        "null"
    }

    async fn chat_stream(&self, _req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let mut events: Vec<StreamEvent> = Self::REPLY
            .split_inclusive(' ')
            .map(|w| StreamEvent::DeltaText(w.to_string()))
            .collect();
        events.push(StreamEvent::Stop {
            reason: Some(StopReason::Stop),
        });
        Ok(Box::pin(stream::iter(events)))
    }
}
