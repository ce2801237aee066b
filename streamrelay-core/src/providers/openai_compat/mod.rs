use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::{CoreResult, RelayError};
use crate::http_client::{HttpClient, RequestCtx, SseLine, SseStream};
use crate::model::{ChatMessage, ChatRequest, StopReason};
use crate::provider::ChatStreamProvider;
use crate::stream::{BoxStreamEv, StreamEvent};

/// Any upstream speaking the OpenAI chat-completions streaming dialect
/// (Perplexity, OpenAI, and most hosted gateways).
#[derive(Debug, Clone)]
pub struct OpenAiCompat {
    http: HttpClient,
    name: String, // "perplexity", "openai", ...
    base: String,
    chat_path: String,
    api_key: SecretString,
}

impl OpenAiCompat {
    pub fn new(
        http: HttpClient,
        name: impl Into<String>,
        api_key: SecretString,
        base: String,
        chat_path: String,
    ) -> Self {
        Self {
            http,
            name: name.into(),
            api_key,
            base: base.trim_end_matches('/').to_string(),
            chat_path,
        }
    }

    #[cfg(test)]
    pub fn new_for_tests(server_base: &str) -> Self {
        OpenAiCompat::new(
            HttpClient::new_default().unwrap(),
            "perplexity",
            SecretString::new("test-key".into()),
            server_base.to_string(),
            "/chat/completions".to_string(),
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        vec![
            (
                "Authorization".to_string(),
                format!("Bearer {}", self.api_key.expose_secret()),
            ),
            ("Content-Type".to_string(), "application/json".to_string()),
        ]
    }
}

// ---- Wire structs (minimal) ----
#[derive(Serialize)]
struct OAStreamReq<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct OAChunk {
    #[serde(default)]
    choices: Vec<OAChunkChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct OAChunkChoice {
    #[serde(default)]
    delta: Option<OADelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OADelta {
    #[serde(default)]
    content: Option<String>,
}

fn map_finish(s: Option<&str>) -> Option<StopReason> {
    match s {
        Some("stop") => Some(StopReason::Stop),
        Some("length") => Some(StopReason::Length),
        Some("content_filter") => Some(StopReason::ContentFilter),
        Some(_) => Some(StopReason::Other),
        None => None,
    }
}

/// One classified SSE line.
enum SseItem {
    Ignore,
    Done,
    Chunk(OAChunk),
    Invalid(String),
}

fn parse_sse_line(line: &str) -> SseItem {
    let line = line.trim_end();
    let Some(payload) = line.strip_prefix("data:") else {
        // blank separators, comments, event:/id:/retry: fields
        return SseItem::Ignore;
    };
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload == "[DONE]" {
        return SseItem::Done;
    }
    match serde_json::from_str::<OAChunk>(payload) {
        Ok(chunk) => SseItem::Chunk(chunk),
        Err(e) => SseItem::Invalid(format!("chunk decode error: {e}")),
    }
}

struct SseState {
    provider: String,
    lines: SseStream,
    pending: VecDeque<StreamEvent>,
    finish: Option<StopReason>,
    done: bool,
}

impl SseState {
    fn absorb(&mut self, SseLine { line }: SseLine) {
        match parse_sse_line(&line) {
            SseItem::Ignore => {}
            SseItem::Done => self.pending.push_back(StreamEvent::Stop {
                reason: self.finish,
            }),
            SseItem::Invalid(message) => {
                self.pending
                    .push_back(StreamEvent::Error(RelayError::ProviderError {
                        provider: self.provider.clone(),
                        code: "stream".into(),
                        message,
                    }))
            }
            SseItem::Chunk(OAChunk {
                error: Some(err), ..
            }) => self
                .pending
                .push_back(StreamEvent::Error(RelayError::ProviderError {
                    provider: self.provider.clone(),
                    code: "stream".into(),
                    message: err.to_string(),
                })),
            SseItem::Chunk(chunk) => {
                let choice = chunk.choices.into_iter().next();
                let finish = choice
                    .as_ref()
                    .and_then(|c| map_finish(c.finish_reason.as_deref()));
                if finish.is_some() {
                    self.finish = finish;
                }
                match choice.and_then(|c| c.delta).and_then(|d| d.content) {
                    Some(text) if !text.is_empty() => {
                        self.pending.push_back(StreamEvent::DeltaText(text))
                    }
                    _ => self.pending.push_back(StreamEvent::Metadata),
                }
            }
        }
    }

    async fn next_event(mut self) -> Option<(StreamEvent, Self)> {
        loop {
            if let Some(ev) = self.pending.pop_front() {
                if ev.is_terminal() {
                    self.done = true;
                    self.pending.clear();
                }
                return Some((ev, self));
            }
            if self.done {
                return None;
            }
            match self.lines.next().await {
                Some(Ok(line)) => self.absorb(line),
                Some(Err(e)) => self.pending.push_back(StreamEvent::Error(e)),
                // a body that ends without [DONE] still counts as completion
                None => self.pending.push_back(StreamEvent::Stop {
                    reason: self.finish,
                }),
            }
        }
    }
}

#[async_trait]
impl ChatStreamProvider for OpenAiCompat {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let payload = OAStreamReq {
            model: &req.model,
            messages: &req.messages,
            stream: true,
            max_tokens: req.max_output_tokens,
        };
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let owned_headers = self.headers();
        let hdrs: Vec<(&str, &str)> = owned_headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let url = format!("{}{}", self.base, self.chat_path);
        tracing::debug!(provider = %self.name, model = %req.model, messages = req.messages.len(), "opening upstream stream");
        let lines = self
            .http
            .post_sse_lines(&self.name, &url, &payload, &hdrs, &ctx)
            .await?;

        let state = SseState {
            provider: self.name.clone(),
            lines,
            pending: VecDeque::new(),
            finish: None,
            done: false,
        };
        Ok(stream::unfold(state, SseState::next_event).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::POST;
    use httpmock::MockServer;
    use serde_json::json;

    use crate::model::Turn;

    fn req(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            model: "llama-3.1-sonar-large-128k-online".into(),
            messages,
            max_output_tokens: 1000,
            request_id: Some("req-1".into()),
        }
    }

    fn sse(chunks: &[serde_json::Value], done: bool) -> String {
        let mut body = String::new();
        for c in chunks {
            body.push_str(&format!("data: {c}\n\n"));
        }
        if done {
            body.push_str("data: [DONE]\n\n");
        }
        body
    }

    fn delta(content: &str) -> serde_json::Value {
        json!({"id":"c1","object":"chat.completion.chunk","choices":[{"index":0,"delta":{"content":content},"finish_reason":null}]})
    }

    async fn collect(mut s: BoxStreamEv) -> Vec<StreamEvent> {
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn streams_deltas_then_stop() {
        let server = MockServer::start();
        let provider = OpenAiCompat::new_for_tests(&server.base_url());
        let body = sse(
            &[
                json!({"choices":[{"index":0,"delta":{"role":"assistant"}}]}),
                delta("Hel"),
                delta("lo"),
                json!({"choices":[{"index":0,"delta":{"content":"!"},"finish_reason":"stop"}],"citations":["https://example.com"]}),
            ],
            true,
        );
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer test-key")
                .json_body_partial(r#"{"stream":true,"max_tokens":1000}"#);
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(body);
        });

        let events = collect(
            provider
                .chat_stream(req(vec![ChatMessage::from(Turn::user("hi"))]))
                .await
                .expect("stream ok"),
        )
        .await;
        m.assert();

        let text: String = events.iter().map(|e| e.text_delta()).collect();
        assert_eq!(text, "Hello!");
        assert!(matches!(events[0], StreamEvent::Metadata));
        match events.last() {
            Some(StreamEvent::Stop { reason }) => assert_eq!(*reason, Some(StopReason::Stop)),
            other => panic!("expected Stop, got {other:?}"),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn request_carries_full_message_list_in_order() {
        let server = MockServer::start();
        let provider = OpenAiCompat::new_for_tests(&server.base_url());
        let m = server.mock(|when, then| {
            when.method(POST).path("/chat/completions").json_body_partial(
                r#"{"messages":[
                    {"role":"system","content":"sys"},
                    {"role":"user","content":"a"},
                    {"role":"assistant","content":"b"}
                ]}"#,
            );
            then.status(200).body(sse(&[delta("ok")], true));
        });
        let messages = vec![
            ChatMessage::system("sys"),
            Turn::user("a").into(),
            Turn::assistant("b").into(),
        ];
        let events = collect(provider.chat_stream(req(messages)).await.unwrap()).await;
        m.assert();
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn length_finish_without_done_is_normal_completion() {
        let server = MockServer::start();
        let provider = OpenAiCompat::new_for_tests(&server.base_url());
        let body = sse(
            &[
                delta("cut"),
                json!({"choices":[{"index":0,"delta":{},"finish_reason":"length"}]}),
            ],
            false,
        );
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body(body);
        });
        let events = collect(provider.chat_stream(req(vec![])).await.unwrap()).await;
        match events.last() {
            Some(StreamEvent::Stop { reason }) => assert_eq!(*reason, Some(StopReason::Length)),
            other => panic!("expected Stop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn garbage_line_terminates_with_error() {
        let server = MockServer::start();
        let provider = OpenAiCompat::new_for_tests(&server.base_url());
        let body = format!("{}data: {{not json\n\n{}", sse(&[delta("a")], false), sse(&[delta("never")], true));
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body(body);
        });
        let events = collect(provider.chat_stream(req(vec![])).await.unwrap()).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].text_delta(), "a");
        match &events[1] {
            StreamEvent::Error(RelayError::ProviderError { code, message, .. }) => {
                assert_eq!(code, "stream");
                assert!(message.starts_with("chunk decode error"));
            }
            other => panic!("expected Error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn in_band_error_object_is_an_error_event() {
        let server = MockServer::start();
        let provider = OpenAiCompat::new_for_tests(&server.base_url());
        let body = sse(&[json!({"error":{"message":"overloaded"}})], false);
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(200).body(body);
        });
        let events = collect(provider.chat_stream(req(vec![])).await.unwrap()).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], StreamEvent::Error(_)));
    }

    #[tokio::test]
    async fn unauthorized_fails_before_streaming() {
        let server = MockServer::start();
        let provider = OpenAiCompat::new_for_tests(&server.base_url());
        let _m = server.mock(|when, then| {
            when.method(POST).path("/chat/completions");
            then.status(401).body("bad key");
        });
        let err = provider.chat_stream(req(vec![])).await.err().expect("should fail");
        match err {
            RelayError::ProviderError { provider, code, .. } => {
                assert_eq!(provider, "perplexity");
                assert_eq!(code, "401");
            }
            other => panic!("expected ProviderError, got: {:?}", other),
        }
    }

    #[test]
    fn sse_line_classification() {
        assert!(matches!(parse_sse_line(""), SseItem::Ignore));
        assert!(matches!(parse_sse_line(": keep-alive"), SseItem::Ignore));
        assert!(matches!(parse_sse_line("event: message"), SseItem::Ignore));
        assert!(matches!(parse_sse_line("data: [DONE]"), SseItem::Done));
        assert!(matches!(parse_sse_line("data:[DONE]\r"), SseItem::Done));
        assert!(matches!(parse_sse_line(r#"data: {"choices":[]}"#), SseItem::Chunk(_)));
        assert!(matches!(parse_sse_line("data: nope"), SseItem::Invalid(_)));
    }

    #[test]
    fn finish_reason_matrix() {
        assert_eq!(map_finish(Some("stop")), Some(StopReason::Stop));
        assert_eq!(map_finish(Some("length")), Some(StopReason::Length));
        assert_eq!(map_finish(Some("content_filter")), Some(StopReason::ContentFilter));
        assert_eq!(map_finish(Some("weird_reason")), Some(StopReason::Other));
        assert_eq!(map_finish(None), None);
    }
}
