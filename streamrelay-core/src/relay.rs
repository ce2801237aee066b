//! Relay endpoint: accepts a conversation, forwards it upstream with the
//! directive preamble in front, and streams the reply back as plain
//! chunked text.
//!
//! The handler reads ahead until the first non-empty fragment (or a
//! terminal unit) before answering, so failures that happen before any
//! output still produce a 500. Failures after that abort the body.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::Span;
use tracing::field::Empty;
use tracing_futures::Instrument;

use crate::config::UpstreamCfg;
use crate::error::{CoreResult, RelayError};
use crate::model::{ChatMessage, ChatRequest, ErrorBody, RelayRequest, StopReason, Turn};
use crate::provider::ChatStreamProvider;
use crate::stream::{BoxStreamEv, StreamEvent};
use crate::telemetry::{
    self, ExchangeOutcome, ExchangeTrace, KEY_BYTES, KEY_ERROR_KIND, KEY_FINISH_REASON,
    KEY_FRAGMENTS, KEY_TURN_COUNT,
};

static NEXT_REQUEST: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> String {
    format!("relay-{}", NEXT_REQUEST.fetch_add(1, Ordering::Relaxed))
}

/// Per-process settings applied to every outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    pub model: String,
    pub max_output_tokens: u32,
    pub directive: String,
}

impl RelaySettings {
    pub fn from_config(up: &UpstreamCfg) -> Self {
        Self {
            model: up.model.clone(),
            max_output_tokens: up.max_output_tokens,
            directive: up.directive().to_string(),
        }
    }
}

/// Shared, immutable handler state.
#[derive(Clone)]
pub struct RelayState {
    provider: Arc<dyn ChatStreamProvider>,
    settings: Arc<RelaySettings>,
}

impl RelayState {
    pub fn new(provider: Arc<dyn ChatStreamProvider>, settings: RelaySettings) -> Self {
        Self {
            provider,
            settings: Arc::new(settings),
        }
    }
}

pub fn router(state: RelayState) -> Router {
    Router::new()
        .route("/api/chat", post(relay_chat))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the relay on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: RelayState, shutdown: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(addr = %addr, "relay listening");
    }
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("relay stopped");
    Ok(())
}

/// Outbound message list: the directive first, then the turns in order.
pub fn build_outbound(directive: &str, turns: Vec<Turn>) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(turns.len() + 1);
    out.push(ChatMessage::system(directive));
    out.extend(turns.into_iter().map(ChatMessage::from));
    out
}

/// Every failure the caller can observe. Carries no detail on purpose:
/// upstream errors stay in logs and telemetry.
struct RelayFailure;

impl IntoResponse for RelayFailure {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorBody::generic())).into_response()
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn relay_chat(State(state): State<RelayState>, body: Bytes) -> Response {
    let started = Instant::now();
    let rid = next_request_id();
    let span = tracing::info_span!(
        "relay.exchange",
        req.id = %rid,
        llm.provider = state.provider.name(),
        llm.model = %state.settings.model,
        turn.count = Empty,
        fragments = Empty,
        bytes = Empty,
        finish.reason = Empty,
        error.kind = Empty,
    );
    let mut trace = ExchangeTrace::new()
        .request_id(&rid)
        .provider(state.provider.name())
        .model(&state.settings.model);

    let opened = open_exchange(&state, &body, &rid, &span, &mut trace)
        .instrument(span.clone())
        .await;

    match opened {
        Ok((events, lead)) => {
            let body = BodyState {
                events,
                lead: Some(lead),
                trace: Some(trace),
                span: span.clone(),
                started,
            };
            let chunks = stream::unfold(body, BodyState::next_chunk).instrument(span);
            (
                [
                    (header::CONTENT_TYPE, "text/plain"),
                    (header::TRANSFER_ENCODING, "chunked"),
                ],
                Body::from_stream(chunks),
            )
                .into_response()
        }
        Err(err) => {
            trace.record_error(&err);
            span.record(KEY_ERROR_KIND, err.kind());
            span.in_scope(|| tracing::error!(error = %err, "exchange failed before any output"));
            telemetry::emit(trace.latency_ms(elapsed_ms(started)));
            RelayFailure.into_response()
        }
    }
}

/// Parse the request, open the upstream and read ahead to the first
/// fragment. Returns the stream together with the unit that was read.
async fn open_exchange(
    state: &RelayState,
    body: &[u8],
    rid: &str,
    span: &Span,
    trace: &mut ExchangeTrace,
) -> CoreResult<(BoxStreamEv, StreamEvent)> {
    let req: RelayRequest =
        serde_json::from_slice(body).map_err(|e| RelayError::MalformedRequest(e.to_string()))?;
    let turns = req.messages.len();
    span.record(KEY_TURN_COUNT, turns);
    trace.turns = turns;
    tracing::debug!(turns, "relaying conversation");

    let chat = ChatRequest {
        model: state.settings.model.clone(),
        messages: build_outbound(&state.settings.directive, req.messages),
        max_output_tokens: state.settings.max_output_tokens,
        request_id: Some(rid.to_string()),
    };
    let mut events = state.provider.chat_stream(chat).await?;

    loop {
        let next = events.next().await;
        match next {
            Some(StreamEvent::Error(err)) => return Err(err),
            Some(ev @ StreamEvent::Stop { .. }) => return Ok((events, ev)),
            Some(StreamEvent::DeltaText(text)) if !text.is_empty() => {
                return Ok((events, StreamEvent::DeltaText(text)));
            }
            Some(_) => continue,
            None => return Ok((events, StreamEvent::Stop { reason: None })),
        }
    }
}

/// Drives the response body. Owns the exchange trace and emits it exactly
/// once: on completion, on failure, or on drop when the caller went away.
struct BodyState {
    events: BoxStreamEv,
    lead: Option<StreamEvent>,
    trace: Option<ExchangeTrace>,
    span: Span,
    started: Instant,
}

impl BodyState {
    async fn next_chunk(mut self) -> Option<(Result<Bytes, RelayError>, Self)> {
        loop {
            if self.trace.is_none() {
                return None;
            }
            let ev = match self.lead.take() {
                Some(ev) => ev,
                None => self
                    .events
                    .next()
                    .await
                    .unwrap_or(StreamEvent::Stop { reason: None }),
            };
            match ev {
                StreamEvent::DeltaText(text) if !text.is_empty() => {
                    if let Some(trace) = self.trace.as_mut() {
                        trace.record_fragment(text.len());
                    }
                    return Some((Ok(Bytes::from(text)), self));
                }
                StreamEvent::Stop { reason } => {
                    self.finish(reason);
                    return None;
                }
                StreamEvent::Error(err) => {
                    self.fail(&err);
                    return Some((Err(err), self));
                }
                _ => continue,
            }
        }
    }

    fn finish(&mut self, reason: Option<StopReason>) {
        let Some(trace) = self.trace.take() else {
            return;
        };
        let reason = reason.map(|r| r.as_str());
        self.record_counts(&trace);
        if let Some(r) = reason {
            self.span.record(KEY_FINISH_REASON, r);
        }
        tracing::info!(fragments = trace.fragments, "exchange completed");
        let trace = trace
            .finish_reason_opt(reason)
            .latency_ms(elapsed_ms(self.started));
        telemetry::emit(trace);
    }

    fn fail(&mut self, err: &RelayError) {
        let Some(mut trace) = self.trace.take() else {
            return;
        };
        trace.record_error(err);
        self.record_counts(&trace);
        self.span.record(KEY_ERROR_KIND, err.kind());
        tracing::error!(error = %err, fragments = trace.fragments, "exchange aborted mid-stream");
        telemetry::emit(trace.latency_ms(elapsed_ms(self.started)));
    }

    fn record_counts(&self, trace: &ExchangeTrace) {
        self.span.record(KEY_FRAGMENTS, trace.fragments);
        self.span.record(KEY_BYTES, trace.bytes);
    }
}

impl Drop for BodyState {
    fn drop(&mut self) {
        if let Some(mut trace) = self.trace.take() {
            trace.outcome = ExchangeOutcome::Abandoned;
            self.record_counts(&trace);
            self.span
                .in_scope(|| tracing::warn!(fragments = trace.fragments, "caller went away"));
            telemetry::emit(trace.latency_ms(elapsed_ms(self.started)));
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
