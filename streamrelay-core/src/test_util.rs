//! Scripted collaborators shared by the unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;

use crate::consumer::{ChatTransport, ExchangeObserver, ExchangeState};
use crate::error::{CoreResult, RelayError};
use crate::http_client::ByteStream;
use crate::model::{ChatRequest, StopReason, Turn};
use crate::provider::ChatStreamProvider;
use crate::stream::{BoxStreamEv, StreamEvent};

/// Detail that must never reach a relay caller.
pub const SECRET_DETAIL: &str = "upstream key sk-live-123 rejected";

#[derive(Debug, Clone, Copy)]
pub enum Unit {
    Text(&'static str),
    Meta,
    Stop,
    Fail,
    /// Never yields again.
    Stall,
}

/// Upstream that replays a fixed script and records every request.
pub struct ScriptedProvider {
    units: Vec<Unit>,
    fail_open: bool,
    calls: Mutex<Vec<ChatRequest>>,
}

impl ScriptedProvider {
    pub fn new(units: Vec<Unit>) -> Arc<Self> {
        Arc::new(Self {
            units,
            fail_open: false,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn texts(fragments: &[&'static str]) -> Arc<Self> {
        let mut units: Vec<Unit> = fragments.iter().map(|f| Unit::Text(*f)).collect();
        units.push(Unit::Stop);
        Self::new(units)
    }

    pub fn failing_open() -> Arc<Self> {
        Arc::new(Self {
            units: Vec::new(),
            fail_open: true,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().unwrap().clone()
    }
}

fn secret_error() -> RelayError {
    RelayError::ProviderError {
        provider: "scripted".into(),
        code: "500".into(),
        message: SECRET_DETAIL.into(),
    }
}

#[async_trait]
impl ChatStreamProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        self.calls.lock().unwrap().push(req);
        if self.fail_open {
            return Err(secret_error());
        }
        let mut events = Vec::new();
        let mut stall = false;
        for unit in &self.units {
            match unit {
                Unit::Text(t) => events.push(StreamEvent::DeltaText(t.to_string())),
                Unit::Meta => events.push(StreamEvent::Metadata),
                Unit::Stop => events.push(StreamEvent::Stop {
                    reason: Some(StopReason::Stop),
                }),
                Unit::Fail => events.push(StreamEvent::Error(secret_error())),
                Unit::Stall => {
                    stall = true;
                    break;
                }
            }
        }
        let head = stream::iter(events);
        if stall {
            Ok(head.chain(stream::pending()).boxed())
        } else {
            Ok(head.boxed())
        }
    }
}

/// One item a scripted transport body yields.
#[derive(Debug, Clone)]
pub enum Chunk {
    Bytes(Vec<u8>),
    Fail,
    Stall,
}

/// Transport that serves a fixed body and counts how often it was opened.
pub struct ScriptedTransport {
    body: Vec<Chunk>,
    fail_open: bool,
    gate: Option<Arc<Notify>>,
    opened: AtomicUsize,
    sent: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedTransport {
    pub fn new(body: Vec<Chunk>) -> Self {
        Self {
            body,
            fail_open: false,
            gate: None,
            opened: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn from_bytes(chunks: &[&[u8]]) -> Self {
        Self::new(chunks.iter().map(|c| Chunk::Bytes(c.to_vec())).collect())
    }

    pub fn failing_open() -> Self {
        let mut t = Self::new(Vec::new());
        t.fail_open = true;
        t
    }

    /// `open` waits on the gate before answering.
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Vec<Turn>> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChatTransport for ScriptedTransport {
    async fn open(&self, turns: &[Turn]) -> CoreResult<ByteStream> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.sent.lock().unwrap().push(turns.to_vec());
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail_open {
            return Err(RelayError::Transport("connection refused".into()));
        }
        let mut items: Vec<CoreResult<Bytes>> = Vec::new();
        let mut stall = false;
        for c in &self.body {
            match c {
                Chunk::Bytes(b) => items.push(Ok(Bytes::from(b.clone()))),
                Chunk::Fail => items.push(Err(RelayError::Transport("connection reset".into()))),
                Chunk::Stall => {
                    stall = true;
                    break;
                }
            }
        }
        let head = stream::iter(items);
        if stall {
            Ok(Box::pin(head.chain(stream::pending())))
        } else {
            Ok(Box::pin(head))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observed {
    State(ExchangeState),
    Partial(String),
    Commit(Turn),
}

#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<Observed>>,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<Observed> {
        self.events.lock().unwrap().clone()
    }

    pub fn partials(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::Partial(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<ExchangeState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Observed::State(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl ExchangeObserver for RecordingObserver {
    fn on_state(&self, state: ExchangeState) {
        self.events.lock().unwrap().push(Observed::State(state));
    }
    fn on_partial(&self, text: &str) {
        self.events.lock().unwrap().push(Observed::Partial(text.to_string()));
    }
    fn on_commit(&self, turn: &Turn) {
        self.events.lock().unwrap().push(Observed::Commit(turn.clone()));
    }
}
