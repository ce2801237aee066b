//! Client side of the relay: keeps the conversation history, submits it,
//! and accumulates the streamed reply into one assistant turn.
//!
//! One exchange at a time. The in-flight flag is set before the first
//! await of `submit` and cleared on every exit path, including the
//! submitting future being dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;

use crate::config::Config;
use crate::decode::Utf8Decoder;
use crate::error::{CoreResult, RelayError};
use crate::http_client::{ByteStream, HttpClient};
use crate::model::Turn;

/// Where the consumer is in the current exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeState {
    #[default]
    Idle,
    Submitting,
    Streaming,
    Committing,
    Erroring,
}

/// Opens one relay exchange for the given history and returns the reply
/// body as raw chunks.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn open(&self, turns: &[Turn]) -> CoreResult<ByteStream>;
}

#[async_trait]
impl<T: ChatTransport + ?Sized> ChatTransport for Arc<T> {
    async fn open(&self, turns: &[Turn]) -> CoreResult<ByteStream> {
        (**self).open(turns).await
    }
}

/// reqwest-backed transport posting `{"messages": [...]}` to the relay.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: HttpClient,
    url: String,
}

#[derive(Serialize)]
struct Outbound<'a> {
    messages: &'a [Turn],
}

impl HttpTransport {
    pub fn new(http: HttpClient, url: impl Into<String>) -> Self {
        Self {
            http,
            url: url.into(),
        }
    }

    pub fn from_config(cfg: &Config) -> CoreResult<Self> {
        Ok(Self::new(
            HttpClient::from_cfg(&cfg.http)?,
            cfg.client.relay_url.clone(),
        ))
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open(&self, turns: &[Turn]) -> CoreResult<ByteStream> {
        self.http
            .post_chunked(&self.url, &Outbound { messages: turns })
            .await
    }
}

/// Hooks for a display layer. Called outside the consumer's lock, from the
/// task driving `submit`.
pub trait ExchangeObserver: Send + Sync {
    fn on_state(&self, _state: ExchangeState) {}
    /// Full accumulated reply so far, not just the newest piece.
    fn on_partial(&self, _text: &str) {}
    /// A turn was appended to the history (user or assistant).
    fn on_commit(&self, _turn: &Turn) {}
}

pub struct NoopObserver;

impl ExchangeObserver for NoopObserver {}

/// How an accepted submission ended. Either way exactly one assistant turn
/// was appended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed(Turn),
    /// The exchange failed and the fallback reply was committed.
    Failed(Turn),
}

impl SubmitOutcome {
    pub fn turn(&self) -> &Turn {
        match self {
            Self::Completed(t) | Self::Failed(t) => t,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

#[derive(Default)]
struct Shared {
    state: ExchangeState,
    history: Vec<Turn>,
    buffer: String,
    in_flight: bool,
}

pub struct StreamConsumer<T> {
    transport: T,
    observer: Arc<dyn ExchangeObserver>,
    shared: Mutex<Shared>,
}

impl<T: ChatTransport> StreamConsumer<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            observer: Arc::new(NoopObserver),
            shared: Mutex::new(Shared::default()),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExchangeObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Seed the conversation, e.g. when resuming a saved session.
    pub fn with_history(self, history: Vec<Turn>) -> Self {
        self.lock().history = history;
        self
    }

    pub fn state(&self) -> ExchangeState {
        self.lock().state
    }

    pub fn history(&self) -> Vec<Turn> {
        self.lock().history.clone()
    }

    /// Reply text accumulated so far in the current exchange.
    pub fn streaming_text(&self) -> String {
        self.lock().buffer.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.lock().in_flight
    }

    /// Append `input` as a user turn and stream the reply.
    ///
    /// Rejected without side effects when `input` is blank (`EmptyInput`)
    /// or another exchange is running (`Busy`). Transport and relay
    /// failures are not errors here: they commit the fallback reply and
    /// return `SubmitOutcome::Failed`.
    pub async fn submit(&self, input: &str) -> CoreResult<SubmitOutcome> {
        if input.trim().is_empty() {
            return Err(RelayError::EmptyInput);
        }
        let user = Turn::user(input);
        let turns = {
            let mut shared = self.lock();
            if shared.in_flight {
                return Err(RelayError::Busy);
            }
            shared.in_flight = true;
            shared.buffer.clear();
            shared.state = ExchangeState::Submitting;
            shared.history.push(user.clone());
            shared.history.clone()
        };
        let _guard = InFlightGuard { consumer: self };
        self.observer.on_state(ExchangeState::Submitting);
        self.observer.on_commit(&user);
        tracing::debug!(turns = turns.len(), "submitting exchange");

        let outcome = match self.run_exchange(&turns).await {
            Ok(text) => SubmitOutcome::Completed(self.commit(Turn::assistant(text))),
            Err(err) => {
                tracing::warn!(error = %err, kind = err.kind(), "exchange failed, committing fallback");
                self.set_state(ExchangeState::Erroring);
                SubmitOutcome::Failed(self.commit(Turn::fallback()))
            }
        };
        Ok(outcome)
    }

    async fn run_exchange(&self, turns: &[Turn]) -> CoreResult<String> {
        let mut body = self.transport.open(turns).await?;
        self.set_state(ExchangeState::Streaming);

        let mut decoder = Utf8Decoder::new();
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            self.publish(&decoder.decode(&chunk));
        }
        self.publish(&decoder.finish());

        self.set_state(ExchangeState::Committing);
        Ok(std::mem::take(&mut self.lock().buffer))
    }

    fn publish(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let partial = {
            let mut shared = self.lock();
            shared.buffer.push_str(text);
            shared.buffer.clone()
        };
        self.observer.on_partial(&partial);
    }

    fn commit(&self, turn: Turn) -> Turn {
        {
            let mut shared = self.lock();
            shared.buffer.clear();
            shared.history.push(turn.clone());
        }
        self.observer.on_commit(&turn);
        turn
    }

    fn set_state(&self, state: ExchangeState) {
        self.lock().state = state;
        self.observer.on_state(state);
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Returns the consumer to `Idle` however `submit` ends.
struct InFlightGuard<'a, T: ChatTransport> {
    consumer: &'a StreamConsumer<T>,
}

impl<T: ChatTransport> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        {
            let mut shared = self.consumer.lock();
            shared.in_flight = false;
            shared.buffer.clear();
            shared.state = ExchangeState::Idle;
        }
        self.consumer.observer.on_state(ExchangeState::Idle);
    }
}
