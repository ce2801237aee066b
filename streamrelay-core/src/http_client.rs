use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{Stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::HttpCfg;
use crate::decode::Utf8Decoder;
use crate::error::{RelayError, CoreResult};

/// Request context carries tracing IDs.
#[derive(Clone, Copy, Default)]
pub struct RequestCtx<'a> {
    pub request_id: Option<&'a str>,
}

/// Represents a single Server-Sent-Event line (already split on `\n`).
#[derive(Debug, Clone)]
pub struct SseLine {
    pub line: String,
}

/// A boxed stream of `SseLine` results.
pub type SseStream = Pin<Box<dyn Stream<Item = CoreResult<SseLine>> + Send>>;

/// A boxed stream of raw body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = CoreResult<Bytes>> + Send>>;

type RawBody = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Thin wrapper around reqwest::Client with defaults and helpers.
#[derive(Debug, Clone)]
pub struct HttpClient {
    inner: Client,
    user_agent: String,
}

impl HttpClient {
    pub fn new_default() -> CoreResult<Self> {
        Self::from_cfg(&HttpCfg::default())
    }

    pub fn from_cfg(cfg: &HttpCfg) -> CoreResult<Self> {
        let mut builder =
            Client::builder().connect_timeout(Duration::from_millis(cfg.connect_timeout_ms));
        if let Some(ms) = cfg.request_timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        if let Some(n) = cfg.pool_max_idle_per_host {
            builder = builder.pool_max_idle_per_host(n);
        }
        let inner = builder
            .build()
            .map_err(|e| RelayError::Other(anyhow::anyhow!("http client build failed: {e}")))?;
        Ok(Self {
            inner,
            user_agent: concat!("streamrelay/", env!("CARGO_PKG_VERSION")).to_string(),
        })
    }

    /// POST JSON and return an SSE (Server-Sent Events) line stream.
    /// Each yielded item is one raw line (trim not applied) from the SSE channel.
    pub async fn post_sse_lines<T: Serialize + ?Sized>(
        &self,
        provider: &str,
        url: &str,
        body: &T,
        headers: &[(&str, &str)],
        ctx: &RequestCtx<'_>,
    ) -> CoreResult<SseStream> {
        let mut req = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .header("Accept", "text/event-stream");

        for (k, v) in headers {
            req = req.header(*k, *v);
        }
        if let Some(rid) = ctx.request_id {
            req = req.header("X-Request-Id", rid);
        }

        let resp = req.send().await.map_err(|e| {
            tracing::debug!(provider, error = %e, "upstream connect failed");
            RelayError::ProviderUnavailable {
                provider: provider.into(),
            }
        })?;

        let status = resp.status();
        if let Some(prid) = extract_request_id(resp.headers()) {
            tracing::debug!(provider, provider_request_id = %prid, "upstream accepted request");
        }
        if !status.is_success() {
            let headers = resp.headers().clone();
            let ra = parse_retry_after(&headers);
            let body = resp.text().await.unwrap_or_default();
            return Err(map_http_error(provider, status, ra, &body));
        }

        // Stream body as bytes and split on '\n'
        let byte_stream = resp.bytes_stream();
        let line_stream = LineStream::new(provider, Box::pin(byte_stream));
        Ok(Box::pin(line_stream))
    }

    /// POST JSON and hand back the response body as a chunk stream, exactly
    /// as the transport delivers it. Non-success statuses and body-less
    /// responses are errors.
    pub async fn post_chunked<T: Serialize + ?Sized>(
        &self,
        url: &str,
        body: &T,
    ) -> CoreResult<ByteStream> {
        let resp = self
            .inner
            .post(url)
            .json(body)
            .header("User-Agent", &self.user_agent)
            .send()
            .await
            .map_err(|e| RelayError::Transport(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Transport(format!("relay answered {status}")));
        }
        if status == StatusCode::NO_CONTENT {
            return Err(RelayError::Transport("no response body".into()));
        }

        let chunks = resp
            .bytes_stream()
            .map(|r| r.map_err(|e| RelayError::Transport(format!("body read failed: {e}"))));
        Ok(Box::pin(chunks))
    }
}

fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
    static CANDIDATES: [&str; 3] = ["x-request-id", "request-id", "x-cdn-request-id"];
    for k in CANDIDATES {
        if let Some(v) = headers.get(k)
            && let Ok(s) = v.to_str()
        {
            return Some(s.to_string());
        }
    }
    None
}

fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    if let Some(v) = headers.get("retry-after")
        && let Ok(s) = v.to_str()
        && let Ok(secs) = s.trim().parse::<u64>()
    {
        return Some(secs);
    }
    // HTTP-date forms are ignored.
    None
}

fn map_http_error(provider: &str, status: StatusCode, retry_after: Option<u64>, body: &str) -> RelayError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => RelayError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        s if s.is_server_error() => RelayError::ProviderUnavailable {
            provider: provider.to_string(),
        },
        s => RelayError::ProviderError {
            provider: provider.to_string(),
            code: s.as_u16().to_string(),
            message: truncate(body, 300),
        },
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() > max {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let mut t = s[..end].to_string();
        t.push_str("...");
        t
    } else {
        s.to_string()
    }
}

/// Internal line splitter over a bytes stream; yields `SseLine`s separated by '\n'.
struct LineStream {
    provider: String,
    inner: RawBody,
    decoder: Utf8Decoder,
    buf: String,
    flushed_tail: bool,
}

impl LineStream {
    fn new(provider: &str, inner: RawBody) -> Self {
        Self {
            provider: provider.to_string(),
            inner,
            decoder: Utf8Decoder::new(),
            buf: String::new(),
            flushed_tail: false,
        }
    }
}

impl Stream for LineStream {
    type Item = CoreResult<SseLine>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            // If we already have a newline in the buffer, split and yield immediately.
            if let Some(idx) = self.buf.find('\n') {
                let mut line = self.buf.drain(..=idx).collect::<String>();
                if line.ends_with("\r\n") {
                    line.truncate(line.len() - 2);
                } else {
                    line.truncate(line.len() - 1);
                }
                return Poll::Ready(Some(Ok(SseLine { line })));
            }

            // Otherwise, poll the inner stream for more bytes
            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let this = &mut *self;
                    let s = this.decoder.decode(&chunk);
                    this.buf.push_str(&s);
                    continue;
                }
                Poll::Ready(Some(Err(e))) => {
                    tracing::debug!(provider = %self.provider, error = %e, "upstream body read failed");
                    return Poll::Ready(Some(Err(RelayError::ProviderUnavailable {
                        provider: self.provider.clone(),
                    })));
                }
                Poll::Ready(None) => {
                    let this = &mut *self;
                    let tail = this.decoder.finish();
                    this.buf.push_str(&tail);
                    if !this.flushed_tail && !this.buf.is_empty() {
                        this.flushed_tail = true;
                        let line = std::mem::take(&mut this.buf);
                        return Poll::Ready(Some(Ok(SseLine { line })));
                    } else {
                        return Poll::Ready(None);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
