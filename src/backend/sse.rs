use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;

use axum::response::sse::Event;
use bytes::{Bytes, BytesMut};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::Value;

use crate::config::types::SseRelayConfig;

use super::error::BackendError;
use super::http::static_headers;

/// Parse SSE-formatted text and extract the first non-empty `data:` line content.
pub fn parse_sse_data(raw: &str) -> Option<String> {
    for line in raw.lines() {
        let stripped = if let Some(rest) = line.strip_prefix("data:") {
            rest.trim()
        } else {
            continue;
        };

        if !stripped.is_empty() {
            return Some(stripped.to_string());
        }
    }
    None
}

/// One dispatched server-sent event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    fn into_axum(self) -> Event {
        let mut event = Event::default().data(self.data);
        if let Some(name) = self.event {
            event = event.event(name);
        }
        if let Some(id) = self.id {
            event = event.id(id);
        }
        if let Some(ms) = self.retry {
            event = event.retry(Duration::from_millis(ms));
        }
        event
    }
}

/// Incremental event-stream decoder.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence; only
/// complete lines are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();

        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if let Some(event) = self.feed_line(line) {
                out.push(event);
            }
        }

        out
    }

    /// Flushes a trailing event that was not terminated by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buf.is_empty() {
            let rest = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            self.feed_line(rest.trim_end_matches('\r'));
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" if !value.contains('\0') => self.id = Some(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            return None;
        }
        Some(SseEvent {
            event,
            data: std::mem::take(&mut self.data).join("\n"),
            // The last event id persists across events.
            id: self.id.clone(),
            retry,
        })
    }
}

/// Logs when the relay stream is torn down, which happens exactly when the
/// client goes away or the upstream ends.
struct RelayGuard {
    backend: String,
    relayed: u64,
}

impl Drop for RelayGuard {
    fn drop(&mut self) {
        tracing::info!(
            backend = %self.backend,
            events = self.relayed,
            "SSE relay closed, upstream connection released"
        );
    }
}

struct RelayState {
    upstream: BoxStream<'static, reqwest::Result<Bytes>>,
    parser: SseParser,
    queue: VecDeque<SseEvent>,
    done: bool,
    guard: RelayGuard,
}

/// Relay from one SSE upstream.
pub struct SseRelay<'a> {
    client: &'a Client,
    backend: &'a str,
    config: &'a SseRelayConfig,
}

impl<'a> SseRelay<'a> {
    pub fn new(client: &'a Client, backend: &'a str, config: &'a SseRelayConfig) -> Self {
        Self {
            client,
            backend,
            config,
        }
    }

    /// Opens one upstream event stream and relays every event verbatim.
    ///
    /// The upstream body is owned by the returned stream; when the client
    /// disconnects and the response is dropped, the upstream connection is
    /// closed with it.
    pub async fn events(
        &self,
    ) -> Result<impl Stream<Item = Result<Event, Infallible>> + Send + 'static, BackendError> {
        let response = self
            .client
            .get(&self.config.url)
            .headers(static_headers(self.backend, &self.config.headers))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(BackendError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::HttpStatus(status.as_u16(), body));
        }

        tracing::info!(backend = %self.backend, url = %self.config.url, "SSE relay opened");

        let state = RelayState {
            upstream: response.bytes_stream().boxed(),
            parser: SseParser::new(),
            queue: VecDeque::new(),
            done: false,
            guard: RelayGuard {
                backend: self.backend.to_string(),
                relayed: 0,
            },
        };

        let events = futures::stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.queue.pop_front() {
                    state.guard.relayed += 1;
                    return Some((Ok::<Event, Infallible>(event.into_axum()), state));
                }
                if state.done {
                    return None;
                }
                match state.upstream.next().await {
                    Some(Ok(chunk)) => {
                        state.queue.extend(state.parser.push(&chunk));
                    }
                    Some(Err(e)) => {
                        tracing::warn!(backend = %state.guard.backend, error = %e, "SSE upstream read failed");
                        state.done = true;
                        state.queue.extend(state.parser.finish());
                    }
                    None => {
                        tracing::debug!(backend = %state.guard.backend, "SSE upstream ended");
                        state.done = true;
                        state.queue.extend(state.parser.finish());
                    }
                }
            }
        });

        Ok(events)
    }

    /// Single POST round trip. Non-success statuses are returned with the
    /// upstream's status and body unchanged.
    pub async fn request(&self, body: Bytes) -> Result<Value, BackendError> {
        let mut request = self
            .client
            .post(self.config.post_url())
            .headers(static_headers(self.backend, &self.config.headers))
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .body(body);
        if let Some(secs) = self.config.timeout_secs {
            request = request.timeout(Duration::from_secs(secs));
        }

        let response = request.send().await.map_err(BackendError::Request)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::HttpStatus(status.as_u16(), body));
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("text/event-stream"));

        let text = response.text().await.map_err(BackendError::Stream)?;
        let payload = if is_event_stream {
            parse_sse_data(&text).ok_or(BackendError::NoDataInSse)?
        } else {
            text
        };

        serde_json::from_str(&payload)
            .map_err(|e| BackendError::InvalidResponse(format!("upstream reply is not JSON: {e}")))
    }
}
