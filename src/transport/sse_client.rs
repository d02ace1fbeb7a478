//! Push-stream client transport facing a remote agent.
//!
//! Opens `GET url` with `Accept: text/event-stream`, waits for the agent's
//! `endpoint` event, then relays `message` events as inbound messages.
//! Outbound messages are POSTed to the announced endpoint.

use std::any::Any;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use axum::http::HeaderMap;
use eventsource_stream::{Event, Eventsource};
use futures_util::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::Url;
use serde_json::Value;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ensure_success, BoxFuture, EventSender, Transport, TransportEvents, TransportKind};
use crate::{AppError, Result};

/// Media type negotiated for push streams.
pub const EVENT_STREAM: &str = "text/event-stream";

/// Parsed server-sent events from an HTTP response body.
pub(crate) type SseEvents = BoxStream<'static, std::result::Result<Event, String>>;

/// Wrap a response body in an SSE parser.
pub(crate) fn event_stream(response: reqwest::Response) -> SseEvents {
    response
        .bytes_stream()
        .eventsource()
        .map(|item| item.map_err(|err| err.to_string()))
        .boxed()
}

/// Relay `message` events from `stream` until it ends or `cancel` fires.
///
/// The id of every event is stored in `last_event_id` when given, so a
/// reconnect can resume.  Returns `Ok` on clean end of stream or cancel.
pub(crate) async fn relay_events(
    label: &str,
    mut stream: SseEvents,
    events: &EventSender,
    cancel: &CancellationToken,
    last_event_id: Option<&Mutex<Option<String>>>,
) -> Result<()> {
    loop {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            item = stream.next() => item,
        };

        match item {
            None => return Ok(()),
            Some(Err(err)) => {
                return Err(AppError::Transport(format!("{label} event stream failed: {err}")));
            }
            Some(Ok(event)) => {
                if let Some(slot) = last_event_id {
                    if !event.id.is_empty() {
                        *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(event.id.clone());
                    }
                }
                if !(event.event.is_empty() || event.event == "message") {
                    debug!(source = label, event = %event.event, "ignoring non-message event");
                    continue;
                }
                if event.data.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&event.data) {
                    Ok(message) => {
                        if !events.message(message) {
                            return Ok(());
                        }
                    }
                    Err(err) => {
                        warn!(source = label, %err, raw = %event.data, "skipping undecodable event");
                    }
                }
            }
        }
    }
}

/// Agent-facing push-stream transport.
pub struct SseClientTransport {
    url: Url,
    headers: HeaderMap,
    http: reqwest::Client,
    endpoint: OnceLock<Url>,
    started: OnceCell<()>,
    events: Arc<EventSender>,
    cancel: CancellationToken,
}

impl SseClientTransport {
    /// Create an unstarted transport for `url`.
    ///
    /// `headers` must already be filtered through the push-stream allow-list.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        url: Url,
        headers: HeaderMap,
    ) -> (Arc<Self>, TransportEvents) {
        let (events, rx) = EventSender::channel();
        (
            Arc::new(Self {
                url,
                headers,
                http,
                endpoint: OnceLock::new(),
                started: OnceCell::new(),
                events: Arc::new(events),
                cancel: CancellationToken::new(),
            }),
            rx,
        )
    }

    /// The POST endpoint announced by the agent, once known.
    #[must_use]
    pub fn endpoint(&self) -> Option<&Url> {
        self.endpoint.get()
    }

    async fn connect(&self) -> Result<()> {
        let response = self
            .http
            .get(self.url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, EVENT_STREAM)
            .send()
            .await
            .map_err(|err| AppError::Transport(format!("connecting to {} failed: {err}", self.url)))?;
        let response = ensure_success(response, "push-stream agent").await?;

        let mut stream = event_stream(response);
        let endpoint = loop {
            let item = tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    return Err(AppError::Disconnected("closed during handshake".into()));
                }
                item = stream.next() => item,
            };
            match item {
                Some(Ok(event)) if event.event == "endpoint" => {
                    break self.resolve_endpoint(event.data.trim())?;
                }
                Some(Ok(event)) => {
                    debug!(url = %self.url, event = %event.event, "event before endpoint ignored");
                }
                Some(Err(err)) => {
                    return Err(AppError::Transport(format!("push stream failed during handshake: {err}")));
                }
                None => {
                    return Err(AppError::Transport(
                        "push stream ended before the endpoint event".into(),
                    ));
                }
            }
        };

        info!(url = %self.url, endpoint = %endpoint, "push-stream agent connected");
        let _ = self.endpoint.set(endpoint);

        let events = Arc::clone(&self.events);
        let cancel = self.cancel.clone();
        let label = self.url.to_string();
        tokio::spawn(async move {
            match relay_events(&label, stream, &events, &cancel, None).await {
                Ok(()) => {
                    events.closed();
                }
                Err(err) => events.error(err),
            }
        });
        Ok(())
    }

    fn resolve_endpoint(&self, raw: &str) -> Result<Url> {
        let endpoint = self
            .url
            .join(raw)
            .map_err(|err| AppError::Transport(format!("invalid endpoint {raw:?}: {err}")))?;
        if endpoint.origin() != self.url.origin() {
            return Err(AppError::Transport(format!(
                "endpoint origin does not match connection origin: {endpoint}"
            )));
        }
        Ok(endpoint)
    }
}

impl Transport for SseClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SseClient
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn session_id(&self) -> Option<String> {
        self.endpoint.get().and_then(|endpoint| {
            endpoint
                .query_pairs()
                .find(|(k, _)| k == "sessionId" || k == "session_id")
                .map(|(_, v)| v.into_owned())
        })
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.started
                .get_or_try_init(|| self.connect())
                .await
                .map(|_| ())
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.cancel.is_cancelled() {
                return Err(AppError::Disconnected("push-stream agent closed".into()));
            }
            let Some(endpoint) = self.endpoint.get() else {
                return Err(AppError::NotConnected("push-stream agent not connected".into()));
            };
            let response = self
                .http
                .post(endpoint.clone())
                .headers(self.headers.clone())
                .json(&message)
                .send()
                .await
                .map_err(|err| AppError::Transport(format!("POST to {endpoint} failed: {err}")))?;
            ensure_success(response, "push-stream endpoint").await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cancel.cancel();
            self.events.closed();
            Ok(())
        })
    }
}
