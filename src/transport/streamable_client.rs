//! Streaming-HTTP client transport facing a remote agent.
//!
//! Every outbound message is one POST.  The agent answers with a JSON body,
//! an event stream, or `202 Accepted`.  The `mcp-session-id` it assigns is
//! captured and repeated on later requests.  Once the client's
//! `notifications/initialized` has been accepted a standalone `GET` stream is
//! opened for server-initiated messages.
//!
//! `send` returns once the POST is handed to its own task, so a slow request
//! never holds back the ones behind it.  Replies are matched by id, and a
//! POST that fails later is reported as
//! [`TransportEvent::SendFailed`](super::TransportEvent::SendFailed).

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::http::HeaderMap;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sse_client::{event_stream, relay_events, EVENT_STREAM};
use super::{
    ensure_success, is_method, request_id, split_batch, BoxFuture, EventSender, Transport,
    TransportEvents, TransportKind,
};
use crate::headers::{header_str, value, LAST_EVENT_ID, MCP_SESSION_ID};
use crate::{AppError, Result};

/// `Accept` value sent with every POST.
pub const POST_ACCEPT: &str = "application/json, text/event-stream";

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const RECONNECT_DELAY: Duration = Duration::from_millis(500);
const DELETE_TIMEOUT: Duration = Duration::from_secs(2);

struct Shared {
    url: Url,
    headers: HeaderMap,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    last_event_id: Mutex<Option<String>>,
    events: EventSender,
    standalone: AtomicBool,
    cancel: CancellationToken,
}

/// Agent-facing streaming-HTTP transport.
pub struct StreamableHttpClientTransport {
    shared: Arc<Shared>,
    started: AtomicBool,
    closing: AtomicBool,
}

impl StreamableHttpClientTransport {
    /// Create an unstarted transport for `url`.
    ///
    /// `headers` must already be filtered through the streaming-HTTP
    /// allow-list.  A forwarded `mcp-session-id` seeds the agent session id;
    /// a forwarded `last-event-id` seeds stream resumption.
    #[must_use]
    pub fn new(http: reqwest::Client, url: Url, mut headers: HeaderMap) -> (Arc<Self>, TransportEvents) {
        let session_id = header_str(&headers, &MCP_SESSION_ID).map(str::to_owned);
        let last_event_id = header_str(&headers, &LAST_EVENT_ID).map(str::to_owned);
        headers.remove(&MCP_SESSION_ID);
        headers.remove(&LAST_EVENT_ID);

        let (events, rx) = EventSender::channel();
        let shared = Arc::new(Shared {
            url,
            headers,
            http,
            session_id: Mutex::new(session_id),
            last_event_id: Mutex::new(last_event_id),
            events,
            standalone: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (
            Arc::new(Self {
                shared,
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
            rx,
        )
    }

    /// Last event id seen on any agent stream.
    #[must_use]
    pub fn last_event_id(&self) -> Option<String> {
        lock(&self.shared.last_event_id).clone()
    }

    async fn delete_session(&self) {
        let Some(session_id) = self.shared.session_id() else {
            return;
        };
        let mut request = self
            .shared
            .http
            .delete(self.shared.url.clone())
            .headers(self.shared.headers.clone())
            .timeout(DELETE_TIMEOUT);
        if let Some(v) = value(&session_id) {
            request = request.header(MCP_SESSION_ID, v);
        }
        match request.send().await {
            Ok(response) => {
                debug!(url = %self.shared.url, status = %response.status(), "agent session deleted");
            }
            Err(err) => debug!(url = %self.shared.url, %err, "agent session delete failed"),
        }
    }
}

impl Shared {
    fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    fn capture_session_id(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(id) = header_str(headers, &MCP_SESSION_ID) {
            let mut slot = lock(&self.session_id);
            if slot.as_deref() != Some(id) {
                debug!(url = %self.url, session_id = id, "agent assigned session id");
                *slot = Some(id.to_owned());
            }
        }
    }

    fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let mut builder = builder.headers(self.headers.clone());
        if let Some(v) = self.session_id().as_deref().and_then(value) {
            builder = builder.header(MCP_SESSION_ID, v);
        }
        builder
    }

    async fn post(&self, message: &Value) -> Result<reqwest::Response> {
        let response = self
            .request(self.http.post(self.url.clone()))
            .header(ACCEPT, POST_ACCEPT)
            .json(message)
            .send()
            .await
            .map_err(|err| AppError::Transport(format!("POST to {} failed: {err}", self.url)))?;
        let response = ensure_success(response, "streaming-HTTP agent").await?;
        self.capture_session_id(response.headers());
        Ok(response)
    }

    /// Hand the body of a successful POST to the event channel.
    async fn consume(self: &Arc<Self>, response: reqwest::Response) -> Result<()> {
        if response.status() == StatusCode::ACCEPTED {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with(EVENT_STREAM) {
            let shared = Arc::clone(self);
            let stream = event_stream(response);
            tokio::spawn(async move {
                let label = shared.url.to_string();
                if let Err(err) = relay_events(
                    &label,
                    stream,
                    &shared.events,
                    &shared.cancel,
                    Some(&shared.last_event_id),
                )
                .await
                {
                    shared.events.error(err);
                }
            });
            return Ok(());
        }

        let body = response
            .bytes()
            .await
            .map_err(|err| AppError::Transport(format!("reading agent response failed: {err}")))?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        let parsed: Value = serde_json::from_slice(&body)?;
        for message in split_batch(parsed)? {
            if !self.events.message(message) {
                break;
            }
        }
        Ok(())
    }

    /// POST one message and hand its response to the event channel.
    async fn deliver(self: Arc<Self>, message: Value) {
        let id = request_id(&message).cloned();
        let initialized = is_method(&message, "notifications/initialized");

        let outcome = tokio::select! {
            () = self.cancel.cancelled() => return,
            outcome = self.exchange(&message) => outcome,
        };
        match outcome {
            Ok(()) if initialized => self.open_standalone(),
            Ok(()) => {}
            Err(_) if self.cancel.is_cancelled() => {}
            Err(err) => {
                warn!(url = %self.url, %err, id = ?id, "agent POST failed");
                self.events.send_failed(id, err);
            }
        }
    }

    async fn exchange(self: &Arc<Self>, message: &Value) -> Result<()> {
        let response = self.post(message).await?;
        self.consume(response).await
    }

    fn open_standalone(self: &Arc<Self>) {
        if self.standalone.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(self);
        tokio::spawn(async move { shared.run_standalone().await });
    }

    /// Keep the standalone `GET` stream open until cancelled.
    async fn run_standalone(self: Arc<Self>) {
        let label = format!("{} (standalone)", self.url);
        let mut failures = 0_u32;

        while !self.cancel.is_cancelled() {
            let mut request = self
                .request(self.http.get(self.url.clone()))
                .header(ACCEPT, EVENT_STREAM);
            if let Some(v) = lock(&self.last_event_id).as_deref().and_then(value) {
                request = request.header(LAST_EVENT_ID, v);
            }

            let outcome = match request.send().await {
                Ok(response) if response.status() == StatusCode::METHOD_NOT_ALLOWED => {
                    debug!(url = %self.url, "agent offers no standalone stream");
                    return;
                }
                Ok(response) => match ensure_success(response, "standalone stream").await {
                    Ok(response) => {
                        failures = 0;
                        relay_events(
                            &label,
                            event_stream(response),
                            &self.events,
                            &self.cancel,
                            Some(&self.last_event_id),
                        )
                        .await
                    }
                    Err(err) if err.is_unauthorized() => {
                        self.events.error(err);
                        return;
                    }
                    Err(err) => Err(err),
                },
                Err(err) => Err(AppError::Transport(format!("standalone GET failed: {err}"))),
            };

            if let Err(err) = outcome {
                failures += 1;
                warn!(url = %self.url, %err, attempt = failures, "standalone stream interrupted");
                if failures >= MAX_RECONNECT_ATTEMPTS {
                    warn!(url = %self.url, "giving up on standalone stream");
                    return;
                }
            }

            tokio::select! {
                () = self.cancel.cancelled() => return,
                () = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }
    }
}

fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Transport for StreamableHttpClientTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttpClient
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn session_id(&self) -> Option<String> {
        self.shared.session_id()
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.started.swap(true, Ordering::SeqCst) {
                info!(url = %self.shared.url, "streaming-HTTP agent ready");
            }
            Ok(())
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.shared.cancel.is_cancelled() {
                return Err(AppError::Disconnected("streaming-HTTP agent closed".into()));
            }
            if !self.started.load(Ordering::SeqCst) {
                return Err(AppError::NotConnected("streaming-HTTP agent not started".into()));
            }

            tokio::spawn(Arc::clone(&self.shared).deliver(message));
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.closing.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.shared.cancel.cancel();
            self.delete_session().await;
            self.shared.events.closed();
            Ok(())
        })
    }
}
