//! Push-stream server transport facing the browser.
//!
//! `GET /sse` (or `/stdio`) answers with an event stream.  The first event is
//! `endpoint`, naming the side-channel URL (`/message?sessionId=…`) the
//! browser POSTs its messages to; every message sent afterwards becomes a
//! `message` event.  The transport generates its own session id.
//!
//! Dropping the response stream, which axum does when the browser goes away,
//! closes the transport.

use std::any::Any;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::response::sse::{Event, KeepAlive, KeepAliveStream, Sse};
use futures_util::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::{split_batch, BoxFuture, EventSender, Transport, TransportEvents, TransportKind};
use crate::{AppError, Result};

/// Event stream body returned to the browser.
pub type SseBody = Sse<KeepAliveStream<BoxStream<'static, std::result::Result<Event, Infallible>>>>;

/// Browser-facing push-stream transport.
pub struct SseServerTransport {
    session_id: String,
    endpoint: String,
    outbound: mpsc::UnboundedSender<Event>,
    events: Arc<EventSender>,
    started: AtomicBool,
    closer: CancellationToken,
}

/// Closes the transport when the response stream is dropped.
struct DisconnectGuard {
    session_id: String,
    events: Arc<EventSender>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        if self.events.closed() {
            debug!(session_id = %self.session_id, "push stream dropped by client");
        }
    }
}

impl SseServerTransport {
    /// Create a transport whose side channel lives at `endpoint`.
    ///
    /// Returns the transport, its event receiver, and the response body to
    /// hand back to axum.
    #[must_use]
    pub fn new(endpoint: &str) -> (Arc<Self>, TransportEvents, SseBody) {
        let session_id = Uuid::new_v4().to_string();
        let (events, rx) = EventSender::channel();
        let events = Arc::new(events);
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<Event>();
        let closer = CancellationToken::new();

        let guard = DisconnectGuard {
            session_id: session_id.clone(),
            events: Arc::clone(&events),
        };
        let body = stream::unfold(
            (outbound_rx, guard, closer.clone()),
            |(mut outbound_rx, guard, closer)| async move {
                // Queued events drain before a close ends the stream.
                let next = tokio::select! {
                    biased;
                    event = outbound_rx.recv() => event,
                    () = closer.cancelled() => outbound_rx.try_recv().ok(),
                };
                next.map(|event| (Ok::<_, Infallible>(event), (outbound_rx, guard, closer)))
            },
        )
        .boxed();

        let transport = Arc::new(Self {
            session_id,
            endpoint: endpoint.to_owned(),
            outbound,
            events,
            started: AtomicBool::new(false),
            closer,
        });

        (
            transport,
            rx,
            Sse::new(body).keep_alive(KeepAlive::default()),
        )
    }

    /// Session id generated for this stream.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.session_id
    }

    /// The URL announced in the `endpoint` event.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("{}?sessionId={}", self.endpoint, self.session_id)
    }

    /// Accept a side-channel POST body from the browser.
    ///
    /// # Errors
    ///
    /// `NotConnected` before `start`, `Disconnected` after close,
    /// `BadRequest` if the body is not a JSON-RPC object or batch.
    pub fn handle_post_message(&self, body: Value) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(AppError::NotConnected("push stream not started".into()));
        }
        if self.events.is_closed() {
            return Err(AppError::Disconnected("push stream closed".into()));
        }
        for message in split_batch(body)? {
            self.events.message(message);
        }
        Ok(())
    }

    fn push(&self, event: Event) -> Result<()> {
        if self.events.is_closed() {
            return Err(AppError::Disconnected("push stream closed".into()));
        }
        self.outbound
            .send(event)
            .map_err(|_| AppError::Disconnected("browser disconnected from push stream".into()))
    }
}

impl Transport for SseServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SseServer
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            self.push(Event::default().event("endpoint").data(self.endpoint_url()))
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.started.load(Ordering::SeqCst) {
                return Err(AppError::NotConnected("push stream not started".into()));
            }
            let data = serde_json::to_string(&message)?;
            self.push(Event::default().event("message").data(data))
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closer.cancel();
            self.events.closed();
            Ok(())
        })
    }
}
