//! Transport abstraction shared by every client- and agent-facing channel.
//!
//! A transport carries opaque JSON-RPC messages.  Five variants implement
//! [`Transport`]:
//!
//! | Kind                     | Faces  | Module                 |
//! |--------------------------|--------|------------------------|
//! | `SseServer`              | client | [`sse_server`]         |
//! | `SseClient`              | agent  | [`sse_client`]         |
//! | `StreamableHttpServer`   | client | [`streamable_server`]  |
//! | `StreamableHttpClient`   | agent  | [`streamable_client`]  |
//! | `Process`                | agent  | [`process`]            |
//!
//! Inbound traffic and lifecycle changes are reported as [`TransportEvent`]s
//! on an unbounded channel created alongside the transport.  The receiving
//! half ([`TransportEvents`]) belongs to whoever owns the session, normally
//! the [`pump`](crate::pump).

pub mod factory;
pub mod process;
pub mod sse_client;
pub mod sse_server;
pub mod streamable_client;
pub mod streamable_server;

use std::any::Any;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{AppError, Result};

/// Boxed future returned by [`Transport`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Receiving half of a transport's event channel.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// JSON-RPC error code used for requests the agent side could not accept.
pub const FORWARD_ERROR_CODE: i64 = -32001;

/// Logger name stamped on synthesized notifications.
pub const NOTIFICATION_LOGGER: &str = "mcp-bridge";

/// Closed set of transport variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Push-stream server facing the browser (`GET /sse`, `GET /stdio`).
    SseServer,
    /// Push-stream client facing a remote agent.
    SseClient,
    /// Streaming-HTTP server facing the browser (`/mcp`).
    StreamableHttpServer,
    /// Streaming-HTTP client facing a remote agent.
    StreamableHttpClient,
    /// Spawned local agent process.
    Process,
}

impl TransportKind {
    /// Stable lowercase name used in log fields.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SseServer => "sse-server",
            Self::SseClient => "sse-client",
            Self::StreamableHttpServer => "streamable-http-server",
            Self::StreamableHttpClient => "streamable-http-client",
            Self::Process => "process",
        }
    }
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification emitted by a transport.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete inbound message.
    Message(Value),
    /// The transport closed; emitted at most once.
    Closed,
    /// The transport failed; the owner tears the session down.
    Error(AppError),
    /// A message accepted by `send` could not be delivered.
    ///
    /// `id` is the request id when the message was a request.  The owner
    /// answers the sender, then tears the session down.
    SendFailed {
        /// Id of the undelivered request, if it was one.
        id: Option<Value>,
        /// Why delivery failed.
        error: AppError,
    },
}

/// Common contract for every transport variant.
///
/// Implementations must make `start` and `close` idempotent and emit
/// [`TransportEvent::Closed`] at most once.
pub trait Transport: Send + Sync {
    /// Variant tag.
    fn kind(&self) -> TransportKind;

    /// Access to the concrete variant, for HTTP ingress routing.
    fn as_any(&self) -> &dyn Any;

    /// Session identifier, once one has been assigned.
    fn session_id(&self) -> Option<String>;

    /// Perform the handshake or spawn.  Calling it again is a no-op.
    ///
    /// # Errors
    ///
    /// Variant specific; remote variants return
    /// [`AppError::Unauthorized`] on HTTP 401.
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    /// Deliver one message to the peer.
    ///
    /// # Errors
    ///
    /// [`AppError::NotConnected`] before `start`, [`AppError::Disconnected`]
    /// after close, or a variant-specific delivery error.
    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>>;

    /// Shut the transport down.
    ///
    /// # Errors
    ///
    /// Variant specific; closing twice is not an error.
    fn close(&self) -> BoxFuture<'_, Result<()>>;

    /// Close because the session failed with `error`.
    ///
    /// The default delivers a synthesized error notification if the peer is
    /// still reachable, then closes.
    fn fail(&self, error: AppError) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Err(err) = self.send(error_notification(&error)).await {
                debug!(transport = %self.kind(), %err, "error notification not delivered");
            }
            self.close().await
        })
    }
}

/// Sending half of a transport's event channel.
///
/// Guarantees `Closed` is emitted once and suppresses everything after it.
#[derive(Debug)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<TransportEvent>,
    closed: AtomicBool,
}

impl EventSender {
    /// Create a sender and its matching [`TransportEvents`] receiver.
    #[must_use]
    pub fn channel() -> (Self, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                closed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Report an inbound message.  Returns `false` once closed.
    pub fn message(&self, message: Value) -> bool {
        if self.is_closed() {
            return false;
        }
        self.tx.send(TransportEvent::Message(message)).is_ok()
    }

    /// Report a failure.
    pub fn error(&self, error: AppError) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::Error(error));
        }
    }

    /// Report a message that failed after `send` returned.
    pub fn send_failed(&self, id: Option<Value>, error: AppError) {
        if !self.is_closed() {
            let _ = self.tx.send(TransportEvent::SendFailed { id, error });
        }
    }

    /// Report closure.  Returns `true` only for the first call.
    pub fn closed(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.tx.send(TransportEvent::Closed);
        true
    }

    /// Whether [`closed`](Self::closed) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Map an upstream HTTP status to the proxy's error taxonomy.
///
/// `401` becomes [`AppError::Unauthorized`] and is never retried; any other
/// non-success status becomes [`AppError::Transport`].
///
/// # Errors
///
/// Returns the classified error for non-success responses.
pub(crate) async fn ensure_success(
    response: reqwest::Response,
    context: &str,
) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let detail = if body.trim().is_empty() {
        format!("{context} returned HTTP {status}")
    } else {
        format!("{context} returned HTTP {status}: {}", body.trim())
    };
    if status == reqwest::StatusCode::UNAUTHORIZED {
        Err(AppError::Unauthorized(detail))
    } else {
        Err(AppError::Transport(detail))
    }
}

/// Notification delivered to the client when the session fails.
#[must_use]
pub fn error_notification(error: &AppError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/message",
        "params": {
            "level": "error",
            "logger": NOTIFICATION_LOGGER,
            "data": { "message": error.to_string() },
        },
    })
}

/// Notification carrying a chunk of agent process stderr.
#[must_use]
pub fn stderr_notification(content: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": "notifications/stderr",
        "params": { "content": content },
    })
}

/// JSON-RPC error response for request `id` that could not be forwarded.
#[must_use]
pub fn forward_error_response(id: &Value, error: &AppError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": FORWARD_ERROR_CODE,
            "message": error.to_string(),
        },
    })
}

/// Id of a JSON-RPC request (a message with both `method` and a non-null `id`).
#[must_use]
pub fn request_id(message: &Value) -> Option<&Value> {
    if message.get("method").is_none() {
        return None;
    }
    message.get("id").filter(|id| !id.is_null())
}

/// Id of a JSON-RPC response (a message with an `id` and `result` or `error`).
#[must_use]
pub fn response_id(message: &Value) -> Option<&Value> {
    if message.get("method").is_some() {
        return None;
    }
    if message.get("result").is_none() && message.get("error").is_none() {
        return None;
    }
    message.get("id")
}

/// Whether `message` is the given JSON-RPC method.
#[must_use]
pub fn is_method(message: &Value, method: &str) -> bool {
    message.get("method").and_then(Value::as_str) == Some(method)
}

/// Canonical string key for a JSON-RPC id (numbers and strings never collide).
#[must_use]
pub fn id_key(id: &Value) -> String {
    id.to_string()
}

/// Split a JSON-RPC body into individual messages (arrays are batches).
///
/// # Errors
///
/// Returns [`AppError::BadRequest`] for anything other than an object or a
/// non-empty array of objects.
pub fn split_batch(body: Value) -> Result<Vec<Value>> {
    match body {
        Value::Object(_) => Ok(vec![body]),
        Value::Array(items) if !items.is_empty() && items.iter().all(Value::is_object) => {
            Ok(items)
        }
        _ => Err(AppError::BadRequest(
            "body must be a JSON-RPC object or a non-empty batch".into(),
        )),
    }
}
