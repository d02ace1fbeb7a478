//! Streaming-HTTP server transport facing the browser (`/mcp`).
//!
//! A session starts with a POST carrying `initialize`.  The transport assigns
//! the session id at that point and reports it through the `initialized`
//! receiver of [`PendingSession`], which lets the HTTP surface register the
//! pair before any reply can arrive.  Every later POST must carry the id in
//! `mcp-session-id`.
//!
//! Replies are routed back to the POST that carried the matching request id,
//! as a JSON body or as an event stream depending on the client's `Accept`.
//! Messages the agent initiates go to the standalone `GET` stream when one is
//! open, otherwise to any open request stream.

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::sse_client::EVENT_STREAM;
use super::{
    error_notification, id_key, is_method, request_id, response_id, split_batch, BoxFuture,
    EventSender, Transport, TransportEvents, TransportKind,
};
use crate::headers::{header_str, value, MCP_SESSION_ID};
use crate::{AppError, Result};

/// What the agent side handed back for a pending request.
#[derive(Debug)]
enum Reply {
    Message(Value),
    Fail(AppError),
}

type ReplySender = mpsc::UnboundedSender<Reply>;

/// A transport whose session id is not known until `initialize` arrives.
pub struct PendingSession {
    /// The transport; hand its POST bodies to [`StreamableHttpServerTransport::handle_post`].
    pub transport: Arc<StreamableHttpServerTransport>,
    /// Inbound event receiver for the pump.
    pub events: TransportEvents,
    /// Resolves with the session id once `initialize` has been accepted.
    pub initialized: oneshot::Receiver<String>,
}

/// Browser-facing streaming-HTTP transport.
pub struct StreamableHttpServerTransport {
    session_id: OnceLock<String>,
    on_initialized: Mutex<Option<oneshot::Sender<String>>>,
    events: EventSender,
    pending: Mutex<HashMap<String, ReplySender>>,
    standalone: Mutex<Option<mpsc::UnboundedSender<Event>>>,
    started: AtomicBool,
    closer: CancellationToken,
}

impl StreamableHttpServerTransport {
    /// Create a transport awaiting its `initialize` request.
    #[must_use]
    pub fn begin() -> PendingSession {
        let (events, rx) = EventSender::channel();
        let (tx, initialized) = oneshot::channel();
        PendingSession {
            transport: Arc::new(Self {
                session_id: OnceLock::new(),
                on_initialized: Mutex::new(Some(tx)),
                events,
                pending: Mutex::new(HashMap::new()),
                standalone: Mutex::new(None),
                started: AtomicBool::new(false),
                closer: CancellationToken::new(),
            }),
            events: rx,
            initialized,
        }
    }

    /// Handle one `POST /mcp` body.
    pub async fn handle_post(&self, headers: &HeaderMap, body: Bytes) -> Response {
        let parsed: Value = match serde_json::from_slice(&body) {
            Ok(parsed) => parsed,
            Err(err) => {
                return rpc_error(StatusCode::BAD_REQUEST, -32700, &format!("parse error: {err}"));
            }
        };
        let is_batch = parsed.is_array();
        let messages = match split_batch(parsed) {
            Ok(messages) => messages,
            Err(err) => return rpc_error(StatusCode::BAD_REQUEST, -32600, &err.to_string()),
        };

        if messages.iter().any(|m| is_method(m, "initialize")) {
            if let Err(response) = self.initialize(messages.len()) {
                return response;
            }
        } else if let Err(response) = self.validate_session(headers) {
            return response;
        }

        if self.events.is_closed() {
            return rpc_error(StatusCode::NOT_FOUND, -32001, "session not found");
        }

        let ids: HashSet<String> = messages
            .iter()
            .filter_map(request_id)
            .map(id_key)
            .collect();

        if ids.is_empty() {
            for message in messages {
                self.events.message(message);
            }
            return self.with_session_header(StatusCode::ACCEPTED.into_response());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut pending = lock(&self.pending);
            for id in &ids {
                pending.insert(id.clone(), tx.clone());
            }
        }
        drop(tx);

        for message in messages {
            self.events.message(message);
        }

        let response = if wants_event_stream(headers) {
            stream_replies(rx, ids).await
        } else {
            collect_replies(rx, ids, is_batch).await
        };
        self.with_session_header(response)
    }

    /// Handle `GET /mcp`: open the standalone stream for agent-initiated messages.
    pub fn handle_get(&self, headers: &HeaderMap) -> Response {
        if let Err(response) = self.validate_session(headers) {
            return response;
        }
        if !wants_event_stream(headers) {
            return rpc_error(
                StatusCode::NOT_ACCEPTABLE,
                -32000,
                "client must accept text/event-stream",
            );
        }

        let rx = {
            let mut slot = lock(&self.standalone);
            if slot.as_ref().is_some_and(|tx| !tx.is_closed()) {
                return rpc_error(
                    StatusCode::CONFLICT,
                    -32000,
                    "only one standalone stream is allowed per session",
                );
            }
            let (tx, rx) = mpsc::unbounded_channel::<Event>();
            *slot = Some(tx);
            rx
        };

        debug!(session_id = ?self.session_id.get(), "standalone stream opened");
        let body = stream::unfold(
            (rx, self.closer.clone()),
            |(mut rx, closer)| async move {
                let next = tokio::select! {
                    biased;
                    event = rx.recv() => event,
                    () = closer.cancelled() => rx.try_recv().ok(),
                };
                next.map(|event| (Ok::<_, Infallible>(event), (rx, closer)))
            },
        );
        self.with_session_header(Sse::new(body).keep_alive(KeepAlive::default()).into_response())
    }

    /// Handle `DELETE /mcp`: end the session.
    pub async fn handle_delete(&self, headers: &HeaderMap) -> Response {
        if let Err(response) = self.validate_session(headers) {
            return response;
        }
        info!(session_id = ?self.session_id.get(), "client requested session termination");
        if let Err(err) = self.close().await {
            debug!(session_id = ?self.session_id.get(), %err, "closing session failed");
        }
        StatusCode::OK.into_response()
    }

    fn initialize(&self, batch_len: usize) -> std::result::Result<(), Response> {
        if batch_len > 1 {
            return Err(rpc_error(
                StatusCode::BAD_REQUEST,
                -32600,
                "initialize must not be batched",
            ));
        }
        let id = Uuid::new_v4().to_string();
        if self.session_id.set(id.clone()).is_err() {
            return Err(rpc_error(
                StatusCode::BAD_REQUEST,
                -32600,
                "session already initialized",
            ));
        }
        if let Some(tx) = lock(&self.on_initialized).take() {
            let _ = tx.send(id.clone());
        }
        debug!(session_id = %id, "session id assigned");
        Ok(())
    }

    fn validate_session(&self, headers: &HeaderMap) -> std::result::Result<(), Response> {
        let Some(own) = self.session_id.get() else {
            return Err(rpc_error(
                StatusCode::BAD_REQUEST,
                -32000,
                "session not initialized",
            ));
        };
        match header_str(headers, &MCP_SESSION_ID) {
            None => Err(rpc_error(
                StatusCode::BAD_REQUEST,
                -32000,
                "mcp-session-id header is required",
            )),
            Some(id) if id != own => Err(rpc_error(StatusCode::NOT_FOUND, -32001, "session not found")),
            Some(_) => Ok(()),
        }
    }

    fn with_session_header(&self, mut response: Response) -> Response {
        if let Some(v) = self.session_id.get().map(String::as_str).and_then(value) {
            response.headers_mut().insert(MCP_SESSION_ID, v);
        }
        response
    }

    /// Deliver an agent-initiated message to whichever stream can carry it.
    fn route_unsolicited(&self, message: Value) {
        {
            let mut slot = lock(&self.standalone);
            if let Some(tx) = slot.as_ref() {
                if tx.send(message_event(&message)).is_ok() {
                    return;
                }
                *slot = None;
            }
        }
        let pending = lock(&self.pending);
        match pending.values().next() {
            Some(tx) => {
                let _ = tx.send(Reply::Message(message));
            }
            None => debug!(
                session_id = ?self.session_id.get(),
                "no open stream for agent-initiated message, dropping"
            ),
        }
    }
}

impl Transport for StreamableHttpServerTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::StreamableHttpServer
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.get().cloned()
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.started.load(Ordering::SeqCst) {
                return Err(AppError::NotConnected("streaming-HTTP session not started".into()));
            }
            if self.events.is_closed() {
                return Err(AppError::Disconnected("streaming-HTTP session closed".into()));
            }

            if let Some(id) = response_id(&message).map(id_key) {
                let tx = lock(&self.pending).remove(&id);
                match tx {
                    Some(tx) => {
                        let _ = tx.send(Reply::Message(message));
                    }
                    None => debug!(session_id = ?self.session_id.get(), id = %id, "reply for unknown request id, dropping"),
                }
                return Ok(());
            }

            self.route_unsolicited(message);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closer.cancel();
            lock(&self.pending).clear();
            lock(&self.standalone).take();
            self.events.closed();
            Ok(())
        })
    }

    /// Answer every pending request with the failure, so an auth rejection
    /// reaches the browser as an HTTP status, then close.
    fn fail(&self, error: AppError) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let pending: Vec<ReplySender> = lock(&self.pending).drain().map(|(_, tx)| tx).collect();
            for tx in pending {
                let _ = tx.send(Reply::Fail(error.clone()));
            }
            if let Some(tx) = lock(&self.standalone).as_ref() {
                let _ = tx.send(message_event(&error_notification(&error)));
            }
            self.close().await
        })
    }
}

fn lock<T>(slot: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get_all(ACCEPT)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains(EVENT_STREAM))
}

fn message_event(message: &Value) -> Event {
    Event::default().event("message").data(message.to_string())
}

fn rpc_error(status: StatusCode, code: i64, message: &str) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "error": { "code": code, "message": message },
        "id": Value::Null,
    });
    (status, Json(body)).into_response()
}

fn closed_response() -> Response {
    AppError::NotFound("session closed".into()).into_response()
}

/// JSON mode: wait for every reply, then answer in one body.
async fn collect_replies(
    mut rx: mpsc::UnboundedReceiver<Reply>,
    mut remaining: HashSet<String>,
    is_batch: bool,
) -> Response {
    let mut replies = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        match rx.recv().await {
            Some(Reply::Message(message)) => {
                let matched = response_id(&message).is_some_and(|id| remaining.remove(&id_key(id)));
                if matched {
                    replies.push(message);
                }
            }
            Some(Reply::Fail(err)) => return err.into_response(),
            None => return closed_response(),
        }
    }

    let body = if !is_batch && replies.len() == 1 {
        replies.pop().unwrap_or(Value::Null)
    } else {
        Value::Array(replies)
    };
    let mut response = Json(body).into_response();
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

struct ReplyStream {
    first: Option<Reply>,
    rx: mpsc::UnboundedReceiver<Reply>,
    remaining: HashSet<String>,
    done: bool,
}

/// Event-stream mode: hold the response until the first reply so a failure
/// can still choose the status, then stream until every request is answered.
async fn stream_replies(mut rx: mpsc::UnboundedReceiver<Reply>, remaining: HashSet<String>) -> Response {
    let first = match rx.recv().await {
        Some(Reply::Fail(err)) => return err.into_response(),
        Some(reply) => reply,
        None => return closed_response(),
    };

    let state = ReplyStream {
        first: Some(first),
        rx,
        remaining,
        done: false,
    };
    let body = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let reply = match state.first.take() {
            Some(reply) => reply,
            None => state.rx.recv().await?,
        };
        let event = match reply {
            Reply::Message(message) => {
                if let Some(id) = response_id(&message) {
                    state.remaining.remove(&id_key(id));
                }
                state.done = state.remaining.is_empty();
                message_event(&message)
            }
            Reply::Fail(err) => {
                state.done = true;
                message_event(&error_notification(&err))
            }
        };
        Some((Ok::<_, Infallible>(event), state))
    })
    .boxed();

    Sse::new(body).keep_alive(KeepAlive::default()).into_response()
}
