//! Minimal backing agents for end-to-end proxy tests.
//!
//! Both agents answer every request with `{"echo": <method>}` and record
//! the headers they were sent.  The method `slow` is answered after
//! [`SLOW_REPLY`].

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::stream::{self, StreamExt};
use mcp_bridge::headers::{LAST_EVENT_ID, MCP_SESSION_ID};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Session id the streaming-HTTP agent hands out.
pub const AGENT_SESSION_ID: &str = "agent-session-1";

/// Token an agent accepts when authentication is required.
pub const GOOD_TOKEN: &str = "Bearer good-token";

/// How long the agent sits on a `slow` request.
pub const SLOW_REPLY: Duration = Duration::from_secs(3);

#[derive(Clone, Default)]
struct Shared {
    required: Option<&'static str>,
    endpoint: Option<&'static str>,
    standalone: bool,
    seen: Arc<Mutex<Vec<HeaderMap>>>,
    gets: Arc<Mutex<Vec<Option<String>>>>,
    deletes: Arc<AtomicUsize>,
    streams: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Event>>>>,
}

impl Shared {
    fn admit(&self, headers: &HeaderMap) -> bool {
        self.seen.lock().unwrap().push(headers.clone());
        match self.required {
            Some(token) => headers
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == token),
            None => true,
        }
    }
}

/// A running fake agent.
pub struct FakeAgent {
    pub base_url: String,
    shared: Shared,
    ct: CancellationToken,
}

impl Drop for FakeAgent {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

impl FakeAgent {
    /// Headers of every request received so far.
    pub fn seen(&self) -> Vec<HeaderMap> {
        self.shared.seen.lock().unwrap().clone()
    }

    /// Number of `DELETE` requests received.
    pub fn deletes(&self) -> usize {
        self.shared.deletes.load(Ordering::SeqCst)
    }

    /// `last-event-id` carried by each standalone `GET`, in order.
    pub fn standalone_gets(&self) -> Vec<Option<String>> {
        self.shared.gets.lock().unwrap().clone()
    }
}

fn echo(request: &Value) -> Option<Value> {
    let id = request.get("id")?;
    let method = request.get("method")?.as_str()?;
    Some(json!({"jsonrpc": "2.0", "id": id, "result": {"echo": method}}))
}

async fn spawn(router: Router, shared: Shared) -> FakeAgent {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind agent");
    let addr = listener.local_addr().expect("agent addr");
    let ct = CancellationToken::new();
    let stop = ct.clone();
    tokio::spawn(async move {
        let _ = axum::serve(listener, router)
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await;
    });
    FakeAgent {
        base_url: format!("http://{addr}"),
        shared,
        ct,
    }
}

// ── Streaming-HTTP agent ─────────────────────────────────────────────────────

/// Agent serving `/mcp` with JSON replies; `GET` is not supported.
pub async fn streamable_agent(required: Option<&'static str>) -> FakeAgent {
    streamable(Shared {
        required,
        ..Shared::default()
    })
    .await
}

/// Agent whose standalone `GET` stream sends `ev-1` and drops, then sends
/// `ev-2` on the next connection and stays open.
pub async fn streamable_agent_with_stream() -> FakeAgent {
    streamable(Shared {
        standalone: true,
        ..Shared::default()
    })
    .await
}

async fn streamable(shared: Shared) -> FakeAgent {
    let router = Router::new()
        .route(
            "/mcp",
            post(streamable_post)
                .get(streamable_get)
                .delete(streamable_delete),
        )
        .with_state(shared.clone());
    spawn(router, shared).await
}

async fn streamable_get(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    let resume = headers
        .get(LAST_EVENT_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    let attempt = {
        let mut gets = shared.gets.lock().unwrap();
        gets.push(resume);
        gets.len()
    };
    if !shared.standalone {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }

    let id = format!("ev-{attempt}");
    let note = json!({
        "jsonrpc": "2.0",
        "method": "notifications/progress",
        "params": {"attempt": attempt},
    });
    let first = stream::iter([Ok::<_, Infallible>(
        Event::default().id(id).event("message").data(note.to_string()),
    )]);
    let body = if attempt == 1 {
        first.boxed()
    } else {
        first.chain(stream::pending()).boxed()
    };
    Sse::new(body).into_response()
}

async fn streamable_post(
    State(shared): State<Shared>,
    headers: HeaderMap,
    Json(request): Json<Value>,
) -> Response {
    if !shared.admit(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if request.get("method").and_then(Value::as_str) == Some("slow") {
        tokio::time::sleep(SLOW_REPLY).await;
    }
    match echo(&request) {
        Some(reply) => ([(MCP_SESSION_ID, AGENT_SESSION_ID)], Json(reply)).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

async fn streamable_delete(State(shared): State<Shared>, headers: HeaderMap) -> StatusCode {
    shared.seen.lock().unwrap().push(headers);
    shared.deletes.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

// ── Push-stream agent ────────────────────────────────────────────────────────

/// Agent serving `GET /sse` plus its `/messages` side channel.
pub async fn sse_agent(required: Option<&'static str>) -> FakeAgent {
    push_agent(Shared {
        required,
        ..Shared::default()
    })
    .await
}

/// Push-stream agent that announces `endpoint` verbatim.
pub async fn sse_agent_announcing(endpoint: &'static str) -> FakeAgent {
    push_agent(Shared {
        endpoint: Some(endpoint),
        ..Shared::default()
    })
    .await
}

async fn push_agent(shared: Shared) -> FakeAgent {
    let router = Router::new()
        .route("/sse", get(sse_open))
        .route("/messages", post(sse_message))
        .with_state(shared.clone());
    spawn(router, shared).await
}

async fn sse_open(State(shared): State<Shared>, headers: HeaderMap) -> Response {
    if !shared.admit(&headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let endpoint = shared
        .endpoint
        .map_or_else(|| format!("/messages?sessionId={id}"), str::to_owned);
    let _ = tx.send(Event::default().event("endpoint").data(endpoint));
    shared.streams.lock().unwrap().insert(id, tx);

    let body = stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok::<_, Infallible>(event), rx))
    });
    Sse::new(body).into_response()
}

async fn sse_message(
    State(shared): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
    Json(request): Json<Value>,
) -> StatusCode {
    let Some(id) = query.get("sessionId") else {
        return StatusCode::BAD_REQUEST;
    };
    let streams = shared.streams.lock().unwrap();
    let Some(tx) = streams.get(id) else {
        return StatusCode::NOT_FOUND;
    };
    if let Some(reply) = echo(&request) {
        let _ = tx.send(Event::default().event("message").data(reply.to_string()));
    }
    StatusCode::ACCEPTED
}
