//! HTTP surface: the three connection styles plus health, config, and logs.
//!
//! | Route                     | Purpose                                        |
//! |---------------------------|------------------------------------------------|
//! | `POST/GET/DELETE /mcp`    | streaming-HTTP sessions (`mcp-session-id`)     |
//! | `GET /sse`                | push-stream session backed by any agent kind   |
//! | `GET /stdio`              | push-stream session backed by a process        |
//! | `POST /message`           | side channel for push-stream sessions          |
//! | `GET /health`             | liveness probe                                 |
//! | `GET /config`             | default agent environment and command          |
//! | `POST /api/log`           | append a line to a named log                   |
//! | `GET /api/logs/{server}`  | read a named log                               |

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::headers::{carries_credentials, forward_headers, header_str, MCP_SESSION_ID};
use crate::logs::LogStore;
use crate::pump;
use crate::session::SessionRegistry;
use crate::transport::factory::{BackingTarget, Connector};
use crate::transport::sse_server::SseServerTransport;
use crate::transport::streamable_server::{PendingSession, StreamableHttpServerTransport};
use crate::transport::Transport;
use crate::{AppError, Result};

/// Path announced to push-stream clients for their side channel.
pub const MESSAGE_PATH: &str = "/message";

/// Shared state handed to every handler.
pub struct AppState {
    /// Effective configuration.
    pub config: Arc<GlobalConfig>,
    /// Active sessions.
    pub registry: Arc<SessionRegistry>,
    /// Agent transport builder.
    pub connector: Connector,
    /// Named log files.
    pub logs: LogStore,
}

impl AppState {
    /// Build state from configuration, creating the log directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client or log directory cannot
    /// be set up.
    pub fn new(config: GlobalConfig) -> Result<Self> {
        let connector = Connector::new(&config)?;
        let logs = LogStore::new(config.log_dir.clone())?;
        Ok(Self {
            config: Arc::new(config),
            registry: Arc::new(SessionRegistry::new()),
            connector,
            logs,
        })
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Build the router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", get(mcp_get).post(mcp_post).delete(mcp_delete))
        .route("/sse", get(sse_connect))
        .route("/stdio", get(stdio_connect))
        .route(MESSAGE_PATH, post(message_post))
        .route("/health", get(health))
        .route("/config", get(config_echo))
        .route("/api/log", post(append_log))
        .route("/api/logs/{server_name}", get(read_log))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve on `listener` until `ct` is cancelled, then close every session.
///
/// # Errors
///
/// Returns `AppError::Config` if the server fails.
pub async fn serve(state: Arc<AppState>, listener: TcpListener, ct: CancellationToken) -> Result<()> {
    let addr = listener
        .local_addr()
        .map_err(|err| AppError::Config(format!("listener has no local address: {err}")))?;
    info!(%addr, "proxy listening");

    let registry = Arc::clone(&state.registry);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            ct.cancelled().await;
            close_all(&registry).await;
        })
        .await
        .map_err(|err| AppError::Config(format!("http server error: {err}")))?;

    info!("proxy shut down");
    Ok(())
}

/// Close both transports of every registered session.
pub async fn close_all(registry: &SessionRegistry) {
    let sessions = registry.drain();
    if !sessions.is_empty() {
        info!(count = sessions.len(), "closing active sessions");
    }
    for session in sessions {
        close_pair(Some(&session.id), &session.client, &session.agent).await;
    }
}

/// Close both sides of a session, logging failures.
async fn close_pair(
    session_id: Option<&str>,
    client: &Arc<dyn Transport>,
    agent: &Arc<dyn Transport>,
) {
    if let Err(err) = agent.close().await {
        debug!(session_id = ?session_id, %err, "closing agent transport failed");
    }
    if let Err(err) = client.close().await {
        debug!(session_id = ?session_id, %err, "closing client transport failed");
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn config_echo(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "defaultEnvironment": state.config.merged_environment(),
        "defaultCommand": state.config.default_command,
        "defaultArgs": state.config.default_args,
    }))
}

#[derive(Debug, Deserialize)]
struct LogRequest {
    message: String,
    #[serde(rename = "serverName", default)]
    server_name: Option<String>,
}

async fn append_log(State(state): State<Arc<AppState>>, Json(req): Json<LogRequest>) -> Response {
    let server_name = req.server_name.as_deref().filter(|s| !s.trim().is_empty());
    info!(server_name = server_name.unwrap_or("proxy"), message = %req.message, "client log");
    match state.logs.append(server_name, &req.message) {
        Ok(()) => Json(json!({ "status": "ok" })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn read_log(State(state): State<Arc<AppState>>, Path(server_name): Path<String>) -> Response {
    match state.logs.read(&server_name) {
        Ok(lines) => Json(json!({ "serverName": server_name, "lines": lines })).into_response(),
        Err(err) => err.into_response(),
    }
}

// ── Streaming-HTTP style ─────────────────────────────────────────────────────

async fn mcp_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(id) = header_str(&headers, &MCP_SESSION_ID) {
        let client = match streamable_client(&state, id) {
            Ok(client) => client,
            Err(err) => return err.into_response(),
        };
        return match client.as_any().downcast_ref::<StreamableHttpServerTransport>() {
            Some(transport) => transport.handle_post(&headers, body).await,
            None => wrong_style(id),
        };
    }

    let target = match BackingTarget::from_query(&query, &state.config) {
        Ok(target) => target,
        Err(err) => return err.into_response(),
    };
    let span = info_span!("session", style = "streamable-http", target = %target.describe());
    open_streamable_session(state, target, headers, body)
        .instrument(span)
        .await
}

async fn mcp_get(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(id) = header_str(&headers, &MCP_SESSION_ID) else {
        return AppError::BadRequest("mcp-session-id header is required".into()).into_response();
    };
    match streamable_client(&state, id) {
        Ok(client) => match client.as_any().downcast_ref::<StreamableHttpServerTransport>() {
            Some(transport) => transport.handle_get(&headers),
            None => wrong_style(id),
        },
        Err(err) => err.into_response(),
    }
}

async fn mcp_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(id) = header_str(&headers, &MCP_SESSION_ID) else {
        return AppError::BadRequest("mcp-session-id header is required".into()).into_response();
    };
    match streamable_client(&state, id) {
        Ok(client) => match client.as_any().downcast_ref::<StreamableHttpServerTransport>() {
            Some(transport) => transport.handle_delete(&headers).await,
            None => wrong_style(id),
        },
        Err(err) => err.into_response(),
    }
}

fn streamable_client(state: &AppState, id: &str) -> Result<Arc<dyn Transport>> {
    state
        .registry
        .client(id)
        .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))
}

fn wrong_style(id: &str) -> Response {
    AppError::BadRequest(format!("session {id} does not use this connection style")).into_response()
}

/// Connect the agent, then replay the first POST into a fresh server
/// transport; the pair is registered once `initialize` assigns the id.
async fn open_streamable_session(
    state: Arc<AppState>,
    target: BackingTarget,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!("session opening");
    let (agent, agent_events) = match state.connector.connect(&target, &headers).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%err, "agent connection failed");
            return err.into_response();
        }
    };
    log_authenticated(&target, &headers);

    let PendingSession {
        transport,
        events,
        initialized,
    } = StreamableHttpServerTransport::begin();
    let client: Arc<dyn Transport> = Arc::clone(&transport) as Arc<dyn Transport>;

    let post = transport.handle_post(&headers, body);
    tokio::pin!(post);
    tokio::pin!(initialized);

    let mut waiting = true;
    let mut registered = false;
    let mut pending_events = Some((events, agent_events));

    let response = loop {
        tokio::select! {
            response = &mut post => break response,
            assigned = &mut initialized, if waiting => {
                waiting = false;
                let Ok(id) = assigned else { continue };
                let Some((client_events, agent_events)) = pending_events.take() else { continue };
                match state.registry.register(&id, Arc::clone(&client), Arc::clone(&agent)) {
                    Ok(session) => {
                        drop(pump::link(&session, client_events, agent_events, Arc::clone(&state.registry)));
                        registered = true;
                        info!(session_id = %id, "session established");
                    }
                    Err(err) => warn!(session_id = %id, %err, "session registration failed"),
                }
            }
        }
    };

    if !registered {
        debug!("session never initialized, releasing agent");
        close_pair(None, &client, &agent).await;
    }
    response
}

// ── Push-stream style ────────────────────────────────────────────────────────

async fn sse_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    match BackingTarget::from_query(&query, &state.config) {
        Ok(target) => {
            let span = info_span!("session", style = "sse", target = %target.describe());
            open_push_session(state, target, headers).instrument(span).await
        }
        Err(err) => err.into_response(),
    }
}

async fn stdio_connect(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    match BackingTarget::process_from_query(&query, &state.config) {
        Ok(target) => {
            let span = info_span!("session", style = "stdio", target = %target.describe());
            open_push_session(state, target, headers).instrument(span).await
        }
        Err(err) => err.into_response(),
    }
}

async fn open_push_session(
    state: Arc<AppState>,
    target: BackingTarget,
    headers: HeaderMap,
) -> Response {
    info!("session opening");
    let (agent, agent_events) = match state.connector.connect(&target, &headers).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(%err, "agent connection failed");
            return err.into_response();
        }
    };
    log_authenticated(&target, &headers);

    let (transport, client_events, body) = SseServerTransport::new(MESSAGE_PATH);
    let id = transport.id().to_owned();
    let client: Arc<dyn Transport> = transport;

    match state
        .registry
        .register(&id, Arc::clone(&client), Arc::clone(&agent))
    {
        Ok(session) => {
            drop(pump::link(&session, client_events, agent_events, Arc::clone(&state.registry)));
            info!(session_id = %id, "session established");
            body.into_response()
        }
        Err(err) => {
            warn!(session_id = %id, %err, "session registration failed");
            close_pair(Some(&id), &client, &agent).await;
            err.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageQuery {
    #[serde(rename = "sessionId", alias = "session_id")]
    session_id: Option<String>,
}

async fn message_post(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MessageQuery>,
    body: Bytes,
) -> Response {
    let Some(id) = query.session_id.filter(|id| !id.is_empty()) else {
        return AppError::BadRequest("sessionId query parameter is required".into()).into_response();
    };
    let Some(client) = state.registry.client(&id) else {
        return AppError::NotFound(format!("session {id} not found")).into_response();
    };
    let Some(transport) = client.as_any().downcast_ref::<SseServerTransport>() else {
        return wrong_style(&id);
    };

    let message: Value = match serde_json::from_slice(&body) {
        Ok(message) => message,
        Err(err) => return AppError::BadRequest(format!("invalid JSON body: {err}")).into_response(),
    };
    match transport.handle_post_message(message) {
        Ok(()) => (StatusCode::ACCEPTED, "Accepted").into_response(),
        Err(AppError::Disconnected(_)) => {
            AppError::NotFound(format!("session {id} not found")).into_response()
        }
        Err(err) => err.into_response(),
    }
}

fn log_authenticated(target: &BackingTarget, headers: &HeaderMap) {
    if carries_credentials(&forward_headers(headers, target.passthrough())) {
        info!("agent connection authenticated");
    }
}
