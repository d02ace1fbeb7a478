//! Bidirectional message pump between a session's two transports.
//!
//! Each direction runs in its own task so a slow agent request never stalls
//! agent-to-client traffic; within a direction messages are handed to the
//! transport in arrival order.  A transport that sends in the background
//! reports late failures as `SendFailed`.  The first `Closed` or `Error` from either side stops both
//! directions, unregisters the session, and closes the other side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::session::{Session, SessionRegistry};
use crate::transport::{
    forward_error_response, request_id, Transport, TransportEvent, TransportEvents, TransportKind,
};
use crate::AppError;

/// Which end of the session raised an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Agent,
}

impl Side {
    fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Agent => "agent",
        }
    }
}

struct Link {
    session_id: String,
    client: Arc<dyn Transport>,
    agent: Arc<dyn Transport>,
    registry: Arc<SessionRegistry>,
    stop: CancellationToken,
    torn_down: AtomicBool,
}

/// Start forwarding between `session.client` and `session.agent`.
///
/// The session must already be registered; the pump removes it on teardown.
/// The returned handle completes once both directions have stopped and the
/// session is torn down.
#[must_use]
pub fn link(
    session: &Session,
    client_events: TransportEvents,
    agent_events: TransportEvents,
    registry: Arc<SessionRegistry>,
) -> JoinHandle<()> {
    let link = Arc::new(Link {
        session_id: session.id.clone(),
        client: Arc::clone(&session.client),
        agent: Arc::clone(&session.agent),
        registry,
        stop: CancellationToken::new(),
        torn_down: AtomicBool::new(false),
    });

    tokio::spawn(async move {
        if let Err(err) = link.client.start().await {
            warn!(session_id = %link.session_id, %err, "client transport failed to start");
            link.teardown(Side::Client, Some(err)).await;
            return;
        }
        if let Err(err) = link.agent.start().await {
            warn!(session_id = %link.session_id, %err, "agent transport failed to start");
            link.teardown(Side::Agent, Some(err)).await;
            return;
        }

        debug!(
            session_id = %link.session_id,
            client = %link.client.kind(),
            agent = %link.agent.kind(),
            "pump started"
        );

        let upstream = tokio::spawn(Arc::clone(&link).run(Side::Client, client_events));
        let downstream = tokio::spawn(Arc::clone(&link).run(Side::Agent, agent_events));
        let _ = tokio::join!(upstream, downstream);
    })
}

impl Link {
    /// Drain `events` from `from` into the opposite transport.
    async fn run(self: Arc<Self>, from: Side, mut events: TransportEvents) {
        loop {
            let event = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(TransportEvent::Message(message)) => {
                    if let Err((side, err)) = self.forward(from, message).await {
                        self.teardown(side, Some(err)).await;
                        break;
                    }
                }
                Some(TransportEvent::Error(err)) => {
                    self.teardown(from, Some(err)).await;
                    break;
                }
                Some(TransportEvent::SendFailed { id, error }) => {
                    if from == Side::Agent {
                        self.answer_failed_request(id.as_ref(), &error).await;
                    }
                    self.teardown(from, Some(error)).await;
                    break;
                }
                Some(TransportEvent::Closed) | None => {
                    self.teardown(from, None).await;
                    break;
                }
            }
        }
    }

    /// Send `message` to the side opposite `from`.
    ///
    /// On failure returns the side to blame and the error.
    async fn forward(&self, from: Side, message: Value) -> Result<(), (Side, AppError)> {
        match from {
            Side::Client => {
                let id = request_id(&message).cloned();
                match self.agent.send(message).await {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        self.answer_failed_request(id.as_ref(), &err).await;
                        Err((Side::Agent, err))
                    }
                }
            }
            Side::Agent => self
                .client
                .send(message)
                .await
                .map_err(|err| (Side::Client, err)),
        }
    }

    /// Answer a client request the agent never received.
    ///
    /// A streaming-HTTP client learns about an auth rejection from the HTTP
    /// status `fail` produces, so it gets no JSON-RPC error for it; every
    /// other client gets one carrying the request id.
    async fn answer_failed_request(&self, id: Option<&Value>, err: &AppError) {
        let Some(id) = id else {
            return;
        };
        if err.is_unauthorized() && self.client.kind() == TransportKind::StreamableHttpServer {
            return;
        }
        let reply = forward_error_response(id, err);
        if let Err(send_err) = self.client.send(reply).await {
            debug!(session_id = %self.session_id, %send_err, "forward error reply not delivered");
        }
    }

    /// Stop both directions, unregister, and close whatever is still open.
    async fn teardown(&self, side: Side, error: Option<AppError>) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        self.registry.unregister(&self.session_id);

        match &error {
            Some(err) => warn!(
                session_id = %self.session_id,
                side = side.as_str(),
                %err,
                "session closed after transport failure"
            ),
            None => info!(
                session_id = %self.session_id,
                side = side.as_str(),
                "session closed"
            ),
        }

        let (closing, other) = match side {
            Side::Client => (&self.client, &self.agent),
            Side::Agent => (&self.agent, &self.client),
        };

        let other_result = match (side, error) {
            (Side::Agent, Some(err)) => other.fail(err).await,
            _ => other.close().await,
        };
        if let Err(err) = other_result {
            debug!(session_id = %self.session_id, %err, "closing peer transport failed");
        }
        if let Err(err) = closing.close().await {
            debug!(session_id = %self.session_id, %err, "closing transport failed");
        }
    }
}
