//! In-memory [`Transport`] for exercising the registry and pump.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcp_bridge::transport::{
    BoxFuture, EventSender, Transport, TransportEvents, TransportKind,
};
use mcp_bridge::{AppError, Result};
use serde_json::Value;

pub struct MockTransport {
    kind: TransportKind,
    events: EventSender,
    sent: Mutex<Vec<Value>>,
    send_error: Mutex<Option<AppError>>,
    close_error: Mutex<Option<AppError>>,
    started: AtomicBool,
    closes: AtomicUsize,
}

impl MockTransport {
    pub fn new(kind: TransportKind) -> (Arc<Self>, TransportEvents) {
        let (events, rx) = EventSender::channel();
        (
            Arc::new(Self {
                kind,
                events,
                sent: Mutex::new(Vec::new()),
                send_error: Mutex::new(None),
                close_error: Mutex::new(None),
                started: AtomicBool::new(false),
                closes: AtomicUsize::new(0),
            }),
            rx,
        )
    }

    /// Simulate a message arriving from this transport's peer.
    pub fn emit(&self, message: Value) {
        self.events.message(message);
    }

    pub fn emit_error(&self, error: AppError) {
        self.events.error(error);
    }

    /// Simulate an accepted `send` that later failed to reach the peer.
    pub fn emit_send_failed(&self, id: Option<Value>, error: AppError) {
        self.events.send_failed(id, error);
    }

    pub fn emit_closed(&self) {
        self.events.closed();
    }

    /// Make every later `send` fail with `error`.
    pub fn fail_sends_with(&self, error: AppError) {
        *self.send_error.lock().unwrap() = Some(error);
    }

    /// Make every later `close` report `error` after closing.
    pub fn fail_closes_with(&self, error: AppError) {
        *self.close_error.lock().unwrap() = Some(error);
    }

    pub fn sent(&self) -> Vec<Value> {
        self.sent.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }
}

impl Transport for MockTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if let Some(err) = self.send_error.lock().unwrap().clone() {
                return Err(err);
            }
            if self.events.is_closed() {
                return Err(AppError::Disconnected("mock closed".into()));
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closes.fetch_add(1, Ordering::SeqCst);
            self.events.closed();
            match self.close_error.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        })
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
