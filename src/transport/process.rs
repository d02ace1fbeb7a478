//! Agent-facing transport backed by a spawned local process.
//!
//! The child's stdout is newline-delimited JSON, decoded with
//! [`LineDecoder`](crate::codec::LineDecoder).  stderr lines are logged and
//! surfaced to the client as `notifications/stderr`.  The child exiting, for
//! any reason, closes the transport.
//!
//! The child runs with a cleared environment: only [`ALLOWED_ENV_VARS`] are
//! inherited, then configured defaults and per-connection overrides are
//! layered on top.
//!
//! By default stdin is not connected and [`Transport::send`] discards
//! messages.  With [`StdinMode::Piped`] each message is written to stdin as
//! one NDJSON line.

use std::any::Any;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStderr, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{stderr_notification, BoxFuture, EventSender, Transport, TransportEvents, TransportKind};
use crate::codec::LineDecoder;
use crate::{AppError, Result};

/// Environment variables inherited from the proxy by spawned agents.
///
/// Everything else is stripped with `env_clear()` so credentials in the
/// proxy's own environment never reach the child.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "LOGNAME",
    "SHELL",
    "TERM",
    "LANG",
    "TMPDIR",
    "RUST_LOG",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "USERNAME",
    "APPDATA",
    "LOCALAPPDATA",
    "COMSPEC",
    "PATHEXT",
];

const READ_CHUNK_BYTES: usize = 8192;
const READER_DRAIN: Duration = Duration::from_secs(1);

/// The allow-listed subset of the proxy's own environment.
#[must_use]
pub fn inherited_environment() -> BTreeMap<String, String> {
    ALLOWED_ENV_VARS
        .iter()
        .filter_map(|&key| std::env::var(key).ok().map(|val| (key.to_owned(), val)))
        .collect()
}

/// How the child's stdin is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdinMode {
    /// stdin is `/dev/null`; the transport only listens.
    #[default]
    Null,
    /// Sent messages are written to stdin as NDJSON.
    Piped,
}

/// What to spawn.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Executable name or path.
    pub command: String,
    /// Arguments, already split.
    pub args: Vec<String>,
    /// Per-connection environment overrides.
    pub env: BTreeMap<String, String>,
    /// Logical server name used in logs.
    pub server_name: Option<String>,
    /// stdin wiring.
    pub stdin: StdinMode,
}

impl ProcessSpec {
    /// Name used in log fields: the server name, else the command.
    #[must_use]
    pub fn label(&self) -> &str {
        self.server_name.as_deref().unwrap_or(&self.command)
    }
}

/// Resolve `command` against `path` the way a shell would.
///
/// Commands containing a path separator are returned unchanged.
///
/// # Errors
///
/// Returns `AppError::Process` if no matching file exists on `path`.
pub fn resolve_command(command: &str, path: Option<&str>) -> Result<PathBuf> {
    if command.trim().is_empty() {
        return Err(AppError::Process("no command given".into()));
    }
    let candidate = Path::new(command);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return Ok(candidate.to_path_buf());
    }

    let found = path.and_then(|path| {
        std::env::split_paths(path).find_map(|dir| {
            let full = dir.join(command);
            if full.is_file() {
                return Some(full);
            }
            if cfg!(windows) {
                return [".exe", ".cmd", ".bat"]
                    .iter()
                    .map(|ext| dir.join(format!("{command}{ext}")))
                    .find(|p| p.is_file());
            }
            None
        })
    });

    found.ok_or_else(|| AppError::Process(format!("command not found: {command}")))
}

/// Agent transport wrapping one child process.
pub struct ProcessTransport {
    spec: ProcessSpec,
    env: BTreeMap<String, String>,
    kill_grace: Duration,
    events: Arc<EventSender>,
    started: AtomicBool,
    spawned: AtomicBool,
    stdin_tx: OnceLock<mpsc::UnboundedSender<Value>>,
    cancel: CancellationToken,
}

impl ProcessTransport {
    /// Create an unstarted transport.
    ///
    /// `base_env` is the inherited allow-list merged with configured
    /// defaults; `spec.env` is applied on top of it.
    #[must_use]
    pub fn new(
        spec: ProcessSpec,
        base_env: &BTreeMap<String, String>,
        kill_grace: Duration,
    ) -> (Arc<Self>, TransportEvents) {
        let mut env = base_env.clone();
        env.extend(spec.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let (events, rx) = EventSender::channel();
        (
            Arc::new(Self {
                spec,
                env,
                kill_grace,
                events: Arc::new(events),
                started: AtomicBool::new(false),
                spawned: AtomicBool::new(false),
                stdin_tx: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
            rx,
        )
    }

    /// Effective environment handed to the child.
    #[must_use]
    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    fn spawn(&self) -> Result<()> {
        let label = self.spec.label().to_owned();
        let program = resolve_command(&self.spec.command, self.env.get("PATH").map(String::as_str))?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.spec.args)
            .env_clear()
            .envs(&self.env)
            .stdin(match self.spec.stdin {
                StdinMode::Null => Stdio::null(),
                StdinMode::Piped => Stdio::piped(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Process(format!("failed to spawn {}: {err}", self.spec.command))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stdout".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| AppError::Process("failed to capture agent stderr".into()))?;

        info!(
            server_name = %label,
            command = %program.display(),
            args = ?self.spec.args,
            pid = ?child.id(),
            "agent process spawned"
        );

        if let Some(stdin) = child.stdin.take() {
            let (tx, rx) = mpsc::unbounded_channel();
            let _ = self.stdin_tx.set(tx);
            tokio::spawn(run_writer(label.clone(), stdin, rx, self.cancel.clone()));
        }

        let readers = [
            tokio::spawn(read_stdout(label.clone(), stdout, Arc::clone(&self.events))),
            tokio::spawn(read_stderr(label.clone(), stderr, Arc::clone(&self.events))),
        ];
        tokio::spawn(supervise(
            label,
            child,
            readers,
            Arc::clone(&self.events),
            self.cancel.clone(),
            self.kill_grace,
        ));
        self.spawned.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn session_id(&self) -> Option<String> {
        None
    }

    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if self.started.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(AppError::Disconnected("process transport closed".into()));
            }
            self.spawn().inspect_err(|err| {
                warn!(server_name = %self.spec.label(), %err, "agent process failed to start");
            })
        })
    }

    fn send(&self, message: Value) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if !self.started.load(Ordering::SeqCst) {
                return Err(AppError::NotConnected("agent process not started".into()));
            }
            if self.cancel.is_cancelled() || self.events.is_closed() {
                return Err(AppError::Disconnected("agent process closed".into()));
            }
            match self.stdin_tx.get() {
                Some(tx) => tx
                    .send(message)
                    .map_err(|_| AppError::Disconnected("agent stdin closed".into())),
                None => {
                    debug!(server_name = %self.spec.label(), "receive-only process transport, message dropped");
                    Ok(())
                }
            }
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.cancel.cancel();
            // A running child reports Closed from its supervisor.
            if !self.spawned.load(Ordering::SeqCst) {
                self.events.closed();
            }
            Ok(())
        })
    }
}

/// Decode stdout chunks into messages until EOF.
async fn read_stdout(label: String, mut stdout: ChildStdout, events: Arc<EventSender>) {
    let mut decoder = LineDecoder::new(label.clone());
    let mut buf = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                if let Some(message) = decoder.finish() {
                    events.message(message);
                }
                debug!(server_name = %label, "agent stdout closed");
                return;
            }
            Ok(n) => {
                for message in decoder.push(&buf[..n]) {
                    events.message(message);
                }
            }
            Err(err) => {
                events.error(AppError::Process(format!("reading agent stdout failed: {err}")));
                return;
            }
        }
    }
}

/// Log stderr and surface it to the client.
async fn read_stderr(label: String, stderr: ChildStderr, events: Arc<EventSender>) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                debug!(server_name = %label, stderr = %line, "agent stderr");
                events.message(stderr_notification(&line));
            }
            Ok(None) => return,
            Err(err) => {
                debug!(server_name = %label, %err, "agent stderr unreadable");
                return;
            }
        }
    }
}

/// Serialise outbound messages to stdin as NDJSON.
async fn run_writer(
    label: String,
    mut stdin: ChildStdin,
    mut rx: mpsc::UnboundedReceiver<Value>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            message = rx.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let mut bytes = message.to_string().into_bytes();
        bytes.push(b'\n');
        if let Err(err) = stdin.write_all(&bytes).await {
            warn!(server_name = %label, %err, "write to agent stdin failed");
            break;
        }
    }
    debug!(server_name = %label, "agent stdin writer stopped");
}

/// Wait for exit or cancellation, then report `Closed`.
async fn supervise(
    label: String,
    mut child: Child,
    readers: [JoinHandle<()>; 2],
    events: Arc<EventSender>,
    cancel: CancellationToken,
    grace: Duration,
) {
    tokio::select! {
        result = child.wait() => {
            match result {
                Ok(status) if status.success() => {
                    info!(server_name = %label, "agent process exited");
                }
                Ok(status) => {
                    let reason = status.code().map_or_else(
                        || "terminated by signal".to_owned(),
                        |code| format!("exited with code {code}"),
                    );
                    warn!(server_name = %label, %reason, "agent process exited abnormally");
                }
                Err(err) => warn!(server_name = %label, %err, "error waiting for agent process"),
            }
            // Output written just before exit still reaches the client.
            let [stdout, stderr] = readers;
            let drained = async {
                let _ = tokio::join!(stdout, stderr);
            };
            if tokio::time::timeout(READER_DRAIN, drained).await.is_err() {
                debug!(server_name = %label, "output still open after exit, not waiting further");
            }
        }
        () = cancel.cancelled() => {
            terminate(&label, &mut child, grace).await;
            for reader in &readers {
                reader.abort();
            }
        }
    }
    events.closed();
}

/// SIGTERM, then kill once `grace` has elapsed.
async fn terminate(label: &str, child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            match kill(Pid::from_raw(pid), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(result) = tokio::time::timeout(grace, child.wait()).await {
                        debug!(server_name = label, status = ?result.ok(), "agent process terminated");
                        return;
                    }
                    debug!(server_name = label, "agent ignored SIGTERM, killing");
                }
                Err(err) => debug!(server_name = label, %err, "SIGTERM failed, killing"),
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    if let Err(err) = child.kill().await {
        debug!(server_name = label, %err, "kill failed; process may already have exited");
    }
}
