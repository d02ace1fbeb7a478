//! Shared helpers for HTTP-level integration tests.
//!
//! Every test runs its own proxy on an ephemeral port with a private log
//! directory, and reads push streams through `eventsource-stream`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::{Event, Eventsource};
use futures_util::stream::{BoxStream, StreamExt};
use mcp_bridge::server::{self, AppState};
use mcp_bridge::GlobalConfig;
use tokio_util::sync::CancellationToken;

/// Build a `GlobalConfig` suitable for tests, logging under `log_dir`.
pub fn test_config(log_dir: &Path) -> GlobalConfig {
    let toml = format!(
        r#"
host = "127.0.0.1"
port = 0
default_command = "echo"
default_args = ["hello"]
log_dir = '{dir}'

[default_environment]
MCP_BRIDGE_TEST = "1"

[process]
kill_grace_ms = 200
"#,
        dir = log_dir.display().to_string().replace('\\', "\\\\"),
    );
    GlobalConfig::from_toml_str(&toml).expect("valid test config")
}

/// A proxy bound to an ephemeral port.
pub struct TestProxy {
    pub base_url: String,
    pub state: Arc<AppState>,
    ct: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.ct.cancel();
    }
}

impl TestProxy {
    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

/// Start a proxy with the default test configuration.
pub async fn spawn_proxy() -> TestProxy {
    spawn_proxy_with(|_| {}).await
}

/// Start a proxy after letting the caller adjust the configuration.
pub async fn spawn_proxy_with(adjust: impl FnOnce(&mut GlobalConfig)) -> TestProxy {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(&dir.path().join("logs"));
    adjust(&mut config);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let addr = listener.local_addr().expect("local addr");

    let state = Arc::new(AppState::new(config).expect("app state"));
    let ct = CancellationToken::new();
    tokio::spawn(server::serve(Arc::clone(&state), listener, ct.clone()));

    TestProxy {
        base_url: format!("http://{addr}"),
        state,
        ct,
        _dir: dir,
    }
}

/// Client-side view of a push stream.
pub struct EventReader {
    stream: BoxStream<'static, Event>,
}

impl EventReader {
    /// Wrap a successful event-stream response.
    pub fn new(response: reqwest::Response) -> Self {
        let stream = response
            .bytes_stream()
            .eventsource()
            .filter_map(|event| async move { event.ok() })
            .boxed();
        Self { stream }
    }

    /// Next event, or `None` when the stream ends or stays quiet for 5s.
    pub async fn next(&mut self) -> Option<Event> {
        tokio::time::timeout(Duration::from_secs(5), self.stream.next())
            .await
            .ok()
            .flatten()
    }

    /// Skip events until one named `name` arrives.
    pub async fn next_named(&mut self, name: &str) -> Option<Event> {
        while let Some(event) = self.next().await {
            if event.event == name {
                return Some(event);
            }
        }
        None
    }

    /// Whether the server ended the stream within 5s.
    pub async fn ended(&mut self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(5), async {
                while self.stream.next().await.is_some() {}
            })
            .await,
            Ok(())
        )
    }
}

/// Poll `check` for up to two seconds.
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
