//! Agent transport selection and construction.
//!
//! Connection requests name their backing agent through query parameters:
//!
//! | Parameter       | Meaning                                              |
//! |-----------------|------------------------------------------------------|
//! | `transportType` | `sse` (default), `streamable-http`, or `stdio`       |
//! | `url`           | Remote agent URL for `sse` / `streamable-http`       |
//! | `command`       | Executable for `stdio`; falls back to the configured default |
//! | `args`          | Shell-quoted argument string for `stdio`             |
//! | `env`           | JSON object of environment overrides for `stdio`     |
//! | `serverName`    | Logical server name used in logs                     |

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{HeaderMap, HeaderName};
use reqwest::Url;
use tracing::{debug, info, info_span, Instrument};

use super::process::{ProcessSpec, ProcessTransport, StdinMode};
use super::sse_client::SseClientTransport;
use super::streamable_client::StreamableHttpClientTransport;
use super::{Transport, TransportEvents};
use crate::config::{GlobalConfig, ProcessConfig};
use crate::headers::{forward_headers, SSE_PASSTHROUGH, STREAMABLE_PASSTHROUGH};
use crate::{AppError, Result};

/// Where a session's agent lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackingTarget {
    /// Remote agent speaking the push-stream protocol.
    Sse {
        /// Event stream URL.
        url: Url,
    },
    /// Remote agent speaking streaming HTTP.
    StreamableHttp {
        /// Endpoint URL.
        url: Url,
    },
    /// Local process.
    Process(ProcessSpec),
}

impl BackingTarget {
    /// Interpret connection query parameters.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` for an unknown `transportType`, a
    /// missing or invalid `url`, or invalid process parameters.
    pub fn from_query(query: &HashMap<String, String>, config: &GlobalConfig) -> Result<Self> {
        let kind = query
            .get("transportType")
            .map_or("sse", |v| v.trim());
        match kind {
            "sse" => Ok(Self::Sse {
                url: parse_url(query)?,
            }),
            "streamable-http" | "streamable_http" | "streamableHttp" => Ok(Self::StreamableHttp {
                url: parse_url(query)?,
            }),
            "stdio" => Self::process_from_query(query, config),
            other => Err(AppError::BadRequest(format!(
                "unsupported transportType {other:?}"
            ))),
        }
    }

    /// Interpret process parameters regardless of `transportType`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::BadRequest` if no command is given or configured,
    /// `args` has unbalanced quotes, or `env` is not a JSON object of strings.
    pub fn process_from_query(query: &HashMap<String, String>, config: &GlobalConfig) -> Result<Self> {
        let explicit = query
            .get("command")
            .map(|c| c.trim())
            .filter(|c| !c.is_empty());

        let (command, args) = match explicit {
            Some(command) => {
                let args = match query.get("args").map(|a| a.trim()).filter(|a| !a.is_empty()) {
                    Some(raw) => shlex::split(raw).ok_or_else(|| {
                        AppError::BadRequest(format!("args has unbalanced quoting: {raw}"))
                    })?,
                    None => Vec::new(),
                };
                (command.to_owned(), args)
            }
            None if !config.default_command.is_empty() => {
                (config.default_command.clone(), config.default_args.clone())
            }
            None => return Err(AppError::BadRequest("command is required".into())),
        };

        let env = match query.get("env").map(|e| e.trim()).filter(|e| !e.is_empty()) {
            Some(raw) => serde_json::from_str::<BTreeMap<String, String>>(raw).map_err(|err| {
                AppError::BadRequest(format!("env must be a JSON object of strings: {err}"))
            })?,
            None => BTreeMap::new(),
        };

        let server_name = query
            .get("serverName")
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty());

        Ok(Self::Process(ProcessSpec {
            command,
            args,
            env,
            server_name,
            stdin: if config.process.duplex {
                StdinMode::Piped
            } else {
                StdinMode::Null
            },
        }))
    }

    /// Headers this target may receive from the browser.
    #[must_use]
    pub fn passthrough(&self) -> &'static [HeaderName] {
        match self {
            Self::Sse { .. } => SSE_PASSTHROUGH,
            Self::StreamableHttp { .. } => STREAMABLE_PASSTHROUGH,
            Self::Process(_) => &[],
        }
    }

    /// Short label for log fields.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Sse { url } => format!("sse {url}"),
            Self::StreamableHttp { url } => format!("streamable-http {url}"),
            Self::Process(spec) => format!("stdio {}", spec.label()),
        }
    }
}

fn parse_url(query: &HashMap<String, String>) -> Result<Url> {
    let raw = query
        .get("url")
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .ok_or_else(|| AppError::BadRequest("url is required".into()))?;
    let url = Url::parse(raw).map_err(|err| AppError::BadRequest(format!("invalid url {raw:?}: {err}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(AppError::BadRequest(format!(
            "url scheme must be http or https, got {other:?}"
        ))),
    }
}

/// Builds agent transports; shared by every session.
#[derive(Clone)]
pub struct Connector {
    http: reqwest::Client,
    base_env: BTreeMap<String, String>,
    process: ProcessConfig,
}

impl Connector {
    /// Create a connector from the global configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the HTTP client cannot be built.
    pub fn new(config: &GlobalConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            base_env: config.merged_environment(),
            process: config.process.clone(),
        })
    }

    /// Build the agent transport for `target` without starting it.
    ///
    /// `inbound` is filtered through the target's allow-list.
    #[must_use]
    pub fn build(&self, target: &BackingTarget, inbound: &HeaderMap) -> (Arc<dyn Transport>, TransportEvents) {
        let forwarded = forward_headers(inbound, target.passthrough());
        match target {
            BackingTarget::Sse { url } => {
                let (transport, events) = SseClientTransport::new(self.http.clone(), url.clone(), forwarded);
                (transport as Arc<dyn Transport>, events)
            }
            BackingTarget::StreamableHttp { url } => {
                let (transport, events) =
                    StreamableHttpClientTransport::new(self.http.clone(), url.clone(), forwarded);
                (transport as Arc<dyn Transport>, events)
            }
            BackingTarget::Process(spec) => {
                let (transport, events) = ProcessTransport::new(
                    spec.clone(),
                    &self.base_env,
                    Duration::from_millis(self.process.kill_grace_ms),
                );
                (transport as Arc<dyn Transport>, events)
            }
        }
    }

    /// Build and start the agent transport for `target`.
    ///
    /// # Errors
    ///
    /// Whatever the transport's `start` reports; `AppError::Unauthorized`
    /// when a remote agent answers 401.
    pub async fn connect(
        &self,
        target: &BackingTarget,
        inbound: &HeaderMap,
    ) -> Result<(Arc<dyn Transport>, TransportEvents)> {
        let span = info_span!("agent_connect", target = %target.describe());
        async {
            let (transport, events) = self.build(target, inbound);
            if let Err(err) = transport.start().await {
                if let Err(close_err) = transport.close().await {
                    debug!(%close_err, "closing unstarted agent transport failed");
                }
                return Err(err);
            }
            info!(transport = %transport.kind(), "agent connected");
            Ok((transport, events))
        }
        .instrument(span)
        .await
    }
}
