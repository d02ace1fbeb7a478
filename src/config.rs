//! Global configuration parsing, environment overlay, and validation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::warn;

use crate::transport::process::inherited_environment;
use crate::{AppError, Result};

/// Environment variable holding the preferred listen port.
pub const PORT_ENV: &str = "PORT";

/// Environment variable holding a JSON object of extra default agent env vars.
pub const MCP_ENV_VARS_ENV: &str = "MCP_ENV_VARS";

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    6277
}

fn default_max_port_probes() -> u16 {
    100
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".mcp-bridge").join("logs")
}

fn default_kill_grace_ms() -> u64 {
    2000
}

/// Settings for spawned agent processes.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessConfig {
    /// Pipe client messages into the child's stdin instead of discarding them.
    #[serde(default)]
    pub duplex: bool,
    /// Time between SIGTERM and a forced kill when closing a process.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            duplex: false,
            kill_grace_ms: default_kill_grace_ms(),
        }
    }
}

/// Global configuration parsed from an optional `config.toml`, then overlaid
/// with environment variables and command-line arguments.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Interface the HTTP surface binds to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Preferred listen port; the allocator probes upward from here.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound on ports probed before startup fails.
    #[serde(default = "default_max_port_probes")]
    pub max_port_probes: u16,
    /// Extra environment variables handed to every spawned agent.
    #[serde(default)]
    pub default_environment: BTreeMap<String, String>,
    /// Command suggested to the browser client for stdio sessions.
    #[serde(default)]
    pub default_command: String,
    /// Arguments suggested alongside `default_command`.
    #[serde(default)]
    pub default_args: Vec<String>,
    /// Directory for the per-server append-only log files.
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// Spawned process behaviour.
    #[serde(default)]
    pub process: ProcessConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_port_probes: default_max_port_probes(),
            default_environment: BTreeMap::new(),
            default_command: String::new(),
            default_args: Vec::new(),
            log_dir: default_log_dir(),
            process: ProcessConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `PORT` and `MCP_ENV_VARS` from the process environment.
    ///
    /// # Errors
    ///
    /// See [`GlobalConfig::apply_env_from`].
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay environment-derived settings using `lookup` as the source.
    ///
    /// `MCP_ENV_VARS` entries override same-named keys from the TOML file.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if `PORT` is not a valid port number or
    /// `MCP_ENV_VARS` is not a JSON object of strings.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(PORT_ENV).filter(|v| !v.trim().is_empty()) {
            self.port = raw
                .trim()
                .parse()
                .map_err(|err| AppError::Config(format!("invalid {PORT_ENV} {raw:?}: {err}")))?;
        }

        if let Some(raw) = lookup(MCP_ENV_VARS_ENV).filter(|v| !v.trim().is_empty()) {
            let extra: BTreeMap<String, String> = serde_json::from_str(&raw).map_err(|err| {
                AppError::Config(format!("{MCP_ENV_VARS_ENV} must be a JSON object of strings: {err}"))
            })?;
            self.default_environment.extend(extra);
        }

        self.validate()
    }

    /// Apply `KEY=VALUE` pairs given on the command line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` for a pair without `=` or with an empty key.
    pub fn apply_env_pairs<S: AsRef<str>>(&mut self, pairs: &[S]) -> Result<()> {
        for pair in pairs {
            let pair = pair.as_ref();
            let Some((key, value)) = pair.split_once('=') else {
                return Err(AppError::Config(format!(
                    "environment override {pair:?} must be KEY=VALUE"
                )));
            };
            if key.is_empty() {
                return Err(AppError::Config(format!(
                    "environment override {pair:?} has an empty key"
                )));
            }
            self.default_environment
                .insert(key.to_owned(), value.to_owned());
        }
        Ok(())
    }

    /// Default environment echoed to clients and used as the base for
    /// spawned agents: the inherited allow-list overlaid with configured
    /// defaults.
    #[must_use]
    pub fn merged_environment(&self) -> BTreeMap<String, String> {
        let mut env = inherited_environment();
        env.extend(
            self.default_environment
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        env
    }

    fn validate(&self) -> Result<()> {
        if self.max_port_probes == 0 {
            return Err(AppError::Config(
                "max_port_probes must be greater than zero".into(),
            ));
        }

        if self.host.trim().is_empty() {
            return Err(AppError::Config("host must not be empty".into()));
        }

        if self.default_command.is_empty() && !self.default_args.is_empty() {
            warn!("default_args configured without default_command; clients may ignore them");
        }

        Ok(())
    }
}
