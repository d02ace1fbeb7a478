//! Error types shared across the proxy.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all proxy failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing, validation, or startup failure.
    Config(String),
    /// Outbound connection failure: connect, negotiation, or unexpected status.
    Transport(String),
    /// Backing agent rejected the forwarded credentials (HTTP 401).
    Unauthorized(String),
    /// Requested session or resource does not exist.
    NotFound(String),
    /// Transport used before `start()` completed.
    NotConnected(String),
    /// Transport used after it closed or its peer went away.
    Disconnected(String),
    /// A line or body could not be decoded as JSON.
    Decode(String),
    /// Agent process spawn or supervision failure.
    Process(String),
    /// Conflicting state, e.g. a duplicate session registration.
    Conflict(String),
    /// Client request is missing or carries invalid parameters.
    BadRequest(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Whether the error means the backing agent refused the credentials.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::Unauthorized(msg) => write!(f, "unauthorized: {msg}"),
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::NotConnected(msg) => write!(f, "not connected: {msg}"),
            Self::Disconnected(msg) => write!(f, "disconnected: {msg}"),
            Self::Decode(msg) => write!(f, "decode: {msg}"),
            Self::Process(msg) => write!(f, "process: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::UNAUTHORIZED) {
            Self::Unauthorized(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}
