#![forbid(unsafe_code)]

//! Transport-bridging proxy for MCP sessions.
//!
//! A browser client connects over streaming HTTP (`/mcp`) or a push stream
//! (`/sse`, `/stdio`); the proxy opens the real agent connection over a push
//! stream, streaming HTTP, or a spawned process, and pumps JSON-RPC messages
//! between the two for the life of the session.

pub mod codec;
pub mod config;
pub mod errors;
pub mod headers;
pub mod logs;
pub mod port;
pub mod pump;
pub mod server;
pub mod session;
pub mod transport;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
