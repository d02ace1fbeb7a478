//! Listening port allocation.
//!
//! Probes upward from a preferred port by binding and immediately releasing
//! a listener.  Another process can still take the port between the probe
//! and the real bind; callers treat a later bind failure as fatal.

use std::io::ErrorKind;

use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::{AppError, Result};

/// Default number of ports probed before giving up.
pub const DEFAULT_MAX_PROBES: u16 = 100;

/// First free port at or above `preferred` on `host`.
///
/// Only `AddrInUse` moves the probe to the next port.
///
/// # Errors
///
/// Returns `AppError::Config` if any other bind error occurs, if
/// `max_probes` ports were all occupied, or if the search would pass
/// port 65535.
pub async fn find_available_port(host: &str, preferred: u16, max_probes: u16) -> Result<u16> {
    let mut port = preferred;
    for probe in 0..max_probes {
        match TcpListener::bind((host, port)).await {
            Ok(listener) => {
                let bound = listener
                    .local_addr()
                    .map_err(|err| AppError::Config(format!("failed to read bound address: {err}")))?
                    .port();
                drop(listener);
                if probe > 0 {
                    info!(preferred, port = bound, "preferred port busy, using next free port");
                }
                return Ok(bound);
            }
            Err(err) if err.kind() == ErrorKind::AddrInUse => {
                debug!(port, "port in use, probing next");
                port = port.checked_add(1).ok_or_else(|| {
                    AppError::Config(format!("no free port between {preferred} and 65535"))
                })?;
            }
            Err(err) => {
                return Err(AppError::Config(format!(
                    "failed to bind {host}:{port}: {err}"
                )));
            }
        }
    }
    Err(AppError::Config(format!(
        "no free port in {max_probes} probes starting at {preferred}"
    )))
}
