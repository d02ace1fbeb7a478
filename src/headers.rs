//! Header allow-lists for the boundary between browser and backing agent.
//!
//! Only headers named in an allow-list are copied from the inbound browser
//! request to outbound agent requests.  Cookies, origin headers and anything
//! else the browser attaches stay on the proxy.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

/// Session continuation header used by the streaming-HTTP protocol.
pub const MCP_SESSION_ID: HeaderName = HeaderName::from_static("mcp-session-id");

/// Resumption marker for event streams.
pub const LAST_EVENT_ID: HeaderName = HeaderName::from_static("last-event-id");

static SSE_ALLOWED: [HeaderName; 1] = [axum::http::header::AUTHORIZATION];

static STREAMABLE_ALLOWED: [HeaderName; 3] = [
    axum::http::header::AUTHORIZATION,
    MCP_SESSION_ID,
    LAST_EVENT_ID,
];

/// Headers forwarded to push-stream agents.
pub static SSE_PASSTHROUGH: &[HeaderName] = &SSE_ALLOWED;

/// Headers forwarded to streaming-HTTP agents.
pub static STREAMABLE_PASSTHROUGH: &[HeaderName] = &STREAMABLE_ALLOWED;

/// Copy allow-listed headers from `inbound`.
///
/// When a header appears more than once the last occurrence wins.
#[must_use]
pub fn forward_headers(inbound: &HeaderMap, allow: &[HeaderName]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for name in allow {
        if let Some(value) = inbound.get_all(name).iter().last() {
            out.insert(name.clone(), value.clone());
        }
    }
    out
}

/// Read a header as trimmed UTF-8, ignoring empty values.
#[must_use]
pub fn header_str<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Whether the request carries credentials the agent will see.
#[must_use]
pub fn carries_credentials(forwarded: &HeaderMap) -> bool {
    forwarded.contains_key(axum::http::header::AUTHORIZATION)
}

/// Build a header value, dropping values that are not valid header text.
#[must_use]
pub fn value(raw: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(raw).ok()
}
