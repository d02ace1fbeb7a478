//! Newline-delimited JSON decoding for agent process output.
//!
//! [`LineDecoder`] accepts arbitrary output chunks and yields one
//! [`serde_json::Value`] per complete line.  Line framing is delegated to
//! [`tokio_util::codec::LinesCodec`] with a [`MAX_LINE_BYTES`] ceiling so a
//! misbehaving process cannot grow the buffer without bound.
//!
//! Malformed lines are logged and dropped; they never end the stream and are
//! never forwarded.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};
use tracing::warn;

use crate::{AppError, Result};

/// Maximum line length accepted from an agent process: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// Stateful chunk-to-message decoder.
///
/// Content after the last `\n` is retained for the next [`push`](Self::push).
/// Each line is parsed on its own, so one bad line does not affect its
/// neighbours.
///
/// ```rust
/// use mcp_bridge::codec::LineDecoder;
///
/// let mut decoder = LineDecoder::new("everything");
/// assert_eq!(decoder.push(b"{\"a\":1}\n{\"a\":").len(), 1);
/// assert_eq!(decoder.push(b"2}\n").len(), 1);
/// ```
#[derive(Debug)]
pub struct LineDecoder {
    label: String,
    codec: LinesCodec,
    buffer: BytesMut,
}

impl LineDecoder {
    /// Create a decoder; `label` names the source in log output.
    #[must_use]
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            codec: LinesCodec::new_with_max_length(MAX_LINE_BYTES),
            buffer: BytesMut::new(),
        }
    }

    /// Append `chunk` and return every message completed by it, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Value> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        loop {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(line)) => self.accept_line(&line, &mut messages),
                Ok(None) => break,
                Err(err) => {
                    // Oversized line: the codec discards up to the next newline.
                    warn!(source = %self.label, error = %map_codec_error(err), "skipping undecodable line");
                }
            }
        }
        messages
    }

    /// Flush a trailing line that was never newline-terminated.
    ///
    /// Call once the underlying stream reached EOF.
    pub fn finish(&mut self) -> Option<Value> {
        let mut messages = Vec::new();
        loop {
            match self.codec.decode_eof(&mut self.buffer) {
                Ok(Some(line)) => self.accept_line(&line, &mut messages),
                Ok(None) => break,
                Err(err) => {
                    warn!(source = %self.label, error = %map_codec_error(err), "skipping undecodable line");
                }
            }
        }
        messages.pop()
    }

    /// Bytes currently held waiting for a line terminator.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn accept_line(&self, line: &str, out: &mut Vec<Value>) {
        match parse_line(line) {
            Ok(Some(value)) => out.push(value),
            Ok(None) => {}
            Err(err) => {
                warn!(
                    source = %self.label,
                    error = %err,
                    raw_line = %line,
                    "failed to parse agent output line, skipping"
                );
            }
        }
    }
}

/// Parse one line of agent output.
///
/// Returns `Ok(None)` for empty or whitespace-only lines.
///
/// # Errors
///
/// Returns [`AppError::Decode`] if the line is not valid JSON.
pub fn parse_line(line: &str) -> Result<Option<Value>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| AppError::Decode(format!("malformed json: {e}")))
}

fn map_codec_error(e: LinesCodecError) -> AppError {
    match e {
        LinesCodecError::MaxLineLengthExceeded => {
            AppError::Decode(format!("line too long: exceeded {MAX_LINE_BYTES} bytes"))
        }
        LinesCodecError::Io(io_err) => AppError::Io(io_err.to_string()),
    }
}
