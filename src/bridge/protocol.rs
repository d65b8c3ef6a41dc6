//! WebSocket envelope format
//!
//! Both directions use JSON text frames shaped `{"type": ..., "data": ...}`.
//!
//! Client -> relay:
//! - `input`: `data` is a string written verbatim to the remote stdin
//! - `resize`: `data` is `{cols, rows}` and becomes a PTY window-change
//!
//! Relay -> client:
//! - `data`: remote stdout
//! - `error`: remote stderr
//!
//! Unknown types and malformed frames are ignored, never fatal.

use serde::{Deserialize, Serialize};

use crate::session::types::TerminalSize;

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// Decoded client frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Input(Vec<u8>),
    Resize(TerminalSize),
    /// Dropped frame, with the reason for logging
    Ignored(String),
}

impl ClientMessage {
    pub fn parse(text: &str) -> Self {
        let envelope: RawEnvelope = match serde_json::from_str(text) {
            Ok(e) => e,
            Err(e) => return ClientMessage::Ignored(format!("malformed envelope: {}", e)),
        };

        match envelope.kind.as_str() {
            "input" => match envelope.data {
                serde_json::Value::String(s) => ClientMessage::Input(s.into_bytes()),
                other => ClientMessage::Ignored(format!("input data is not a string: {}", other)),
            },
            "resize" => match serde_json::from_value::<TerminalSize>(envelope.data) {
                Ok(size) if size.is_valid() => ClientMessage::Resize(size),
                Ok(size) => ClientMessage::Ignored(format!(
                    "invalid geometry {}x{}",
                    size.cols, size.rows
                )),
                Err(e) => ClientMessage::Ignored(format!("bad resize payload: {}", e)),
            },
            other => ClientMessage::Ignored(format!("unknown message type {:?}", other)),
        }
    }
}

/// Relay frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
pub enum ServerMessage {
    Data(String),
    Error(String),
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Re-frames a byte stream into valid UTF-8 strings.
///
/// A multi-byte sequence split across two reads is held back until the
/// rest arrives; bytes that can never be valid become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> String {
        let mut buf = std::mem::take(&mut self.pending);
        buf.extend_from_slice(chunk);

        let mut out = String::with_capacity(buf.len());
        let mut rest = &buf[..];
        loop {
            match std::str::from_utf8(rest) {
                Ok(s) => {
                    out.push_str(s);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end
                            self.pending = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Emit whatever is still held back.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let pending = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&pending).into_owned())
    }
}
