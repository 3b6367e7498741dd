//! Transport handshake response parsing.
//!
//! Before the WebSocket opens, the client issues one HTTP GET against the
//! Socket.IO polling endpoint. The response body carries an Engine.IO open
//! packet with the session id and heartbeat parameters:
//!
//! ```text
//! 97:0{"sid":"abc123","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000}
//! ```
//!
//! The body is accepted both length-prefixed (as above) and bare
//! (`0{...}`); some gateway layers strip the polling framing.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// Heartbeat interval used when the handshake omits `pingInterval`.
const DEFAULT_PING_INTERVAL: Duration = Duration::from_millis(25_000);

/// Heartbeat timeout used when the handshake omits `pingTimeout`.
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(20_000);

// ============================================================================
// HandshakeInfo
// ============================================================================

/// Session parameters advertised by the transport handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeInfo {
    /// Session id to carry in the WebSocket URL.
    pub sid: String,

    /// Heartbeat interval advertised by the server.
    pub ping_interval: Duration,

    /// Heartbeat timeout advertised by the server.
    pub ping_timeout: Duration,
}

/// Raw open-packet JSON shape.
#[derive(Debug, Deserialize)]
struct OpenPacket {
    sid: String,
    #[serde(rename = "pingInterval")]
    ping_interval: Option<u64>,
    #[serde(rename = "pingTimeout")]
    ping_timeout: Option<u64>,
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses the polling handshake body into [`HandshakeInfo`].
///
/// # Errors
///
/// Returns [`Error::HandshakeFailed`] when the body carries no open packet
/// or the packet lacks a session id.
pub fn parse_handshake(body: &str) -> Result<HandshakeInfo> {
    let json = extract_open_packet(body)
        .ok_or_else(|| Error::handshake_failed(format!("no open packet in: {}", preview(body))))?;

    let packet: OpenPacket = serde_json::from_str(json)
        .map_err(|e| Error::handshake_failed(format!("invalid open packet: {e}")))?;

    if packet.sid.is_empty() {
        return Err(Error::handshake_failed("empty session id"));
    }

    Ok(HandshakeInfo {
        sid: packet.sid,
        ping_interval: packet
            .ping_interval
            .map_or(DEFAULT_PING_INTERVAL, Duration::from_millis),
        ping_timeout: packet
            .ping_timeout
            .map_or(DEFAULT_PING_TIMEOUT, Duration::from_millis),
    })
}

/// Locates the `0{...}` open packet inside the (possibly length-prefixed)
/// polling body and returns the balanced JSON object.
fn extract_open_packet(body: &str) -> Option<&str> {
    let start = if body.starts_with("0{") {
        1
    } else {
        body.find(":0{")? + 2
    };

    let candidate = &body[start..];
    let mut depth = 0usize;
    for (i, c) in candidate.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(&candidate[..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Truncated body excerpt for error messages.
fn preview(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(80)
        .map_or(body.len(), |(i, _)| i);
    &body[..end]
}

// ============================================================================
// Tests
// ============================================================================
