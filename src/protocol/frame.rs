//! Socket.IO-style frame codec.
//!
//! The upstream feed speaks a text protocol where each frame carries a
//! numeric type/subtype prefix before an optional JSON payload:
//!
//! | Frame | Meaning |
//! |-------|---------|
//! | `0` | Engine.IO open (control) |
//! | `2` | Ping |
//! | `3` | Pong |
//! | `2probe` / `3probe` | Upgrade probe / probe acknowledgement |
//! | `40` | Namespace connect acknowledgement |
//! | `42["event",payload]` | Data event |
//!
//! Decoding is pure (no I/O): the session loop feeds raw text frames in and
//! acts on the typed [`SocketFrame`] values that come out. A malformed frame
//! yields a [`DecodeError`] which the caller reports and drops; a single bad
//! frame never terminates the connection.
//!
//! The client never sends data events, so the outbound side is a handful of
//! fixed constants rather than a general encoder.

// ============================================================================
// Imports
// ============================================================================

use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Outbound Frames
// ============================================================================

/// Upgrade probe sent immediately after the WebSocket opens.
pub const FRAME_PROBE: &str = "2probe";

/// Upgrade-complete frame sent after the probe acknowledgement.
pub const FRAME_UPGRADE: &str = "5";

/// Namespace connect frame, completing the handshake.
pub const FRAME_CONNECT: &str = "40";

/// Heartbeat reply to a server ping.
pub const FRAME_PONG: &str = "3";

// ============================================================================
// DecodeError
// ============================================================================

/// A frame matched the digit-prefix grammar but its payload was malformed.
///
/// Reported and counted by the session loop, never raised as a fatal fault.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// The trailing content after the digit prefix failed JSON parsing.
    #[error("Invalid JSON payload in frame: {message}")]
    InvalidPayload {
        /// Parser error description.
        message: String,
    },

    /// The payload parsed but is not a `[eventName, payload]` array.
    #[error("Malformed event frame: {message}")]
    MalformedEvent {
        /// Description of the shape violation.
        message: String,
    },
}

// ============================================================================
// SocketFrame
// ============================================================================

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    /// Engine.IO open packet (`0`).
    Connect,

    /// Namespace connect acknowledgement (`40`).
    ConnectAck,

    /// Server heartbeat (`2`); must be answered with [`FRAME_PONG`].
    Ping,

    /// Heartbeat reply (`3`).
    Pong,

    /// Upgrade probe (`2probe`), normally outbound only.
    Probe,

    /// Probe acknowledgement (`3probe`); unblocks the upgrade sequence.
    ProbeAck,

    /// Data event: `4x["eventName", payload]`.
    Message {
        /// Event name (element 0 of the array).
        event: String,
        /// Opaque payload (element 1), forwarded unparsed to the scheduler.
        payload: Value,
    },
}

impl SocketFrame {
    /// Decodes a raw text frame.
    ///
    /// Returns `Ok(None)` for frames that do not match the digit-prefix
    /// grammar at all (per-protocol framing noise) and for control frames
    /// this client does not act on. Returns a [`DecodeError`] when a frame
    /// matches the grammar but carries a malformed payload.
    pub fn decode(raw: &str) -> Result<Option<Self>, DecodeError> {
        match raw {
            "" => return Ok(None),
            "2probe" => return Ok(Some(Self::Probe)),
            "3probe" => return Ok(Some(Self::ProbeAck)),
            _ => {}
        }

        let digits = raw.len() - raw.trim_start_matches(|c: char| c.is_ascii_digit()).len();
        if digits == 0 {
            // Not digit-prefixed: framing noise, ignored silently.
            return Ok(None);
        }

        let (prefix, rest) = raw.split_at(digits);

        if rest.is_empty() {
            return Ok(match prefix {
                "0" => Some(Self::Connect),
                "2" => Some(Self::Ping),
                "3" => Some(Self::Pong),
                "40" => Some(Self::ConnectAck),
                // Other control prefixes (e.g. "41" disconnect, "6" noop)
                // carry nothing this client acts on.
                _ => None,
            });
        }

        if !rest.starts_with('[') {
            // Digit prefix with a non-array body, e.g. the open packet
            // "0{...}" arriving over the socket. Nothing to dispatch.
            return Ok(None);
        }

        let parsed: Value = serde_json::from_str(rest).map_err(|e| DecodeError::InvalidPayload {
            message: e.to_string(),
        })?;

        let Some(items) = parsed.as_array() else {
            return Err(DecodeError::MalformedEvent {
                message: "payload is not an array".to_string(),
            });
        };

        if items.len() < 2 {
            return Err(DecodeError::MalformedEvent {
                message: format!("event array has {} element(s), expected 2", items.len()),
            });
        }

        let Some(event) = items[0].as_str() else {
            return Err(DecodeError::MalformedEvent {
                message: "event name is not a string".to_string(),
            });
        };

        Ok(Some(Self::Message {
            event: event.to_string(),
            payload: items[1].clone(),
        }))
    }

    /// Returns `true` for the data-event variant.
    #[inline]
    #[must_use]
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(SocketFrame::decode("0").unwrap(), Some(SocketFrame::Connect));
        assert_eq!(SocketFrame::decode("2").unwrap(), Some(SocketFrame::Ping));
        assert_eq!(SocketFrame::decode("3").unwrap(), Some(SocketFrame::Pong));
        assert_eq!(
            SocketFrame::decode("40").unwrap(),
            Some(SocketFrame::ConnectAck)
        );
    }

    #[test]
    fn test_decode_probe_frames() {
        assert_eq!(
            SocketFrame::decode("2probe").unwrap(),
            Some(SocketFrame::Probe)
        );
        assert_eq!(
            SocketFrame::decode("3probe").unwrap(),
            Some(SocketFrame::ProbeAck)
        );
    }

    #[test]
    fn test_outbound_constants_round_trip() {
        // Control constants decode back to their semantic kinds.
        assert_eq!(
            SocketFrame::decode(FRAME_PONG).unwrap(),
            Some(SocketFrame::Pong)
        );
        assert_eq!(
            SocketFrame::decode(FRAME_CONNECT).unwrap(),
            Some(SocketFrame::ConnectAck)
        );
        assert_eq!(
            SocketFrame::decode(FRAME_PROBE).unwrap(),
            Some(SocketFrame::Probe)
        );
    }

    #[test]
    fn test_decode_vehicles_event() {
        // Captured frame shape from the live feed.
        let raw = r#"42["vehicles",[{"vehicle_id":12585093,"route_id":12583358,"lat":50.50963,"lon":30.64338}]]"#;

        let frame = SocketFrame::decode(raw).unwrap().unwrap();
        let SocketFrame::Message { event, payload } = frame else {
            panic!("expected message frame");
        };

        assert_eq!(event, "vehicles");
        let items = payload.as_array().expect("payload array");
        assert_eq!(items.len(), 1);
        assert_eq!(items[0]["vehicle_id"], json!(12_585_093));
    }

    #[test]
    fn test_decode_event_with_string_payload() {
        let raw = r#"42["positions","12585093,12583358,50.50963,30.64338,0,0,1769342268"]"#;

        let frame = SocketFrame::decode(raw).unwrap().unwrap();
        assert!(frame.is_message());
    }

    #[test]
    fn test_decode_invalid_json_is_error_not_panic() {
        let err = SocketFrame::decode(r#"42["vehicles",{"#).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidPayload { .. }));
    }

    #[test]
    fn test_decode_short_array_is_error() {
        let err = SocketFrame::decode(r#"42["vehicles"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedEvent { .. }));
    }

    #[test]
    fn test_decode_non_string_event_name_is_error() {
        let err = SocketFrame::decode(r#"42[17,"payload"]"#).unwrap_err();
        assert!(matches!(err, DecodeError::MalformedEvent { .. }));
    }

    #[test]
    fn test_decode_non_digit_prefix_ignored() {
        assert_eq!(SocketFrame::decode("probe").unwrap(), None);
        assert_eq!(SocketFrame::decode(r#"{"sid":"abc"}"#).unwrap(), None);
        assert_eq!(SocketFrame::decode("").unwrap(), None);
    }

    #[test]
    fn test_decode_unknown_control_ignored() {
        assert_eq!(SocketFrame::decode("41").unwrap(), None);
        assert_eq!(SocketFrame::decode("6").unwrap(), None);
    }

    #[test]
    fn test_decode_open_packet_with_body_ignored() {
        let raw = r#"0{"sid":"abc123","pingInterval":25000}"#;
        assert_eq!(SocketFrame::decode(raw).unwrap(), None);
    }

    proptest! {
        #[test]
        fn test_decode_never_panics(raw in ".*") {
            // Grammar violations must yield None or a typed error, never a
            // panic.
            let _ = SocketFrame::decode(&raw);
        }

        #[test]
        fn test_decode_valid_events(event in "[a-z]{1,12}", n in 0u64..1_000_000) {
            let raw = format!(r#"42["{event}",{n}]"#);
            let frame = SocketFrame::decode(&raw).unwrap().unwrap();
            let SocketFrame::Message { event: got, payload } = frame else {
                panic!("expected message frame");
            };
            prop_assert_eq!(got, event);
            prop_assert_eq!(payload.as_u64(), Some(n));
        }
    }
}
