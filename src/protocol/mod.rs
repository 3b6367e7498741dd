//! Wire protocol parsing for the upstream feed.
//!
//! Everything in this module is pure (no I/O): the session layer feeds raw
//! text in, typed values come out.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `frame` | Socket.IO-style frame decode and outbound frame constants |
//! | `handshake` | Engine.IO polling handshake response parsing |
//! | `position` | Vehicle position records and payload extraction |

// ============================================================================
// Submodules
// ============================================================================

/// Socket.IO-style frame codec.
pub mod frame;

/// Transport handshake response parsing.
pub mod handshake;

/// Vehicle position records.
pub mod position;

// ============================================================================
// Re-exports
// ============================================================================

pub use frame::{DecodeError, FRAME_CONNECT, FRAME_PONG, FRAME_PROBE, FRAME_UPGRADE, SocketFrame};
pub use handshake::{HandshakeInfo, parse_handshake};
pub use position::{
    CoordinateBounds, ExtractedPositions, VehiclePosition, extract_positions, is_position_event,
};
