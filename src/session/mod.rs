//! Stream session lifecycle.
//!
//! Split into a pure state machine ([`machine`]) that owns the upgrade and
//! heartbeat rules, and an I/O wrapper ([`stream`]) that owns the socket,
//! the reconnect policy, and credential-renewal routing. The machine is
//! testable with no transport; the wrapper applies the machine's actions.

pub mod machine;
pub mod stream;

pub use machine::{Action, DisconnectReason, SessionMachine, SessionStatus};
pub use stream::{Dispatcher, SessionEvent, SessionHandle, StreamSession};
