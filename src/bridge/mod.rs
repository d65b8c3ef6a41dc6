//! Browser-facing half of the relay
//!
//! - `protocol`: JSON envelope format and UTF-8 safe output framing
//! - `socket`: transport abstraction over warp WebSockets

pub mod protocol;
pub mod socket;

pub use protocol::{ClientMessage, ServerMessage, Utf8Chunker};
pub use socket::{ClientSocket, Inbound, SocketError, SocketPeer, SocketSink, SocketStream};
