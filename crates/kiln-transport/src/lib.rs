//! Connection multiplexing for Kiln.
//!
//! A [`Server`] owns one non-blocking listening socket and is driven by
//! repeated calls to [`Server::process`]. Protocol behaviour lives in a
//! [`Handler`]; the framed binary protocol and the WebSocket layer are
//! both handlers over the same multiplexer.
//!
//! # Feature Flags
//!
//! - `websocket` (default): HTTP upgrade handshake and RFC 6455 framing
//!   via [`WebSocketLayer`].

mod connection;
mod error;
mod server;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use connection::{Connection, MAX_OUTBOUND, SEND_TIMEOUT};
pub use error::TransportError;
pub use server::{DEFAULT_IDLE_TIMEOUT, Handler, Server, ServerHandle};
#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketHandler, WebSocketLayer};

use std::fmt;

/// Opaque identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}
