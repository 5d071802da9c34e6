//! Binary protocol dispatcher.
//!
//! Handlers are bound to headers once, at startup, in an explicit table.
//! The dispatcher plugs into the multiplexer as a [`Handler`] whose
//! per-connection state is a [`FrameDecoder`].
//!
//! ```text
//! bytes → FrameDecoder → Frame → Ping?        → swallowed
//!                              → registered?  → handler(context, conn, frame)
//!                              → otherwise    → disconnect
//! ```

use std::collections::HashMap;

use kiln_protocol::{DEFAULT_MAX_SIZE, Frame, FrameDecoder, Header};
use kiln_transport::{Connection, Handler};

use crate::KilnError;

/// A frame handler. Returning an error disconnects the peer that sent the
/// frame; expected failures are answered with an `Error` frame instead.
pub type FrameHandler<C> = fn(&C, &Connection, Frame) -> Result<(), KilnError>;

/// Routes decoded frames to registered handlers.
pub struct Dispatcher<C> {
    context: C,
    handlers: HashMap<Header, FrameHandler<C>>,
    max_buffer: usize,
}

impl<C: Send + 'static> Dispatcher<C> {
    pub fn new(context: C) -> Self {
        Self {
            context,
            handlers: HashMap::new(),
            max_buffer: DEFAULT_MAX_SIZE,
        }
    }

    /// Caps the per-connection inbound buffer.
    pub fn with_max_buffer(mut self, max_buffer: usize) -> Self {
        self.max_buffer = max_buffer;
        self
    }

    /// Binds `handler` to `header`, replacing any earlier binding.
    pub fn register(&mut self, header: Header, handler: FrameHandler<C>) -> &mut Self {
        if self.handlers.insert(header, handler).is_some() {
            tracing::warn!(%header, "frame handler replaced");
        }
        self
    }

    pub fn is_registered(&self, header: Header) -> bool {
        self.handlers.contains_key(&header)
    }

    pub fn context(&self) -> &C {
        &self.context
    }

    /// Runs one frame through the table.
    pub fn dispatch(&self, conn: &Connection, frame: Frame) {
        if frame.header == Header::Ping {
            return;
        }
        let Some(handler) = self.handlers.get(&frame.header) else {
            tracing::warn!(conn_id = %conn.id(), header = %frame.header, "unregistered header");
            conn.disconnect(format!("unregistered header {}", frame.header));
            return;
        };
        let header = frame.header;
        if let Err(e) = handler(&self.context, conn, frame) {
            tracing::warn!(conn_id = %conn.id(), %header, error = %e, "frame handler failed");
            conn.disconnect(e.to_string());
        }
    }
}

impl<C: Send + 'static> Handler for Dispatcher<C> {
    type State = FrameDecoder;

    fn on_connected(&mut self, conn: &Connection) -> FrameDecoder {
        tracing::info!(conn_id = %conn.id(), peer = %conn.peer_addr(), "control client connected");
        FrameDecoder::with_max_size(self.max_buffer)
    }

    fn on_data(&mut self, conn: &Connection, decoder: &mut FrameDecoder, data: &[u8]) {
        if let Err(e) = decoder.feed(data) {
            tracing::warn!(conn_id = %conn.id(), error = %e, "inbound buffer overflow");
            conn.disconnect(e.to_string());
            return;
        }
        while !conn.is_disconnected() {
            match decoder.next_frame() {
                Ok(Some(frame)) => self.dispatch(conn, frame),
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(conn_id = %conn.id(), error = %e, "protocol violation");
                    conn.disconnect(e.to_string());
                }
            }
        }
    }

    fn on_disconnected(&mut self, conn: &Connection, decoder: FrameDecoder) {
        tracing::info!(
            conn_id = %conn.id(),
            reason = conn.disconnect_reason().as_deref().unwrap_or("closed"),
            unconsumed = decoder.buffered(),
            "control client disconnected"
        );
    }
}
