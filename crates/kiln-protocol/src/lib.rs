//! Wire formats for Kiln.
//!
//! This crate defines every byte layout the host speaks:
//!
//! - **Buffer** ([`ByteBuffer`]) — the growable, bounds-checked substrate
//!   for all binary encoding.
//! - **Frames** ([`Frame`], [`Header`], [`FrameBuilder`], [`FrameDecoder`])
//!   — the length-prefixed request/response protocol between the host
//!   service and its control panel.
//! - **WebSocket** ([`websocket`]) — RFC 6455 framing and the handshake
//!   accept key.
//! - **Line protocol** ([`line`], [`Codec`], [`JsonCodec`]) — the
//!   `"<header> <payload>|"` messages browsers exchange over WebSocket
//!   text frames.
//! - **Types** ([`InstanceStatus`], [`InstanceConfiguration`],
//!   [`InstanceSummary`]) — values that travel inside frames.
//!
//! It knows nothing about sockets or instances; it only turns values into
//! bytes and back.
//!
//! ```text
//! socket bytes → FrameDecoder / MessageDecoder → Frame / Message → dispatch
//! ```

mod buffer;
mod codec;
mod error;
mod frame;
pub mod line;
mod types;
pub mod websocket;

pub use buffer::{ByteBuffer, DEFAULT_MAX_SIZE};
pub use codec::Codec;
#[cfg(feature = "json")]
pub use codec::JsonCodec;
pub use error::{BufferError, ProtocolError};
pub use frame::{Frame, FrameBuilder, FrameDecoder, HEADER_SIZE, Header, NO_REQUEST_ID};
pub use types::{InstanceConfiguration, InstanceStatus, InstanceSummary};
