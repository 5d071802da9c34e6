//! Error types for the protocol layer.
//!
//! Buffer errors are kept apart from protocol errors: a [`BufferError`]
//! means a peer sent fewer (or more) bytes than a field promised, while a
//! [`ProtocolError`] means the bytes were there but made no sense. Both
//! are fatal to the connection that produced them.

/// Errors raised by [`ByteBuffer`](crate::ByteBuffer) reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// A read asked for more bytes than remain after the cursor.
    #[error("buffer underflow: needed {needed} bytes, {available} available")]
    Underflow { needed: usize, available: usize },

    /// A write would grow the buffer past its hard size cap.
    #[error("buffer overflow: {requested} bytes exceeds the {max} byte limit")]
    Overflow { requested: usize, max: usize },

    /// The buffer was created read-only.
    #[error("buffer is read-only")]
    ReadOnly,

    /// A cursor or patch position lies outside the written region.
    #[error("position {position} is outside the written length {length}")]
    OutOfBounds { position: usize, length: usize },

    /// A length prefix was negative.
    #[error("negative length prefix: {0}")]
    NegativeLength(i32),

    /// A string field did not contain valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidString,
}

/// Errors that can occur while framing or parsing protocol data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying buffer rejected a read or write.
    #[error(transparent)]
    Buffer(#[from] BufferError),

    /// A binary frame carried a header outside `0 < header < MaxHeader`.
    #[error("the header is invalid: 0x{0:08x}")]
    InvalidHeader(i32),

    /// A binary frame declared a negative payload length.
    #[error("invalid payload length: {0}")]
    InvalidLength(i32),

    /// A client WebSocket frame arrived without a mask.
    #[error("WebSocket clients must send masked data")]
    Unmasked,

    /// Fragmented messages are not supported.
    #[error("continuation frames not supported")]
    Continuation,

    /// A WebSocket frame declared a payload above the hard cap.
    #[error("WebSocket payload of {0} bytes is too large")]
    PayloadTooLarge(u64),

    /// Unconsumed WebSocket input grew above the hard cap.
    #[error("WebSocket buffer overflow: {size} bytes buffered, limit {max}")]
    Overflow { size: usize, max: usize },

    /// The opcode nibble does not name a known frame type.
    #[error("unknown WebSocket opcode: 0x{0:x}")]
    UnknownOpcode(u8),

    /// Instance configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// JSON serialization failed.
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// JSON deserialization failed (malformed input or a missing member).
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// The message is well-formed but violates a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
