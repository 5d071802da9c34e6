//! Binary request/response frames.
//!
//! Wire form, all little-endian:
//!
//! ```text
//! headerType: i32 | requestId: i32 | payloadLength: i32 | payload
//! ```
//!
//! A `requestId` of [`NO_REQUEST_ID`] means the sender does not expect a
//! correlated reply.

use std::fmt;

use crate::{BufferError, ByteBuffer, ProtocolError};

/// Size of the fixed frame header in bytes.
pub const HEADER_SIZE: usize = 12;

/// Request id carried by frames that expect no reply.
pub const NO_REQUEST_ID: i32 = 0;

const LENGTH_OFFSET: usize = 8;

/// The closed set of binary frame types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Header {
    Ping = 1,
    New = 2,
    InstanceStatus = 3,
    InstanceLog = 4,
    InstanceConfiguration = 5,
    List = 6,
    Error = 7,
    Command = 8,
    Terminate = 9,
}

impl Header {
    /// First value past the valid range. Valid headers satisfy
    /// `0 < header < MAX_HEADER`.
    pub const MAX_HEADER: i32 = 10;

    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for Header {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => Self::Ping,
            2 => Self::New,
            3 => Self::InstanceStatus,
            4 => Self::InstanceLog,
            5 => Self::InstanceConfiguration,
            6 => Self::List,
            7 => Self::Error,
            8 => Self::Command,
            9 => Self::Terminate,
            other => return Err(ProtocolError::InvalidHeader(other)),
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One complete unit of the binary protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub request_id: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(header: Header, request_id: i32, payload: Vec<u8>) -> Self {
        Self {
            header,
            request_id,
            payload,
        }
    }

    /// A frame with no payload.
    pub fn empty(header: Header, request_id: i32) -> Self {
        Self::new(header, request_id, Vec::new())
    }

    /// A read-only buffer over the payload, for field-by-field decoding.
    pub fn reader(&self) -> ByteBuffer {
        ByteBuffer::read_only(self.payload.clone())
    }

    /// Encodes header, request id, length and payload.
    pub fn encode(&self) -> Result<Vec<u8>, BufferError> {
        let mut builder = FrameBuilder::new(self.header, self.request_id)?;
        builder.write_bytes(&self.payload)?;
        builder.finish()
    }
}

// ---------------------------------------------------------------------------
// FrameBuilder
// ---------------------------------------------------------------------------

/// Builds an encoded frame incrementally.
///
/// The length field starts as a zero placeholder and is backpatched by
/// [`finish`](Self::finish), so callers never need the payload size up
/// front.
#[derive(Debug)]
pub struct FrameBuilder {
    buffer: ByteBuffer,
}

impl FrameBuilder {
    pub fn new(header: Header, request_id: i32) -> Result<Self, BufferError> {
        let mut buffer = ByteBuffer::new();
        buffer.write_i32(header.as_i32())?;
        buffer.write_i32(request_id)?;
        buffer.write_i32(0)?;
        Ok(Self { buffer })
    }

    pub fn write_bool(&mut self, value: bool) -> Result<&mut Self, BufferError> {
        self.buffer.write_bool(value)?;
        Ok(self)
    }

    pub fn write_i32(&mut self, value: i32) -> Result<&mut Self, BufferError> {
        self.buffer.write_i32(value)?;
        Ok(self)
    }

    pub fn write_str(&mut self, value: &str) -> Result<&mut Self, BufferError> {
        self.buffer.write_str(value)?;
        Ok(self)
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> Result<&mut Self, BufferError> {
        self.buffer.write_bytes(value)?;
        Ok(self)
    }

    /// Direct access for types that serialize themselves into a buffer.
    pub fn buffer_mut(&mut self) -> &mut ByteBuffer {
        &mut self.buffer
    }

    /// Patches the payload length and returns the encoded frame.
    pub fn finish(mut self) -> Result<Vec<u8>, BufferError> {
        let payload_len = self.buffer.len() - HEADER_SIZE;
        let payload_len = i32::try_from(payload_len).map_err(|_| BufferError::Overflow {
            requested: payload_len,
            max: i32::MAX as usize,
        })?;
        self.buffer.patch_i32(LENGTH_OFFSET, payload_len)?;
        Ok(self.buffer.into_vec())
    }
}

// ---------------------------------------------------------------------------
// FrameDecoder
// ---------------------------------------------------------------------------

/// Reassembles frames from arbitrarily segmented input.
///
/// ```text
/// feed(bytes) → while next_frame() yields Some(frame) → dispatch
/// ```
///
/// Partial headers and partial payloads stay buffered until the rest
/// arrives. Any error is fatal to the connection the bytes came from.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: ByteBuffer,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder whose inbound buffer is capped at `max_size` bytes.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            buffer: ByteBuffer::with_max_size(max_size),
        }
    }

    /// Appends received bytes.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        self.buffer.write_bytes(data)?;
        Ok(())
    }

    /// Bytes buffered but not yet consumed as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame, or `None` if more data is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let raw_header = self.buffer.peek_i32_at(0)?;
        let request_id = self.buffer.peek_i32_at(4)?;
        let declared = self.buffer.peek_i32_at(LENGTH_OFFSET)?;
        let payload_len =
            usize::try_from(declared).map_err(|_| ProtocolError::InvalidLength(declared))?;

        if self.buffer.len() - HEADER_SIZE < payload_len {
            return Ok(None);
        }

        let header = Header::try_from(raw_header)?;
        let end = HEADER_SIZE + payload_len;
        let payload = self.buffer.as_slice()[HEADER_SIZE..end].to_vec();
        self.buffer.remove(end)?;

        Ok(Some(Frame {
            header,
            request_id,
            payload,
        }))
    }
}
