//! RFC 6455 frame codec.
//!
//! Only what a server needs: decode masked client frames, encode unmasked
//! server frames, and derive the handshake accept key. Fragmented
//! messages are rejected outright.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};

use crate::ProtocolError;

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`.
pub const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Hard cap on a single frame payload and on unconsumed input: 8 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

/// A server-originated ping with an empty payload.
pub const PING_FRAME: [u8; 2] = [0x89, 0x00];

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl TryFrom<u8> for OpCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

/// Parsed fixed part of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload_len: u64,
    pub mask: [u8; 4],
    /// Bytes occupied by the header, mask included.
    pub header_len: usize,
}

/// Parses a frame header from the start of `data`.
///
/// Returns `Ok(None)` when `data` ends before the header does.
pub fn parse_header(data: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if data.len() < 2 {
        return Ok(None);
    }
    let fin = data[0] & 0x80 != 0;
    let opcode = OpCode::try_from(data[0] & 0x0F)?;
    let masked = data[1] & 0x80 != 0;

    let (payload_len, mut cursor) = match data[1] & 0x7F {
        126 => {
            if data.len() < 4 {
                return Ok(None);
            }
            (u64::from(u16::from_be_bytes([data[2], data[3]])), 4)
        }
        127 => {
            if data.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&data[2..10]);
            let len = u64::from_be_bytes(raw);
            if len > i64::MAX as u64 {
                return Err(ProtocolError::PayloadTooLarge(len));
            }
            (len, 10)
        }
        short => (u64::from(short), 2),
    };

    let mut mask = [0u8; 4];
    if masked {
        if data.len() < cursor + 4 {
            return Ok(None);
        }
        mask.copy_from_slice(&data[cursor..cursor + 4]);
        cursor += 4;
    }

    Ok(Some(FrameHeader {
        fin,
        opcode,
        masked,
        payload_len,
        mask,
        header_len: cursor,
    }))
}

/// XORs `data` in place against the mask, cycling by index modulo 4.
pub fn apply_mask(mask: [u8; 4], data: &mut [u8]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encodes a single final frame. Server frames pass `None` for the mask.
pub fn encode_frame(opcode: OpCode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | opcode as u8);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len <= 125 {
        out.push(mask_bit | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask {
        Some(mask) => {
            out.extend_from_slice(&mask);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(mask, &mut out[start..]);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// An unmasked server text frame.
pub fn encode_text(text: &str) -> Vec<u8> {
    encode_frame(OpCode::Text, text.as_bytes(), None)
}

/// Computes `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(client_key.as_bytes());
    sha.update(ACCEPT_GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

// ---------------------------------------------------------------------------
// Decoder
// ---------------------------------------------------------------------------

/// A complete message decoded from a client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Vec<u8>),
    Ping(Vec<u8>),
    Pong,
    Close,
}

/// Decodes client-to-server frames from a byte stream.
///
/// Enforces the server rules: every frame must be masked, must be final,
/// and must not be a continuation; payloads and buffered input are both
/// capped at [`MAX_PAYLOAD_SIZE`].
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buffer: Vec<u8>,
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Appends received bytes. Fails once unconsumed input passes the cap.
    pub fn feed(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let size = self.buffer.len() + data.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::Overflow {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    /// Pops the next complete message, or `None` if more data is needed.
    pub fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        let Some(header) = parse_header(&self.buffer)? else {
            return Ok(None);
        };

        if header.payload_len > MAX_PAYLOAD_SIZE as u64 {
            return Err(ProtocolError::PayloadTooLarge(header.payload_len));
        }
        if !header.masked {
            return Err(ProtocolError::Unmasked);
        }
        if !header.fin || header.opcode == OpCode::Continuation {
            return Err(ProtocolError::Continuation);
        }

        let payload_len = header.payload_len as usize;
        let end = header.header_len + payload_len;
        if self.buffer.len() < end {
            return Ok(None);
        }

        let payload = &mut self.buffer[header.header_len..end];
        apply_mask(header.mask, payload);
        let payload = payload.to_vec();
        self.buffer.drain(..end);

        let message = match header.opcode {
            OpCode::Text => Message::Text(String::from_utf8(payload).map_err(|_| {
                ProtocolError::InvalidMessage("text frame is not valid UTF-8".into())
            })?),
            OpCode::Binary => Message::Binary(payload),
            OpCode::Ping => Message::Ping(payload),
            OpCode::Pong => Message::Pong,
            OpCode::Close => Message::Close,
            OpCode::Continuation => return Err(ProtocolError::Continuation),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

    #[test]
    fn test_accept_key_rfc_example() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_masking_round_trip_at_length_boundaries() {
        let cases = [(0usize, 1usize), (1, 1), (125, 1), (126, 2), (65535, 2), (65536, 8)];
        for (len, width) in cases {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let frame = encode_frame(OpCode::Binary, &payload, Some(MASK));

            let header = parse_header(&frame).unwrap().unwrap();
            let expected_header = 2 + if width == 1 { 0 } else { width } + 4;
            assert_eq!(header.header_len, expected_header, "len {len}");
            assert_eq!(header.payload_len, len as u64);
            assert!(header.masked);

            let mut body = frame[header.header_len..].to_vec();
            assert_eq!(body.len(), len);
            if len > 0 {
                assert_ne!(body, payload, "payload should be masked on the wire");
            }
            apply_mask(header.mask, &mut body);
            assert_eq!(body, payload, "len {len}");
        }
    }

    #[test]
    fn test_server_text_is_unmasked() {
        let frame = encode_text("hi");
        assert_eq!(frame, vec![0x81, 0x02, b'h', b'i']);

        let long = "x".repeat(300);
        let frame = encode_text(&long);
        assert_eq!(&frame[..4], &[0x81, 126, 0x01, 0x2C]);
        assert_eq!(frame.len(), 4 + 300);
    }

    #[test]
    fn test_parse_header_needs_more_data() {
        assert!(parse_header(&[0x81]).unwrap().is_none());
        assert!(parse_header(&[0x81, 0x80 | 126, 0x01]).unwrap().is_none());
        assert!(parse_header(&[0x81, 0x80 | 5, 1, 2]).unwrap().is_none());
    }

    #[test]
    fn test_parse_header_rejects_oversized_64bit_length() {
        let mut data = vec![0x82, 0x80 | 127];
        data.extend_from_slice(&u64::MAX.to_be_bytes());
        data.extend_from_slice(&MASK);
        assert!(matches!(
            parse_header(&data),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_decoder_text_across_chunks() {
        let frame = encode_frame(OpCode::Text, b"cmd x|", Some(MASK));
        let mut decoder = MessageDecoder::new();
        decoder.feed(&frame[..3]).unwrap();
        assert_eq!(decoder.next_message().unwrap(), None);
        decoder.feed(&frame[3..]).unwrap();
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Text("cmd x|".into()))
        );
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_rejects_unmasked() {
        let mut decoder = MessageDecoder::new();
        decoder.feed(&encode_text("hi")).unwrap();
        assert!(matches!(decoder.next_message(), Err(ProtocolError::Unmasked)));
    }

    #[test]
    fn test_decoder_rejects_continuation_and_non_final() {
        let mut frame = encode_frame(OpCode::Text, b"a", Some(MASK));
        frame[0] = 0x01; // FIN cleared
        let mut decoder = MessageDecoder::new();
        decoder.feed(&frame).unwrap();
        assert!(matches!(decoder.next_message(), Err(ProtocolError::Continuation)));

        let frame = encode_frame(OpCode::Continuation, b"a", Some(MASK));
        let mut decoder = MessageDecoder::new();
        decoder.feed(&frame).unwrap();
        assert!(matches!(decoder.next_message(), Err(ProtocolError::Continuation)));
    }

    #[test]
    fn test_decoder_rejects_declared_oversize_before_payload_arrives() {
        let mut data = vec![0x82, 0x80 | 127];
        data.extend_from_slice(&((MAX_PAYLOAD_SIZE as u64) + 1).to_be_bytes());
        data.extend_from_slice(&MASK);
        let mut decoder = MessageDecoder::new();
        decoder.feed(&data).unwrap();
        assert!(matches!(
            decoder.next_message(),
            Err(ProtocolError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn test_decoder_caps_buffered_input() {
        let mut decoder = MessageDecoder::new();
        decoder.feed(&vec![0u8; MAX_PAYLOAD_SIZE]).unwrap();
        assert!(matches!(decoder.feed(&[0]), Err(ProtocolError::Overflow { .. })));
    }

    #[test]
    fn test_decoder_control_frames() {
        let mut decoder = MessageDecoder::new();
        decoder
            .feed(&encode_frame(OpCode::Ping, b"p", Some(MASK)))
            .unwrap();
        decoder
            .feed(&encode_frame(OpCode::Close, &[], Some(MASK)))
            .unwrap();
        assert_eq!(
            decoder.next_message().unwrap(),
            Some(Message::Ping(b"p".to_vec()))
        );
        assert_eq!(decoder.next_message().unwrap(), Some(Message::Close));
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(matches!(
            parse_header(&[0x83, 0x80]),
            Err(ProtocolError::UnknownOpcode(3))
        ));
    }
}
