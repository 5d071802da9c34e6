//! The browser line protocol carried in WebSocket text frames.
//!
//! ```text
//! <header> <escaped payload>|
//! ```
//!
//! `|` terminates a message. Inside the payload `%` becomes `%25` and `|`
//! becomes `%7C`, so a raw `|` can only ever be a terminator.

use serde::Serialize;

use crate::{Codec, ProtocolError};

/// Upper bound on text held back waiting for a terminator.
pub const MAX_PENDING: usize = crate::websocket::MAX_PAYLOAD_SIZE;

/// Escapes `%` and `|` for transmission.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '|' => out.push_str("%7C"),
            other => out.push(other),
        }
    }
    out
}

/// Reverses [`escape`]. Any other `%` sequence is left untouched.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('%') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if tail.starts_with("%25") {
            out.push('%');
            rest = &tail[3..];
        } else if tail.starts_with("%7C") || tail.starts_with("%7c") {
            out.push('|');
            rest = &tail[3..];
        } else {
            out.push('%');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// Formats one message: header, space, escaped payload, terminator.
pub fn encode_line(header: &str, payload: &str) -> String {
    format!("{header} {}|", escape(payload))
}

/// Serializes `value` with `codec` and formats it as one message.
pub fn encode_message<C: Codec, T: Serialize>(
    codec: &C,
    header: &str,
    value: &T,
) -> Result<String, ProtocolError> {
    Ok(encode_line(header, &codec.encode(value)?))
}

/// One logical message split out of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMessage {
    /// Lowercased header word.
    pub header: String,
    /// Unescaped payload; empty when the message had no space.
    pub payload: String,
}

/// Buffers partial messages across frames and splits on `|`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: String,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text received but not yet terminated.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    /// Adds `text` and returns every message it completed.
    pub fn push(&mut self, text: &str) -> Result<Vec<LineMessage>, ProtocolError> {
        if self.pending.len() + text.len() > MAX_PENDING {
            return Err(ProtocolError::Overflow {
                size: self.pending.len() + text.len(),
                max: MAX_PENDING,
            });
        }
        self.pending.push_str(text);

        let mut messages = Vec::new();
        while let Some(end) = self.pending.find('|') {
            let raw: String = self.pending.drain(..=end).collect();
            let raw = &raw[..raw.len() - 1];
            let (header, payload) = match raw.find(' ') {
                Some(space) => (&raw[..space], &raw[space + 1..]),
                None => (raw, ""),
            };
            messages.push(LineMessage {
                header: header.to_lowercase(),
                payload: unescape(payload),
            });
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_round_trip() {
        let raw = r#"{"text":"100% | done"}"#;
        let escaped = escape(raw);
        assert_eq!(escaped, r#"{"text":"100%25 %7C done"}"#);
        assert!(!escaped.contains('|'));
        assert_eq!(unescape(&escaped), raw);
    }

    #[test]
    fn test_unescape_leaves_unknown_sequences() {
        assert_eq!(unescape("50%off %2"), "50%off %2");
        assert_eq!(unescape("a%7cb"), "a|b");
    }

    #[test]
    fn test_encode_line() {
        assert_eq!(
            encode_line("err", r#"{"message":"a|b"}"#),
            r#"err {"message":"a%7Cb"}|"#
        );
    }

    #[test]
    fn test_splitter_buffers_across_pushes() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push("CMD {\"a\"").unwrap().is_empty());
        assert_eq!(splitter.pending(), "CMD {\"a\"");

        let messages = splitter.push(":1}|stp {}|tr").unwrap();
        assert_eq!(
            messages,
            vec![
                LineMessage {
                    header: "cmd".into(),
                    payload: "{\"a\":1}".into()
                },
                LineMessage {
                    header: "stp".into(),
                    payload: "{}".into()
                },
            ]
        );
        assert_eq!(splitter.pending(), "tr");
    }

    #[test]
    fn test_splitter_header_without_payload() {
        let mut splitter = LineSplitter::new();
        let messages = splitter.push("ping|").unwrap();
        assert_eq!(messages[0].header, "ping");
        assert_eq!(messages[0].payload, "");
    }

    #[test]
    fn test_splitter_unescapes_payload() {
        let mut splitter = LineSplitter::new();
        let line = encode_line("cmd", "say 50% | 50%");
        let messages = splitter.push(&line).unwrap();
        assert_eq!(messages[0].payload, "say 50% | 50%");
    }
}
