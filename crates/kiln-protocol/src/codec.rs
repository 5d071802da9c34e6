//! Codec trait and implementations for the text payloads of the browser
//! line protocol.
//!
//! The line layer doesn't care how a payload becomes text; it only needs
//! something implementing [`Codec`]. [`JsonCodec`] is the one the browser
//! client speaks.

use serde::{de::DeserializeOwned, Serialize};

use crate::ProtocolError;

/// Converts values to and from the textual payload of a line message.
///
/// `decode` fails on malformed input and on missing members alike; the
/// caller treats both as a dropped packet, not a dead connection.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into payload text.
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError>;

    /// Deserializes payload text into a value.
    fn decode<T: DeserializeOwned>(&self, data: &str) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`.
///
/// ```rust
/// use kiln_protocol::{Codec, JsonCodec};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize, PartialEq, Debug)]
/// #[serde(rename_all = "camelCase")]
/// struct Stop {
///     instance_id: String,
/// }
///
/// let text = JsonCodec.encode(&Stop { instance_id: "abc".into() }).unwrap();
/// assert_eq!(text, r#"{"instanceId":"abc"}"#);
/// let back: Stop = JsonCodec.decode(&text).unwrap();
/// assert_eq!(back.instance_id, "abc");
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<String, ProtocolError> {
        serde_json::to_string(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &str) -> Result<T, ProtocolError> {
        serde_json::from_str(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    #[allow(dead_code)]
    struct NeedsMember {
        package_name: String,
    }

    #[test]
    fn test_missing_member_is_decode_error() {
        let err = JsonCodec.decode::<NeedsMember>("{}").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert!(err.to_string().contains("package_name"));
    }

    #[test]
    fn test_malformed_json_is_decode_error() {
        assert!(matches!(
            JsonCodec.decode::<NeedsMember>("{not json"),
            Err(ProtocolError::Decode(_))
        ));
    }
}
