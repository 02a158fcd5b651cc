//! MsgPack codec using `rmp-serde`.
//!
//! Metadata and settings bodies are MessagePack. Structs are always written
//! with `to_vec_named` (struct-as-map) so that fields can be added to
//! [`Settings`](crate::protocol::Settings) without breaking older peers that
//! decode by name.

use crate::error::Result;

/// MessagePack codec for frame bodies.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes (struct-as-map).
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Body {
        alignment: u32,
        label: String,
        enabled: bool,
    }

    #[test]
    fn test_encode_decode_struct() {
        let original = Body {
            alignment: 64,
            label: "control".to_string(),
            enabled: true,
        };

        let encoded = MsgPackCodec::encode(&original).unwrap();
        let decoded: Body = MsgPackCodec::decode(&encoded).unwrap();

        assert_eq!(decoded, original);
    }

    #[test]
    fn test_structs_are_written_as_maps() {
        let encoded = MsgPackCodec::encode(&Body {
            alignment: 1,
            label: "x".to_string(),
            enabled: false,
        })
        .unwrap();

        // 0x83 = fixmap with 3 entries; positional encoding would be 0x93.
        assert_eq!(encoded[0], 0x83);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        #[derive(Serialize)]
        struct Newer {
            alignment: u32,
            label: String,
            enabled: bool,
            extra: u64,
        }

        let encoded = MsgPackCodec::encode(&Newer {
            alignment: 8,
            label: "data".to_string(),
            enabled: true,
            extra: 99,
        })
        .unwrap();
        let decoded: Body = MsgPackCodec::decode(&encoded).unwrap();
        assert_eq!(decoded.alignment, 8);
    }

    #[test]
    fn test_decode_error_on_invalid_data() {
        let result: Result<Body> = MsgPackCodec::decode(b"not valid msgpack");
        assert!(result.is_err());
    }
}
