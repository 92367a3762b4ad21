//! Codec trait and the JSON implementation.
//!
//! A codec converts between [`Envelope`]s and raw bytes. The rest of the
//! stack doesn't care how frames are serialized — it just needs something
//! that implements [`Codec`]. The wire format fixes UTF-8 JSON text, so
//! [`JsonCodec`] is the only implementation today; the trait keeps the
//! seam for a binary codec without touching any other layer.

use crate::{Envelope, Message, ProtocolError};

/// Hard cap on frame size, in both directions: 256 KiB.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// Encodes envelopes to bytes and decodes bytes back.
pub trait Codec: Send + Sync + 'static {
    /// Serializes an envelope.
    ///
    /// # Errors
    /// [`ProtocolError::Encode`] if serialization fails,
    /// [`ProtocolError::Oversized`] if the result exceeds
    /// [`MAX_FRAME_BYTES`].
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes an envelope.
    ///
    /// # Errors
    /// [`ProtocolError::Oversized`] for frames over the cap,
    /// [`ProtocolError::UnknownType`] for well-formed envelopes with an
    /// unrecognized tag, [`ProtocolError::Decode`] otherwise.
    fn decode(&self, data: &[u8]) -> Result<Envelope, ProtocolError>;
}

/// A [`Codec`] that uses JSON via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Vec<u8>, ProtocolError> {
        let bytes =
            serde_json::to_vec(envelope).map_err(ProtocolError::Encode)?;
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Oversized {
                len: bytes.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        Ok(bytes)
    }

    fn decode(&self, data: &[u8]) -> Result<Envelope, ProtocolError> {
        if data.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::Oversized {
                len: data.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        match serde_json::from_slice(data) {
            Ok(envelope) => Ok(envelope),
            Err(e) => {
                // A frame that is valid JSON with an unrecognized `type`
                // is a forward-compatibility event, not garbage. Classify
                // it so callers can warn-and-drop instead of counting it
                // against the sender's parse-error window.
                if let Ok(value) =
                    serde_json::from_slice::<serde_json::Value>(data)
                {
                    if let Some(tag) =
                        value.get("type").and_then(|t| t.as_str())
                    {
                        if !Message::KNOWN_TAGS.contains(&tag) {
                            return Err(ProtocolError::UnknownType(
                                tag.to_string(),
                            ));
                        }
                    }
                }
                Err(ProtocolError::Decode(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Message, PeerId};

    fn ping() -> Envelope {
        Envelope::new(Message::Ping { timestamp: 42 }, PeerId::from("peer-a"))
    }

    #[test]
    fn test_round_trip() {
        let codec = JsonCodec;
        let env = ping();
        let bytes = codec.encode(&env).unwrap();
        let back = codec.decode(&bytes).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let codec = JsonCodec;
        let env = Envelope::new(
            Message::Chat {
                room_id: "r-1".into(),
                message: "x".repeat(MAX_FRAME_BYTES),
            },
            PeerId::from("peer-a"),
        );
        let err = codec.encode(&env).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn test_decode_rejects_oversized_frame() {
        let codec = JsonCodec;
        let blob = vec![b'x'; MAX_FRAME_BYTES + 1];
        let err = codec.decode(&blob).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn test_decode_garbage_is_parse_error() {
        let codec = JsonCodec;
        let err = codec.decode(b"not json at all").unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
        assert!(err.is_parse_error());
    }

    #[test]
    fn test_decode_unknown_type_is_classified() {
        let codec = JsonCodec;
        let frame = br#"{
            "type": "FLY_TO_MOON",
            "data": { "speed": 9000 },
            "timestamp": 1,
            "peerId": "peer-a"
        }"#;
        let err = codec.decode(frame).unwrap_err();
        match err {
            ProtocolError::UnknownType(tag) => assert_eq!(tag, "FLY_TO_MOON"),
            other => panic!("expected UnknownType, got {other:?}"),
        }
        // Unknown tags do not count against the parse-error window.
        assert!(!codec.decode(frame).unwrap_err().is_parse_error());
    }

    #[test]
    fn test_decode_known_type_bad_schema_is_parse_error() {
        // Known tag, wrong data shape → Decode, not UnknownType.
        let codec = JsonCodec;
        let frame = br#"{
            "type": "PING",
            "data": { "timestamp": "not-a-number" },
            "timestamp": 1,
            "peerId": "peer-a"
        }"#;
        let err = codec.decode(frame).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }
}
