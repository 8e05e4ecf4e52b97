//! Codec for encoding and decoding chatbus frames.
//!
//! Frames are UTF-8 JSON objects, one per transport message.

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use crate::frames::{ClientFrame, ServerFrame};

/// Maximum frame size (64 KiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {0} exceeds maximum {MAX_FRAME_SIZE}")]
    FrameTooLarge(usize),

    /// The frame is not a JSON object of the expected shape.
    #[error("Invalid message format")]
    Malformed(String),

    /// The frame is well-formed but its `type` is not understood.
    #[error("Unknown message type")]
    UnknownType(String),

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Encode a frame to its JSON text.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<String, ProtocolError> {
    serde_json::to_string(frame).map_err(ProtocolError::Encode)
}

/// Decode a client frame.
///
/// Unparseable input and wrongly typed fields are reported as
/// [`ProtocolError::Malformed`]; an object with an unrecognised `type` as
/// [`ProtocolError::UnknownType`].
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid client frame.
pub fn decode(data: &[u8]) -> Result<ClientFrame, ProtocolError> {
    let value = parse_object(data)?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !ClientFrame::KINDS.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Decode a server frame.
///
/// # Errors
///
/// Returns an error if the data is too large or is not a valid server frame.
pub fn decode_server(data: &[u8]) -> Result<ServerFrame, ProtocolError> {
    let value = parse_object(data)?;
    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

fn parse_object(data: &[u8]) -> Result<Value, ProtocolError> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(data.len()));
    }

    let value: Value =
        serde_json::from_slice(data).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    if !value.is_object() {
        return Err(ProtocolError::Malformed("frame is not an object".into()));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_subscribe() {
        let frame = decode(br#"{"type":"subscribe","channel":"general","username":"alice"}"#)
            .unwrap();
        assert_eq!(frame, ClientFrame::subscribe("general", "alice"));
    }

    #[test]
    fn test_decode_invalid_json() {
        let err = decode(b"{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert_eq!(err.to_string(), "Invalid message format");
    }

    #[test]
    fn test_decode_non_object() {
        assert!(matches!(decode(b"[1,2]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(decode(b"\"ping\""), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_decode_unknown_type() {
        let err = decode(br#"{"type":"dance"}"#).unwrap_err();
        match &err {
            ProtocolError::UnknownType(kind) => assert_eq!(kind, "dance"),
            other => panic!("Expected UnknownType, got {:?}", other),
        }
        assert_eq!(err.to_string(), "Unknown message type");

        // Missing type is unknown, not malformed
        assert!(matches!(decode(b"{}"), Err(ProtocolError::UnknownType(_))));
    }

    #[test]
    fn test_decode_wrong_field_type() {
        let err = decode(br#"{"type":"publish","channel":"a","text":5,"username":"u"}"#)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_frame_too_large() {
        let text = "a".repeat(MAX_FRAME_SIZE);
        let frame = encode(&ClientFrame::publish("test", text, "u")).unwrap();

        match decode(frame.as_bytes()) {
            Err(ProtocolError::FrameTooLarge(_)) => {}
            other => panic!("Expected FrameTooLarge error, got {:?}", other),
        }
    }

    #[test]
    fn test_server_frame_decode() {
        let encoded = encode(&ServerFrame::unsubscribed("general")).unwrap();
        let decoded = decode_server(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, ServerFrame::unsubscribed("general"));
    }
}
