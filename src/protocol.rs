//! Wire codec for the host/worker protocol.
//!
//! Each message is one newline-terminated JSON record tagged by a
//! `"type"` field:
//!
//! ```text
//! > {"type":"request","id":1,"op":"run","payload":{"code":"1+1"}}
//! {"type":"response","id":1,"result":2}
//! {"type":"event","handle":3,"payload":{"name":"console.log","value":"hi"}}
//! ```
//!
//! Pure functions, no I/O. Payloads are restricted to the JSON value
//! model (scalars, arrays, string-keyed maps); `serde_json` escapes any
//! interior newline in strings, so one record never spans lines.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single protocol message, host→worker (`Request`) or worker→host
/// (`Response`, `Event`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// A call from the host, correlated by `id`.
    Request {
        id: u64,
        op: String,
        #[serde(default, skip_serializing_if = "Value::is_null")]
        payload: Value,
    },
    /// The worker's answer to the request with the same `id`. Exactly
    /// one of `result`/`error` is present; an absent `result` reads as
    /// null.
    Response {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RemoteError>,
    },
    /// An unsolicited notification for one execution handle, not tied
    /// to any request.
    Event { handle: u64, payload: Value },
}

/// Error detail reported by the worker for a failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

/// Codec failure. `UnknownType` is kept separate from `Malformed`
/// because the session reader drops unknown discriminators and only
/// treats truly malformed records as fatal.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
}

const KNOWN_TYPES: [&str; 3] = ["request", "response", "event"];

/// Encodes a message as one newline-terminated JSON record.
///
/// Never fails for messages built from JSON-model values: `Message` is
/// a plain data enum and compact JSON output contains no raw newlines.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut bytes = serde_json::to_vec(msg).expect("message is always JSON-representable");
    bytes.push(b'\n');
    bytes
}

/// Decodes one record (with or without its trailing newline).
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let line = strip_newline(bytes)?;
    let value: Value =
        serde_json::from_slice(line).map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing \"type\" discriminator".into()))?;
    if !KNOWN_TYPES.contains(&tag) {
        return Err(DecodeError::UnknownType(tag.to_string()));
    }
    serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))
}

/// One record per line: a newline anywhere but the end means the caller
/// handed us more (or less) than a single frame.
fn strip_newline(bytes: &[u8]) -> Result<&[u8], DecodeError> {
    let line = match bytes.split_last() {
        Some((&b'\n', rest)) => rest,
        _ => bytes,
    };
    if line.contains(&b'\n') {
        return Err(DecodeError::Malformed("embedded newline in record".into()));
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roundtrip(msg: Message) {
        let bytes = encode(&msg);
        assert_eq!(*bytes.last().unwrap(), b'\n');
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_roundtrip_request() {
        roundtrip(Message::Request {
            id: 1,
            op: "run".into(),
            payload: json!({"code": "1+1"}),
        });
    }

    #[test]
    fn test_roundtrip_request_without_payload() {
        roundtrip(Message::Request {
            id: 7,
            op: "ping".into(),
            payload: Value::Null,
        });
    }

    #[test]
    fn test_roundtrip_response_result() {
        roundtrip(Message::Response {
            id: 2,
            result: Some(json!([1, "two", null, {"three": 3.5}])),
            error: None,
        });
    }

    #[test]
    fn test_roundtrip_response_error() {
        roundtrip(Message::Response {
            id: 3,
            result: None,
            error: Some(RemoteError {
                message: "ReferenceError: x is not defined".into(),
                stack: Some("at <anonymous>:1:1".into()),
            }),
        });
    }

    #[test]
    fn test_roundtrip_event() {
        roundtrip(Message::Event {
            handle: 4,
            payload: json!({"name": "console.log", "value": "line one\nline two"}),
        });
    }

    #[test]
    fn test_encode_escapes_string_newlines() {
        let bytes = encode(&Message::Request {
            id: 1,
            op: "run".into(),
            payload: json!({"code": "a\nb"}),
        });
        // Exactly one newline, the frame terminator.
        assert_eq!(bytes.iter().filter(|&&b| b == b'\n').count(), 1);
    }

    #[test]
    fn test_decode_rejects_invalid_json() {
        assert!(matches!(
            decode(b"{not json}\n"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_missing_discriminator() {
        assert!(matches!(
            decode(br#"{"id":1,"op":"run"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_rejects_non_string_discriminator() {
        assert!(matches!(
            decode(br#"{"type":7,"id":1}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_unknown_type_is_distinct() {
        assert!(matches!(
            decode(br#"{"type":"heartbeat","seq":9}"#),
            Err(DecodeError::UnknownType(t)) if t == "heartbeat"
        ));
    }

    #[test]
    fn test_decode_rejects_embedded_newline() {
        assert!(matches!(
            decode(b"{\"type\":\"request\",\n\"id\":1,\"op\":\"x\"}\n"),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_missing_required_field() {
        // A response without an id cannot be correlated.
        assert!(matches!(
            decode(br#"{"type":"response","result":1}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn test_absent_result_decodes_as_none() {
        let msg = decode(br#"{"type":"response","id":5}"#).unwrap();
        assert_eq!(
            msg,
            Message::Response {
                id: 5,
                result: None,
                error: None
            }
        );
    }
}
