//! `graphql-transport-ws` frame codec.
//!
//! Outbound frames are serialized from [`MessageOut`]; inbound text is
//! classified into the closed set of [`Frame`] kinds. Text that does not start
//! with `{` is not a protocol frame and is ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Outbound ────────────────────────────────────────────────────────────────

/// Frames sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum MessageOut {
    #[serde(rename = "connection_init")]
    ConnectionInit { payload: InitPayload },
    #[serde(rename = "subscribe")]
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    /// Client-side stop of one operation.
    #[serde(rename = "complete")]
    Complete { id: String },
    #[serde(rename = "connection_terminate")]
    ConnectionTerminate,
    #[serde(rename = "pong")]
    Pong,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InitPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribePayload {
    pub query: String,
    pub variables: Option<Value>,
    pub operation_name: Option<String>,
    pub extensions: Option<Value>,
}

impl MessageOut {
    pub fn init(token: &str) -> Self {
        Self::ConnectionInit {
            payload: InitPayload {
                token: token.to_string(),
            },
        }
    }

    pub fn subscribe(operation_id: u64, query: &str) -> Self {
        Self::Subscribe {
            id: operation_id.to_string(),
            payload: SubscribePayload {
                query: query.to_string(),
                variables: None,
                operation_name: None,
                extensions: None,
            },
        }
    }

    pub fn stop(operation_id: u64) -> Self {
        Self::Complete {
            id: operation_id.to_string(),
        }
    }

    /// Single-line JSON text.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─── Inbound ─────────────────────────────────────────────────────────────────

/// Classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// `connection_ack`
    InitAck,
    /// `connection_error`
    InitError(Value),
    /// `next` (or legacy `data`)
    Next {
        id: String,
        data: Option<Value>,
        errors: Option<Value>,
    },
    /// `error`
    Error { id: Option<String>, payload: Value },
    /// `complete`
    Complete { id: String },
    /// Protocol-level `ping`; must be answered with `pong`.
    Ping,
    /// `pong` or legacy `ka` keep-alive.
    KeepAlive,
    Unrecognized(String),
}

#[derive(Debug, Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for non-protocol noise.
pub fn decode(text: &str) -> Result<Option<Frame>, serde_json::Error> {
    if !text.trim_start().starts_with('{') {
        return Ok(None);
    }

    let raw: RawFrame = serde_json::from_str(text)?;
    let id = raw.id.as_ref().and_then(id_to_string);

    let frame = match raw.kind.as_str() {
        "connection_ack" => Frame::InitAck,
        "connection_error" => Frame::InitError(raw.payload.unwrap_or(Value::Null)),
        "next" | "data" => {
            let mut payload = raw.payload.unwrap_or(Value::Null);
            Frame::Next {
                id: id.unwrap_or_default(),
                data: take_non_null(&mut payload, "data"),
                errors: take_non_null(&mut payload, "errors"),
            }
        }
        "error" => Frame::Error {
            id,
            payload: raw.payload.unwrap_or(Value::Null),
        },
        "complete" => Frame::Complete {
            id: id.unwrap_or_default(),
        },
        "ping" => Frame::Ping,
        "pong" | "ka" => Frame::KeepAlive,
        other => Frame::Unrecognized(other.to_string()),
    };

    Ok(Some(frame))
}

fn id_to_string(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn take_non_null(payload: &mut Value, key: &str) -> Option<Value> {
    payload
        .get_mut(key)
        .map(Value::take)
        .filter(|v| !v.is_null())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_init() {
        let text = MessageOut::init("tok").encode().unwrap();
        assert_eq!(text, r#"{"type":"connection_init","payload":{"token":"tok"}}"#);
    }

    #[test]
    fn test_encode_subscribe() {
        let text = MessageOut::subscribe(7, "subscription{x}").encode().unwrap();
        let value: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "subscribe",
                "id": "7",
                "payload": {
                    "query": "subscription{x}",
                    "variables": null,
                    "operationName": null,
                    "extensions": null
                }
            })
        );
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_encode_stop_and_terminate() {
        assert_eq!(
            MessageOut::stop(3).encode().unwrap(),
            r#"{"type":"complete","id":"3"}"#
        );
        assert_eq!(
            MessageOut::ConnectionTerminate.encode().unwrap(),
            r#"{"type":"connection_terminate"}"#
        );
        assert_eq!(MessageOut::Pong.encode().unwrap(), r#"{"type":"pong"}"#);
    }

    #[test]
    fn test_decode_handshake_frames() {
        assert_eq!(
            decode(r#"{"type":"connection_ack"}"#).unwrap(),
            Some(Frame::InitAck)
        );
        assert_eq!(
            decode(r#"{"type":"connection_error","payload":{"message":"bad"}}"#).unwrap(),
            Some(Frame::InitError(json!({"message": "bad"})))
        );
    }

    #[test]
    fn test_decode_next() {
        let frame = decode(
            r#"{"type":"next","id":"2","payload":{"data":{"liveMeasurement":{"power":1200}}}}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            Some(Frame::Next {
                id: "2".into(),
                data: Some(json!({"liveMeasurement": {"power": 1200}})),
                errors: None,
            })
        );
    }

    #[test]
    fn test_decode_legacy_data_with_numeric_id() {
        let frame = decode(r#"{"type":"data","id":1,"payload":{"data":null,"errors":[{"message":"x"}]}}"#)
            .unwrap();
        assert_eq!(
            frame,
            Some(Frame::Next {
                id: "1".into(),
                data: None,
                errors: Some(json!([{"message": "x"}])),
            })
        );
    }

    #[test]
    fn test_decode_error_and_complete() {
        assert_eq!(
            decode(r#"{"type":"error","id":"4","payload":[{"message":"boom"}]}"#).unwrap(),
            Some(Frame::Error {
                id: Some("4".into()),
                payload: json!([{"message": "boom"}]),
            })
        );
        assert_eq!(
            decode(r#"{"type":"complete","id":"4"}"#).unwrap(),
            Some(Frame::Complete { id: "4".into() })
        );
    }

    #[test]
    fn test_decode_keepalives() {
        assert_eq!(decode(r#"{"type":"ping"}"#).unwrap(), Some(Frame::Ping));
        assert_eq!(decode(r#"{"type":"pong"}"#).unwrap(), Some(Frame::KeepAlive));
        assert_eq!(decode(r#"{"type":"ka"}"#).unwrap(), Some(Frame::KeepAlive));
    }

    #[test]
    fn test_decode_unrecognized() {
        assert_eq!(
            decode(r#"{"type":"mystery"}"#).unwrap(),
            Some(Frame::Unrecognized("mystery".into()))
        );
    }

    #[test]
    fn test_non_protocol_text_ignored() {
        assert_eq!(decode("ping").unwrap(), None);
        assert_eq!(decode("").unwrap(), None);
        assert_eq!(decode("[1,2]").unwrap(), None);
    }

    #[test]
    fn test_malformed_json_is_error() {
        assert!(decode("{not json").is_err());
        assert!(decode(r#"{"id":"1"}"#).is_err());
    }
}
