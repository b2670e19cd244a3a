//! Tunnel wire format.
//!
//! Every frame exchanged over the tunnel is one WebSocket text message
//! containing a JSON-encoded [`TunnelMessage`], tagged by its `type` field.
//! The WebSocket transport is already self-delimiting, so no extra length
//! prefixing is needed.
//!
//! Request/response bodies and `ws_data` payloads are base64-encoded inside
//! the JSON envelope so arbitrary bytes (NUL, non-UTF8) round-trip exactly.
//!
//! Decoding a frame with an unknown `type` is a protocol error: the caller
//! must tear the connection down rather than skip the frame, since a framed
//! stream with unrecognized messages cannot be safely resynchronized.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// HTTP headers as carried on the wire: name → ordered list of values.
pub type Headers = HashMap<String, Vec<String>>;

/// A single tunnel frame, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    /// Manager → agent: a proxied HTTP request.
    Request {
        /// Correlation id, unique among outstanding requests on the connection.
        id: String,
        method: String,
        /// Path + query, already rewritten to the agent's local addressing
        /// scheme (environment segment replaced with the local sentinel).
        path: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        body: Vec<u8>,
        /// Original client address, for the agent's forwarded-for chain.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remote_addr: Option<String>,
    },
    /// Agent → manager: the response to a `request` with the same `id`.
    Response {
        id: String,
        status: u16,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        body: Vec<u8>,
        /// Terminal flag. Always true today; kept in the format so streamed
        /// continuation frames can be added without a wire break.
        #[serde(default = "default_true")]
        done: bool,
    },
    /// Liveness probe. Carries no correlation id.
    Heartbeat,
    /// Immediate answer to a `heartbeat`.
    HeartbeatAck,
    /// Manager → agent: open a WebSocket sub-stream to a local target.
    WsStart {
        /// Stream id, unique among active streams on the connection.
        id: String,
        path: String,
        #[serde(default)]
        headers: Headers,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        protocol: Option<String>,
    },
    /// One WebSocket message relayed over a sub-stream, either direction.
    /// Message boundaries are preserved: one source WS message = one frame.
    WsData {
        id: String,
        #[serde(default)]
        opcode: WsOpcode,
        #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// Close a sub-stream. Sent by either side; idempotent.
    WsClose {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// WebSocket framing preserved across the tunnel for `ws_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WsOpcode {
    #[default]
    Text,
    Binary,
}

fn default_true() -> bool {
    true
}

impl TunnelMessage {
    /// Correlation/stream id of this frame, if it carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Request { id, .. }
            | Self::Response { id, .. }
            | Self::WsStart { id, .. }
            | Self::WsData { id, .. }
            | Self::WsClose { id, .. } => Some(id),
            Self::Heartbeat | Self::HeartbeatAck => None,
        }
    }

    /// Serialize to the on-wire JSON text.
    pub fn encode(&self) -> String {
        serde_json::to_string(self).expect("TunnelMessage serializes")
    }

    /// Parse an on-wire frame. An unknown `type` or malformed payload is a
    /// protocol error; the connection carrying it must be closed.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// Base64 (de)serialization for binary payloads inside the JSON envelope.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: &TunnelMessage) -> TunnelMessage {
        TunnelMessage::decode(&msg.encode()).expect("decodes")
    }

    #[test]
    fn test_request_roundtrip_binary_body() {
        let mut headers = Headers::new();
        headers.insert(
            "Accept".to_string(),
            vec!["application/json".to_string(), "text/plain".to_string()],
        );
        let msg = TunnelMessage::Request {
            id: "req-1".to_string(),
            method: "POST".to_string(),
            path: "/api/environments/0/containers".to_string(),
            headers,
            body: vec![0x00, 0xff, 0xfe, 0x00, b'x'],
            remote_addr: Some("203.0.113.9".to_string()),
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_response_done_defaults_true() {
        let parsed = TunnelMessage::decode(r#"{"type":"response","id":"a","status":200}"#)
            .expect("decodes");
        match parsed {
            TunnelMessage::Response { done, status, .. } => {
                assert!(done);
                assert_eq!(status, 200);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_ws_data_roundtrip_nul_bytes() {
        let msg = TunnelMessage::WsData {
            id: "s1".to_string(),
            opcode: WsOpcode::Binary,
            payload: vec![1, 0, 0, 0, 12, b'\n', 0x80],
        };
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_heartbeat_wire_shape() {
        assert_eq!(TunnelMessage::Heartbeat.encode(), r#"{"type":"heartbeat"}"#);
        assert_eq!(
            TunnelMessage::decode(r#"{"type":"heartbeat_ack"}"#).expect("decodes"),
            TunnelMessage::HeartbeatAck
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(TunnelMessage::decode(r#"{"type":"shutdown","id":"x"}"#).is_err());
        assert!(TunnelMessage::decode("not json at all").is_err());
    }

    #[test]
    fn test_ws_close_optional_fields() {
        let msg = TunnelMessage::WsClose {
            id: "s1".to_string(),
            code: None,
            reason: None,
        };
        assert_eq!(msg.encode(), r#"{"type":"ws_close","id":"s1"}"#);
        assert_eq!(roundtrip(&msg), msg);
    }

    #[test]
    fn test_id_accessor() {
        assert_eq!(TunnelMessage::Heartbeat.id(), None);
        let msg = TunnelMessage::WsClose {
            id: "s9".to_string(),
            code: Some(1000),
            reason: None,
        };
        assert_eq!(msg.id(), Some("s9"));
    }
}
