//! # Tunnel Frames
//!
//! Defines the framed messages exchanged between the relay and its agents
//! over the tunnel WebSocket. Every transport message is one JSON object:
//!
//! ```text
//! { "id": "...", "type": "request", "timestamp": 1700000000000,
//!   "clientId": "A3F8-B2C1", "payload": { ... } }
//! ```
//!
//! The envelope is decoded here; the kind-dependent `payload` shape is
//! validated by the handler for that kind, not by the codec.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Frames larger than this close the link.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// The `type` tag of a frame.
///
/// `Unknown` absorbs any tag this build does not recognize, so a newer peer
/// cannot kill the link by sending a kind we have never heard of — the frame
/// is logged and discarded instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    Register,
    Request,
    Response,
    Error,
    Heartbeat,
    Pong,
    #[serde(other)]
    Unknown,
}

/// One message on the tunnel link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    /// Correlation identifier, unique within a link.
    pub id: String,

    #[serde(rename = "type")]
    pub kind: FrameKind,

    /// Milliseconds since epoch. Informational only.
    pub timestamp: u64,

    /// The agent's identity; present on register and heartbeat frames.
    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    /// Kind-dependent body, validated by the receiving handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
    /// A fresh frame with a random id and the current timestamp.
    pub fn new(kind: FrameKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: now_ms(),
            client_id: None,
            payload: None,
        }
    }

    /// A frame answering another one: same id, fresh timestamp.
    pub fn reply(kind: FrameKind, id: &str) -> Self {
        Self {
            id: id.to_string(),
            kind,
            timestamp: now_ms(),
            client_id: None,
            payload: None,
        }
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn with_payload<T: Serialize>(mut self, payload: &T) -> Self {
        self.payload = serde_json::to_value(payload).ok();
        self
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ─── Per-Kind Payloads ──────────────────────────────────────────

/// `register`, agent → relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterPayload {
    pub name: String,
    pub default_target: String,
    #[serde(default)]
    pub mappings: Vec<MappingEntry>,
}

/// One entry in an agent's routing table. Disabled entries never reach
/// the wire; what registers here is the effective table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingEntry {
    pub prefix: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

/// `register`, relay → agent confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterConfirm {
    pub confirmed: bool,
}

/// `request`, relay → agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default)]
    pub query: serde_json::Map<String, Value>,
    /// Base URL chosen by the relay's resolver; the agent trusts this
    /// annotation when present and re-resolves otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_mapping: Option<String>,
}

/// `response`, agent → relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub status_code: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: String,
    /// Wall-clock milliseconds from dispatch to resolution; stamped by
    /// the relay's pending table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<String>,
}

/// `error`, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_wire_field_names() {
        let frame = Frame::new(FrameKind::Register)
            .with_client_id("A3F8-B2C1")
            .with_payload(&RegisterConfirm { confirmed: true });
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();

        assert_eq!(value["type"], "register");
        assert_eq!(value["clientId"], "A3F8-B2C1");
        assert_eq!(value["payload"]["confirmed"], true);
        assert!(value["timestamp"].is_u64());
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let frame = Frame::new(FrameKind::Heartbeat);
        let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
        assert!(value.get("clientId").is_none());
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn unknown_kind_decodes_as_unknown() {
        let text = r#"{"id":"x","type":"mystery","timestamp":1}"#;
        let frame = Frame::decode(text).unwrap();
        assert_eq!(frame.kind, FrameKind::Unknown);
    }

    #[test]
    fn kinds_round_trip_in_snake_case() {
        for (kind, tag) in [
            (FrameKind::Register, "register"),
            (FrameKind::Request, "request"),
            (FrameKind::Response, "response"),
            (FrameKind::Error, "error"),
            (FrameKind::Heartbeat, "heartbeat"),
            (FrameKind::Pong, "pong"),
        ] {
            let frame = Frame::new(kind);
            let value: Value = serde_json::from_str(&frame.encode().unwrap()).unwrap();
            assert_eq!(value["type"], tag);
            assert_eq!(Frame::decode(&frame.encode().unwrap()).unwrap().kind, kind);
        }
    }

    #[test]
    fn request_payload_uses_camel_case() {
        let payload = RequestPayload {
            method: "GET".into(),
            path: "/api/test".into(),
            headers: HashMap::new(),
            body: None,
            query: serde_json::Map::new(),
            target_mapping: Some("http://localhost:8080".into()),
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["targetMapping"], "http://localhost:8080");
        assert!(value.get("body").is_none());
    }

    #[test]
    fn response_payload_decodes_from_wire_form() {
        let value = json!({
            "statusCode": 201,
            "headers": { "content-type": "application/json" },
            "body": "{\"ok\":true}"
        });
        let payload: ResponsePayload = serde_json::from_value(value).unwrap();
        assert_eq!(payload.status_code, 201);
        assert_eq!(payload.duration, None);
    }
}
