//! # Tunnel Frames (Agent Side)
//!
//! Framed messages exchanged with the relay. Must match the server's
//! `protocol.rs`: one JSON object per transport message with an `id`,
//! a `type` tag, a timestamp and a kind-dependent `payload`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Frames larger than this close the link.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// The `type` tag of a frame. `Unknown` absorbs tags this build does not
/// recognize; such frames are logged and discarded.
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
    pub id: String,

    #[serde(rename = "type")]
    pub kind: FrameKind,

    /// Milliseconds since epoch. Informational only.
    pub timestamp: u64,

    #[serde(rename = "clientId", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

impl Frame {
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

/// One entry in the agent's effective routing table.
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
    /// Base URL chosen by the relay's resolver. Trusted when present;
    /// otherwise the agent re-resolves against its own table.
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
