//! The transport envelope: every payload that crosses a transport travels
//! inside a [`Message`], which carries routing metadata (reply topic,
//! correlation id, headers) alongside opaque payload bytes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ─── Well-known headers ──────────────────────────────────────────────────

/// Receiver should reply directly to the message source.
pub const RESPOND_TO_SOURCE: &str = "x-respond-to-source";
/// Receiver should reply to the whole group session.
pub const RESPOND_TO_GROUP: &str = "x-respond-to-group";
/// Token that, when seen in a payload, ends the group session.
pub const SESSION_END_MESSAGE: &str = "x-session-end-message";
/// Comma-separated identities that must not respond in a group chat.
pub const MUTED_PARTICIPANTS: &str = "x-muted-participants";
/// Broadcast group a fan-out request was addressed to.
pub const BROADCAST_GROUP: &str = "x-broadcast-group";

// ─── Message ─────────────────────────────────────────────────────────────

/// Envelope for a single payload crossing a transport.
///
/// Payload bytes are base64-encoded on the wire so the envelope itself stays
/// valid JSON regardless of payload content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Payload discriminator, e.g. `A2ARequest`, `A2AResponse`, `MCPFrame`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque payload bytes.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
    /// Topic the receiver should publish its reply to, when reply routing is
    /// payload-driven (NATS). SLIM correlates by session instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// Links a response back to its request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Transport-level metadata headers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// When the envelope was created.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// HTTP-ish route hint for bridges that dispatch by path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route_path: Option<String>,
    /// HTTP-ish method hint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl Message {
    pub fn new(kind: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind: kind.into(),
            payload: payload.into(),
            reply_to: None,
            correlation_id: None,
            headers: HashMap::new(),
            timestamp: Utc::now(),
            route_path: None,
            method: None,
        }
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Whether a boolean-valued header is set to `"true"`.
    pub fn header_flag(&self, key: &str) -> bool {
        self.header(key)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// The payload as UTF-8 text, lossy.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn serialize(&self) -> Vec<u8> {
        // Serialization of a fully-owned struct cannot fail.
        serde_json::to_vec(self).expect("message serialization")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map_err(|e| Error::Decode(format!("invalid message envelope: {e}")))
    }

    /// Copy the reply-routing headers of `request` onto this message unless
    /// already set, so relays preserve the original routing intent.
    pub fn propagate_routing(mut self, request: &Message) -> Self {
        for key in [
            RESPOND_TO_SOURCE,
            RESPOND_TO_GROUP,
            SESSION_END_MESSAGE,
            MUTED_PARTICIPANTS,
        ] {
            if !self.headers.contains_key(key) {
                if let Some(value) = request.header(key) {
                    self.headers.insert(key.to_string(), value.to_string());
                }
            }
        }
        if self.reply_to.is_none() {
            self.reply_to = request.reply_to.clone();
        }
        self
    }
}

// ─── MCP stream framing ──────────────────────────────────────────────────

/// Frame multiplexing MCP JSON-RPC bytes over one transport subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpFrame {
    /// Identifies the logical client stream.
    pub stream_id: String,
    /// Monotonic per-stream sequence number.
    pub seq: u64,
    /// Raw MCP JSON-RPC bytes.
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

impl McpFrame {
    pub fn new(stream_id: impl Into<String>, seq: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            seq,
            payload: payload.into(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("frame serialization")
    }

    pub fn deserialize(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::Decode(format!("invalid MCP frame: {e}")))
    }
}

// ─── base64 payload codec ────────────────────────────────────────────────

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
