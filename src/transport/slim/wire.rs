//! SLIM wire protocol: length-prefixed JSON frames over a TCP stream.
//!
//! Every frame is `u32` big-endian length followed by a JSON document. The
//! same codec is used by client connections and the embedded node.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Upper bound on a single frame; larger frames indicate a corrupt stream.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Session configurations the fabric understands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionConfig {
    /// Request/reply conversation with a single peer.
    PointToPoint { peer: String },
    /// Moderated multi-party session on a named channel.
    Group { channel: String },
}

/// Frames exchanged between a SLIM endpoint and the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// First frame on every connection: authenticate an identity.
    Hello { identity: String, digest: String },
    HelloAck {
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Open a session. The creator becomes its moderator.
    CreateSession {
        session_id: String,
        config: SessionConfig,
    },
    /// Node → endpoint: a session now includes you.
    SessionOpen {
        session_id: String,
        config: SessionConfig,
        moderator: String,
    },
    /// Moderator adds a participant to a group session.
    Invite {
        session_id: String,
        participant: String,
    },
    /// Publish on a session. `to` narrows delivery to one member; otherwise
    /// the message is relayed to every other member.
    Publish {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(with = "payload_bytes")]
        payload: Vec<u8>,
    },
    /// Node → endpoint: a session message addressed to you.
    Deliver {
        session_id: String,
        from: String,
        #[serde(with = "payload_bytes")]
        payload: Vec<u8>,
    },
    CloseSession { session_id: String },
    SessionClosed { session_id: String },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        message: String,
    },
}

mod payload_bytes {
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

/// Write one frame to the stream.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let body = serde_json::to_vec(frame).map_err(|e| Error::Transport(e.to_string()))?;
    if body.len() as u32 > MAX_FRAME_LEN {
        return Err(Error::Transport(format!(
            "frame of {} bytes exceeds limit",
            body.len()
        )));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `None` on a clean end-of-stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(Error::Decode(format!("frame length {len} exceeds limit")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let frame =
        serde_json::from_slice(&body).map_err(|e| Error::Decode(format!("invalid frame: {e}")))?;
    Ok(Some(frame))
}

/// Digest proving knowledge of the shared secret for an identity.
pub fn auth_digest(identity: &str, shared_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    hasher.update(b":");
    hasher.update(shared_secret.as_bytes());
    hex::encode(hasher.finalize())
}
