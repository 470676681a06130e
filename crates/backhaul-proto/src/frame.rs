//! Frame types carried on a control stream

use serde::{Deserialize, Serialize};

/// Identifies one session on a control stream.
///
/// Scoped to a single agent connection (or a single frontend client
/// connection); the value 0 is never allocated.
pub type ConnectionId = u64;

/// One discrete protocol message on a control stream
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Frame {
    // Registration (agent -> server, first frame on the stream)
    Register {
        agent_id: String,
        metadata: AgentMetadata,
    },
    Registered {
        agent_id: String,
    },
    Rejected {
        reason: String,
    },

    // Liveness
    Ping {
        timestamp: u64,
    },
    Pong {
        timestamp: u64,
    },
    Disconnect {
        reason: String,
    },

    // Session traffic
    /// Ask the peer to open a connection to `target_address` (host:port)
    DialRequest {
        connection_id: ConnectionId,
        target_address: String,
    },
    /// Outcome of a `DialRequest`
    DialResponse {
        connection_id: ConnectionId,
        ok: bool,
        #[serde(default)]
        error_message: Option<String>,
    },
    Data {
        connection_id: ConnectionId,
        #[serde(with = "serde_bytes")]
        payload: Vec<u8>,
    },
    /// Half-close is collapsed into a full close
    Close {
        connection_id: ConnectionId,
        #[serde(default)]
        error_message: Option<String>,
    },
}

impl Frame {
    pub fn dial_ok(connection_id: ConnectionId) -> Self {
        Frame::DialResponse {
            connection_id,
            ok: true,
            error_message: None,
        }
    }

    pub fn dial_failed(connection_id: ConnectionId, error: impl Into<String>) -> Self {
        Frame::DialResponse {
            connection_id,
            ok: false,
            error_message: Some(error.into()),
        }
    }

    pub fn data(connection_id: ConnectionId, payload: impl Into<Vec<u8>>) -> Self {
        Frame::Data {
            connection_id,
            payload: payload.into(),
        }
    }

    pub fn close(connection_id: ConnectionId, error_message: Option<String>) -> Self {
        Frame::Close {
            connection_id,
            error_message,
        }
    }

    /// The session this frame belongs to, if any
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Frame::DialRequest { connection_id, .. }
            | Frame::DialResponse { connection_id, .. }
            | Frame::Data { connection_id, .. }
            | Frame::Close { connection_id, .. } => Some(*connection_id),
            _ => None,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Register { .. } => "Register",
            Frame::Registered { .. } => "Registered",
            Frame::Rejected { .. } => "Rejected",
            Frame::Ping { .. } => "Ping",
            Frame::Pong { .. } => "Pong",
            Frame::Disconnect { .. } => "Disconnect",
            Frame::DialRequest { .. } => "DialRequest",
            Frame::DialResponse { .. } => "DialResponse",
            Frame::Data { .. } => "Data",
            Frame::Close { .. } => "Close",
        }
    }
}

// Payloads go through serialize_bytes rather than a per-element sequence
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}

/// Agent metadata announced during registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentMetadata {
    pub hostname: String,
    pub platform: String, // e.g., "linux", "macos", "windows"
    pub version: String,  // Agent software version
}

impl Default for AgentMetadata {
    fn default() -> Self {
        Self {
            hostname: hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
            platform: std::env::consts::OS.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_of_session_frames() {
        assert_eq!(Frame::data(7, b"x".to_vec()).connection_id(), Some(7));
        assert_eq!(Frame::close(3, None).connection_id(), Some(3));
        assert_eq!(Frame::dial_ok(9).connection_id(), Some(9));
        assert_eq!(Frame::Ping { timestamp: 1 }.connection_id(), None);
        assert_eq!(
            Frame::Register {
                agent_id: "a".to_string(),
                metadata: AgentMetadata::default(),
            }
            .connection_id(),
            None
        );
    }

    #[test]
    fn test_dial_failed_carries_message() {
        match Frame::dial_failed(4, "connection refused") {
            Frame::DialResponse {
                connection_id,
                ok,
                error_message,
            } => {
                assert_eq!(connection_id, 4);
                assert!(!ok);
                assert_eq!(error_message.as_deref(), Some("connection refused"));
            }
            other => panic!("Expected DialResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_default_metadata() {
        let metadata = AgentMetadata::default();
        assert!(!metadata.hostname.is_empty());
        assert_eq!(metadata.platform, std::env::consts::OS);
    }
}
