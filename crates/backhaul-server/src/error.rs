//! Error taxonomy shared by the registry, multiplexer and frontends

use backhaul_proto::CodecError;
use thiserror::Error;

/// Errors surfaced to sessions and frontends
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Registry was empty at selection time
    #[error("No agent available")]
    NoAgentAvailable,

    /// The control stream to the owning agent terminated
    #[error("Agent connection lost")]
    AgentLost,

    /// The agent could not reach the requested target
    #[error("Dial failed: {0}")]
    DialFailed(String),

    /// Malformed or out-of-sequence frame
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Operation on a session that is no longer open
    #[error("Session closed")]
    SessionClosed,

    /// The agent closed the session because of a target-side error
    #[error("Closed by agent: {0}")]
    RemoteClosed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl TunnelError {
    /// True for errors caused by losing the agent control stream
    pub fn is_agent_lost(&self) -> bool {
        matches!(self, TunnelError::AgentLost)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TunnelError::NoAgentAvailable.to_string(), "No agent available");
        assert_eq!(
            TunnelError::DialFailed("connection refused".to_string()).to_string(),
            "Dial failed: connection refused"
        );
        assert!(TunnelError::AgentLost.is_agent_lost());
        assert!(!TunnelError::SessionClosed.is_agent_lost());
    }
}
