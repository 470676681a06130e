//! Server configuration

use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Proxy server configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address agents connect to
    pub agent_addr: SocketAddr,
    /// Streaming-tunnel frontend address (disabled if None)
    pub tunnel_addr: Option<SocketAddr>,
    /// HTTP CONNECT frontend address (disabled if None)
    pub connect_addr: Option<SocketAddr>,
    /// Frames queued per agent before senders block
    pub outbound_queue_depth: usize,
    /// Frames buffered per session towards the client
    pub session_buffer: usize,
    /// How long a session may stay pending
    #[serde(with = "backhaul_proto::duration_secs")]
    pub dial_timeout: Duration,
    /// Silence on a control stream after which the agent is dropped
    #[serde(with = "backhaul_proto::duration_secs")]
    pub idle_timeout: Duration,
    /// Time allowed for the registration handshake
    #[serde(with = "backhaul_proto::duration_secs")]
    pub handshake_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            agent_addr: SocketAddr::from(([0, 0, 0, 0], 8091)),
            tunnel_addr: Some(SocketAddr::from(([127, 0, 0, 1], 8090))),
            connect_addr: None,
            outbound_queue_depth: 256,
            session_buffer: 64,
            dial_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    pub(crate) fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            session_buffer: self.session_buffer.max(1),
            dial_timeout: self.dial_timeout,
        }
    }
}

/// Per-session knobs handed to every agent connection
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub session_buffer: usize,
    pub dial_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        ServerConfig::default().session_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.outbound_queue_depth, 256);
        assert_eq!(config.dial_timeout, Duration::from_secs(10));
        assert!(config.connect_addr.is_none());
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"agent_addr": "127.0.0.1:9000", "dial_timeout": 2.5, "connect_addr": "127.0.0.1:9002"}"#,
        )
        .unwrap();

        assert_eq!(config.agent_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.connect_addr, Some("127.0.0.1:9002".parse().unwrap()));
        assert_eq!(config.dial_timeout, Duration::from_millis(2500));
        // Untouched fields keep their defaults
        assert_eq!(config.session_buffer, 64);
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result: Result<ServerConfig, _> = serde_json::from_str(r#"{"idle_timeout": -1}"#);
        assert!(result.is_err());
    }
}
