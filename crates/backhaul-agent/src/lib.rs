//! Backhaul Agent - runs inside the remote network and dials targets on the
//! proxy server's behalf
//!
//! # Architecture
//!
//! 1. **Connect**: open a control stream to the server and send `Register`
//! 2. **Serve**: answer `DialRequest` frames with real outbound TCP dials
//! 3. **Forward**: pump bytes between each target socket and the control stream
//! 4. **Reconnect**: on loss, close every local connection and reconnect with
//!    exponential backoff; nothing is resumed across control streams
//!
//! # Example Usage
//!
//! ```no_run
//! use backhaul_agent::{Agent, AgentConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig {
//!         agent_id: "edge-1".to_string(),
//!         server_addr: "proxy.example.com:8091".to_string(),
//!         ..AgentConfig::default()
//!     };
//!
//!     let agent = Agent::new(config)?;
//!     agent.run(CancellationToken::new()).await?;
//!
//!     Ok(())
//! }
//! ```

mod agent;
mod allowlist;
mod connection;
mod forwarder;
mod reconnect;

pub use agent::{Agent, AgentConfig, AgentError, AgentState};
pub use allowlist::{Allowlist, AllowlistConfig, AllowlistError};
pub use connection::{ConnectionInfo, ConnectionTable};
pub use forwarder::{ForwardStats, ForwarderError, TcpForwarder};
pub use reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
