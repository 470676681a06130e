//! Backhaul proxy server
//!
//! Routes client TCP connections through agents that sit inside a network the
//! server cannot reach directly.
//!
//! # Architecture
//!
//! - [`AgentRegistry`]: connected agents, readiness and round-robin selection
//! - [`AgentConnection`]: per-agent tunnel multiplexer (session table, frame dispatch)
//! - [`control`]: accepts agent control streams and runs their dispatch loops
//! - [`frontend`]: streaming-tunnel and HTTP CONNECT adapters
//! - [`ProxyServer`]: listeners and lifecycle

pub mod config;
pub mod control;
pub mod error;
pub mod frontend;
pub mod metrics;
pub mod multiplexer;
pub mod registry;
pub mod server;
pub mod session;

pub use config::{ServerConfig, SessionSettings};
pub use error::TunnelError;
pub use metrics::{Metrics, MetricsSnapshot};
pub use multiplexer::{AgentConnection, SessionState};
pub use registry::AgentRegistry;
pub use server::ProxyServer;
pub use session::{pump, PendingSession, Session, SessionEvent, SessionReader, SessionWriter};
