use backhaul_proto::CodecError;
use std::time::Duration;
use thiserror::Error;

/// Errors returned by the tunnel client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("Tunnel connection closed")]
    TunnelClosed,

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Proxy refused CONNECT: {status} {reason}")]
    ProxyRejected { status: u16, reason: String },

    #[error("Invalid proxy response: {0}")]
    InvalidResponse(String),
}
