//! HTTP CONNECT frontend
//!
//! Parses a single `CONNECT host:port HTTP/1.1` request, opens a session for
//! the authority and, once the agent has dialed it, answers with the bare
//! `200 Connection established` line and hands the socket to [`pump`].

use crate::error::TunnelError;
use crate::registry::AgentRegistry;
use crate::session::pump;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Largest accepted request head
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// Written on success, with nothing after it before tunneled bytes
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// A parsed CONNECT request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    /// `host:port` from the request target
    pub authority: String,
    /// Length of the head including the terminating blank line
    pub head_len: usize,
}

/// Why a request head was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadError {
    /// Head is not complete yet
    Partial,
    /// Head exceeds [`MAX_HEAD_SIZE`]
    TooLarge,
    /// Valid HTTP, but not CONNECT
    MethodNotAllowed(String),
    Malformed(String),
}

impl HeadError {
    fn status_line(&self) -> &'static str {
        match self {
            HeadError::MethodNotAllowed(_) => "HTTP/1.1 405 Method Not Allowed",
            HeadError::TooLarge => "HTTP/1.1 431 Request Header Fields Too Large",
            HeadError::Partial | HeadError::Malformed(_) => "HTTP/1.1 400 Bad Request",
        }
    }
}

/// Parse a CONNECT request head from the start of `buf`
pub fn parse_connect_head(buf: &[u8]) -> Result<ConnectRequest, HeadError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);

    let head_len = match request.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) if buf.len() >= MAX_HEAD_SIZE => {
            return Err(HeadError::TooLarge)
        }
        Ok(httparse::Status::Partial) => return Err(HeadError::Partial),
        Err(e) => return Err(HeadError::Malformed(e.to_string())),
    };

    if head_len > MAX_HEAD_SIZE {
        return Err(HeadError::TooLarge);
    }

    let method = request.method.unwrap_or_default();
    if !method.eq_ignore_ascii_case("CONNECT") {
        return Err(HeadError::MethodNotAllowed(method.to_string()));
    }

    let authority = request.path.unwrap_or_default();
    validate_authority(authority)?;

    Ok(ConnectRequest {
        authority: authority.to_string(),
        head_len,
    })
}

/// CONNECT targets must be `host:port` with a numeric, non-zero port
fn validate_authority(authority: &str) -> Result<(), HeadError> {
    let Some((host, port)) = authority.rsplit_once(':') else {
        return Err(HeadError::Malformed(format!(
            "missing port in CONNECT target '{}'",
            authority
        )));
    };

    if host.is_empty() {
        return Err(HeadError::Malformed(format!(
            "missing host in CONNECT target '{}'",
            authority
        )));
    }

    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok(()),
        _ => Err(HeadError::Malformed(format!(
            "invalid port in CONNECT target '{}'",
            authority
        ))),
    }
}

/// Serve one CONNECT client connection
pub async fn handle_connect<S>(
    mut stream: S,
    peer_addr: SocketAddr,
    registry: Arc<AgentRegistry>,
    head_timeout: Duration,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let deadline = Instant::now() + head_timeout;

    // Read until the head is complete
    let request = loop {
        let mut chunk = [0u8; 1024];
        let n = match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(read) => read?,
            Err(_) => {
                warn!(
                    "CONNECT client {} sent no complete request within {:?}",
                    peer_addr, head_timeout
                );
                respond_error(&mut stream, "HTTP/1.1 408 Request Timeout").await;
                return Ok(());
            }
        };
        if n == 0 {
            debug!("CONNECT client {} closed before sending a request", peer_addr);
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);

        match parse_connect_head(&buf) {
            Ok(request) => break request,
            Err(HeadError::Partial) => continue,
            Err(e) => {
                warn!("Rejecting CONNECT request from {}: {:?}", peer_addr, e);
                respond_error(&mut stream, e.status_line()).await;
                return Ok(());
            }
        }
    };

    let target = request.authority.clone();
    // Anything the client pipelined after the head belongs to the tunnel
    let leftover = buf.split_off(request.head_len);

    let session = match open(&registry, &target).await {
        Ok(session) => session,
        Err(e) => {
            warn!("CONNECT {} from {} failed: {}", target, peer_addr, e);
            respond_error(&mut stream, failure_status(&e)).await;
            return Ok(());
        }
    };

    info!(
        connection_id = session.connection_id(),
        agent_id = %session.agent_id(),
        "CONNECT {} from {} established",
        target,
        peer_addr
    );

    stream.write_all(CONNECT_ESTABLISHED).await?;
    stream.flush().await?;

    if !leftover.is_empty() {
        session.send_data(leftover).await?;
    }

    pump(session, stream).await
}

async fn open(
    registry: &AgentRegistry,
    target: &str,
) -> Result<crate::session::Session, TunnelError> {
    let agent = registry.select()?;
    let pending = agent.open_session(target).await?;
    pending.established().await
}

fn failure_status(error: &TunnelError) -> &'static str {
    match error {
        TunnelError::NoAgentAvailable
        | TunnelError::DialFailed(_)
        | TunnelError::AgentLost
        | TunnelError::RemoteClosed(_) => "HTTP/1.1 502 Bad Gateway",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

async fn respond_error<S>(stream: &mut S, status_line: &str)
where
    S: AsyncWrite + Unpin,
{
    let response = format!(
        "{}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status_line
    );
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
}
