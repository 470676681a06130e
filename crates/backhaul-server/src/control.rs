//! Agent control endpoint
//!
//! Accepts one agent control stream, performs the registration handshake and
//! runs the per-agent dispatch loop until the stream ends.

use crate::config::ServerConfig;
use crate::error::TunnelError;
use crate::multiplexer::AgentConnection;
use crate::registry::AgentRegistry;
use backhaul_proto::{AgentMetadata, Frame, FrameCodec, PROTOCOL_VERSION};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::ops::ControlFlow;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// Serve one agent control stream to completion.
///
/// Returns once the stream is closed and the agent has been removed from
/// the registry.
pub async fn serve_agent<S>(
    stream: S,
    peer_addr: SocketAddr,
    registry: Arc<AgentRegistry>,
    config: ServerConfig,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut framed = Framed::new(stream, FrameCodec::new());

    let (agent_id, metadata) = match handshake(&mut framed, peer_addr, &config).await? {
        Some(registration) => registration,
        None => return Ok(()),
    };

    let (mut sink, mut frames) = framed.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Frame>(config.outbound_queue_depth.max(1));

    // Queued ahead of any DialRequest the registry may hand out
    outbound_tx
        .send(Frame::Registered {
            agent_id: agent_id.clone(),
        })
        .await
        .map_err(|_| TunnelError::AgentLost)?;

    let connection = registry.register(&agent_id, metadata, outbound_tx);
    let token = connection.shutdown_token().clone();

    // Drain task: the only writer on the control stream
    let drain = {
        let token = token.clone();
        let agent_id = agent_id.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            warn!("Failed to write to agent {}: {}", agent_id, e);
                            token.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        })
    };

    let reason = read_loop(&connection, &mut frames, &config).await;
    info!(
        "Agent {} control stream from {} ended: {}",
        agent_id, peer_addr, reason
    );

    registry.unregister_connection(&connection);
    let _ = drain.await;

    Ok(())
}

/// Read the agent's `Register` frame and answer `Rejected` on mismatch
async fn handshake<S>(
    framed: &mut Framed<S, FrameCodec>,
    peer_addr: SocketAddr,
    config: &ServerConfig,
) -> Result<Option<(String, AgentMetadata)>, TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let first = match tokio::time::timeout(config.handshake_timeout, framed.next()).await {
        Ok(Some(frame)) => frame?,
        Ok(None) => {
            debug!("Connection from {} closed before registering", peer_addr);
            return Ok(None);
        }
        Err(_) => {
            warn!(
                "Agent at {} did not register within {:?}",
                peer_addr, config.handshake_timeout
            );
            return Ok(None);
        }
    };

    match first {
        Frame::Register { agent_id, metadata } if !agent_id.is_empty() => {
            info!(
                agent_id = %agent_id,
                hostname = %metadata.hostname,
                platform = %metadata.platform,
                version = %metadata.version,
                peer = %peer_addr,
                "Agent registration (protocol v{})",
                PROTOCOL_VERSION
            );
            Ok(Some((agent_id, metadata)))
        }
        Frame::Register { .. } => {
            warn!("Agent at {} registered with an empty ID", peer_addr);
            reject(framed, "agent_id must not be empty").await?;
            Ok(None)
        }
        other => {
            error!(
                "Unexpected first frame from {}: {}",
                peer_addr,
                other.kind()
            );
            reject(framed, "Expected Register as first frame").await?;
            Err(TunnelError::ProtocolError(format!(
                "expected Register, got {}",
                other.kind()
            )))
        }
    }
}

async fn reject<S>(framed: &mut Framed<S, FrameCodec>, reason: &str) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed
        .send(Frame::Rejected {
            reason: reason.to_string(),
        })
        .await?;
    Ok(())
}

/// Dispatch frames until the stream ends, the agent disconnects, the
/// connection is torn down or the idle timeout fires. Returns why.
async fn read_loop<St>(
    connection: &Arc<AgentConnection>,
    frames: &mut St,
    config: &ServerConfig,
) -> String
where
    St: futures::Stream<Item = Result<Frame, backhaul_proto::CodecError>> + Unpin,
{
    let token = connection.shutdown_token().clone();

    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return "connection torn down".to_string(),
            next = tokio::time::timeout(config.idle_timeout, frames.next()) => next,
        };

        match next {
            Ok(Some(Ok(frame))) => {
                if let ControlFlow::Break(reason) = connection.on_frame(frame).await {
                    return format!("agent disconnected ({})", reason);
                }
            }
            Ok(Some(Err(e))) => {
                // Stream is desynchronized, nothing after this can be trusted
                error!(
                    "Protocol error on control stream of agent {}: {}",
                    connection.agent_id(),
                    e
                );
                return format!("protocol error: {}", e);
            }
            Ok(None) => return "stream closed".to_string(),
            Err(_) => {
                warn!(
                    "Agent {} idle for {:?}, dropping",
                    connection.agent_id(),
                    config.idle_timeout
                );
                return "idle timeout".to_string();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn config() -> ServerConfig {
        ServerConfig {
            handshake_timeout: Duration::from_secs(1),
            ..ServerConfig::default()
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_register_and_disconnect() {
        let registry = Arc::new(AgentRegistry::default());
        let (agent_side, server_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(serve_agent(server_side, peer(), registry.clone(), config()));

        let mut agent = Framed::new(agent_side, FrameCodec::new());
        agent
            .send(Frame::Register {
                agent_id: "agent-1".to_string(),
                metadata: AgentMetadata::default(),
            })
            .await
            .unwrap();

        assert_eq!(
            agent.next().await.unwrap().unwrap(),
            Frame::Registered {
                agent_id: "agent-1".to_string()
            }
        );
        assert!(registry.wait_ready(true, Duration::from_secs(1)).await);

        agent
            .send(Frame::Disconnect {
                reason: "bye".to_string(),
            })
            .await
            .unwrap();

        server.await.unwrap().unwrap();
        assert!(!registry.ready());
    }

    #[tokio::test]
    async fn test_first_frame_must_be_register() {
        let registry = Arc::new(AgentRegistry::default());
        let (agent_side, server_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(serve_agent(server_side, peer(), registry.clone(), config()));

        let mut agent = Framed::new(agent_side, FrameCodec::new());
        agent.send(Frame::Ping { timestamp: 1 }).await.unwrap();

        assert!(matches!(
            agent.next().await.unwrap().unwrap(),
            Frame::Rejected { .. }
        ));
        assert!(matches!(
            server.await.unwrap(),
            Err(TunnelError::ProtocolError(_))
        ));
        assert!(!registry.ready());
    }

    #[tokio::test]
    async fn test_stream_loss_fails_sessions() {
        let registry = Arc::new(AgentRegistry::default());
        let (agent_side, server_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(serve_agent(server_side, peer(), registry.clone(), config()));

        let mut agent = Framed::new(agent_side, FrameCodec::new());
        agent
            .send(Frame::Register {
                agent_id: "agent-1".to_string(),
                metadata: AgentMetadata::default(),
            })
            .await
            .unwrap();
        let _registered = agent.next().await.unwrap().unwrap();

        let connection = registry.select().unwrap();
        let pending = connection.open_session("10.0.0.1:80").await.unwrap();

        let connection_id = match agent.next().await.unwrap().unwrap() {
            Frame::DialRequest { connection_id, .. } => connection_id,
            other => panic!("Expected DialRequest, got {:?}", other),
        };
        agent.send(Frame::dial_ok(connection_id)).await.unwrap();
        let mut session = pending.established().await.unwrap();

        // Simulated agent crash
        drop(agent);

        assert!(matches!(session.recv().await, Err(TunnelError::AgentLost)));
        server.await.unwrap().unwrap();
        assert!(!registry.ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_agent_is_dropped() {
        let registry = Arc::new(AgentRegistry::default());
        let (agent_side, server_side) = tokio::io::duplex(64 * 1024);
        let config = ServerConfig {
            idle_timeout: Duration::from_secs(30),
            ..config()
        };

        let server = tokio::spawn(serve_agent(server_side, peer(), registry.clone(), config));

        let mut agent = Framed::new(agent_side, FrameCodec::new());
        agent
            .send(Frame::Register {
                agent_id: "agent-1".to_string(),
                metadata: AgentMetadata::default(),
            })
            .await
            .unwrap();
        let _registered = agent.next().await.unwrap().unwrap();

        server.await.unwrap().unwrap();
        assert!(!registry.ready());
    }
    #[tokio::test]
    async fn test_protocol_error_drops_agent() {
        let registry = Arc::new(AgentRegistry::default());
        let (agent_side, server_side) = tokio::io::duplex(64 * 1024);

        let server = tokio::spawn(serve_agent(server_side, peer(), registry.clone(), config()));

        let mut agent = Framed::new(agent_side, FrameCodec::new());
        agent
            .send(Frame::Register {
                agent_id: "agent-1".to_string(),
                metadata: AgentMetadata::default(),
            })
            .await
            .unwrap();
        let _registered = agent.next().await.unwrap().unwrap();

        let connection = registry.select().unwrap();
        let pending = connection.open_session("10.0.0.1:80").await.unwrap();
        let connection_id = match agent.next().await.unwrap().unwrap() {
            Frame::DialRequest { connection_id, .. } => connection_id,
            other => panic!("Expected DialRequest, got {:?}", other),
        };
        agent.send(Frame::dial_ok(connection_id)).await.unwrap();
        let mut session = pending.established().await.unwrap();

        // Length header far beyond the frame limit; the stream itself stays open
        agent
            .get_mut()
            .write_all(&u32::MAX.to_be_bytes())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("control stream was not closed")
            .unwrap()
            .unwrap();
        assert!(!registry.ready());
        assert!(matches!(session.recv().await, Err(TunnelError::AgentLost)));
        assert_eq!(registry.metrics().snapshot().sessions_lost, 1);
    }
}
