//! Streaming-tunnel frontend
//!
//! Clients speak the same frame protocol agents do, mirrored: the client
//! sends `DialRequest` with an ID of its choosing, the server answers with
//! `DialResponse` once an agent has dialed the target, and `Data`/`Close`
//! flow in both directions. Each logical dial becomes one session.

use crate::error::TunnelError;
use crate::registry::AgentRegistry;
use crate::session::{Session, SessionReader, SessionWriter};
use backhaul_proto::{ConnectionId, Frame, FrameCodec};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Frames queued towards one tunnel client
const CLIENT_QUEUE_DEPTH: usize = 256;

/// Client-side events routed to a session task
#[derive(Debug)]
enum ClientInput {
    Data(Vec<u8>),
    Close(Option<String>),
}

/// Serve one tunnel client connection until it closes
pub async fn serve_tunnel_client<S>(
    stream: S,
    peer_addr: SocketAddr,
    registry: Arc<AgentRegistry>,
) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    debug!("Tunnel client connected from {}", peer_addr);

    let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(CLIENT_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                debug!("Failed to write to tunnel client: {}", e);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let session_buffer = registry.settings().session_buffer;
    let mut routes: HashMap<ConnectionId, mpsc::Sender<ClientInput>> = HashMap::new();
    let mut tasks: JoinSet<ConnectionId> = JoinSet::new();

    let result = loop {
        tokio::select! {
            frame = frames.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => break Err(TunnelError::from(e)),
                    None => break Ok(()),
                };

                match frame {
                    Frame::DialRequest { connection_id, target_address } => {
                        let in_use = routes
                            .get(&connection_id)
                            .is_some_and(|route| !route.is_closed());
                        if connection_id == 0 || in_use {
                            warn!(
                                "Tunnel client {} reused connection id {}",
                                peer_addr, connection_id
                            );
                            let _ = out_tx
                                .send(Frame::dial_failed(connection_id, "connection id in use"))
                                .await;
                            continue;
                        }

                        let (input_tx, input_rx) = mpsc::channel(session_buffer);
                        routes.insert(connection_id, input_tx);

                        let registry = registry.clone();
                        let out_tx = out_tx.clone();
                        tasks.spawn(async move {
                            run_session(connection_id, target_address, registry, out_tx, input_rx)
                                .await;
                            connection_id
                        });
                    }

                    Frame::Data { connection_id, payload } => {
                        match routes.get(&connection_id) {
                            Some(route) => {
                                let _ = route.send(ClientInput::Data(payload)).await;
                            }
                            None => debug!(
                                "Data from tunnel client {} for unknown connection {}, dropping",
                                peer_addr, connection_id
                            ),
                        }
                    }

                    Frame::Close { connection_id, error_message } => {
                        // The ID stays taken until the session task lets go of it
                        if let Some(route) = routes.get(&connection_id) {
                            let _ = route.send(ClientInput::Close(error_message)).await;
                        }
                    }

                    Frame::Ping { timestamp } => {
                        let _ = out_tx.send(Frame::Pong { timestamp }).await;
                    }

                    other => {
                        warn!(
                            "Unexpected {} frame from tunnel client {}, dropping",
                            other.kind(),
                            peer_addr
                        );
                    }
                }
            }

            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Ok(connection_id) = joined {
                    // The ID may already belong to a newer dial
                    if routes.get(&connection_id).is_some_and(|route| route.is_closed()) {
                        routes.remove(&connection_id);
                    }
                }
            }
        }
    };

    // Dropping the routes closes every session still running
    routes.clear();
    while tasks.join_next().await.is_some() {}

    drop(out_tx);
    let _ = writer.await;

    debug!("Tunnel client {} disconnected", peer_addr);
    result
}

async fn run_session(
    connection_id: ConnectionId,
    target_address: String,
    registry: Arc<AgentRegistry>,
    out_tx: mpsc::Sender<Frame>,
    mut input: mpsc::Receiver<ClientInput>,
) {
    // Payload the client sent before the dial completed
    let mut early = Vec::new();
    let mut opening = Box::pin(open(&registry, &target_address));

    let session = loop {
        tokio::select! {
            result = &mut opening => match result {
                Ok(session) => break session,
                Err(e) => {
                    warn!("Tunnel dial to {} failed: {}", target_address, e);
                    drop(input);
                    let _ = out_tx
                        .send(Frame::dial_failed(connection_id, e.to_string()))
                        .await;
                    return;
                }
            },

            event = input.recv() => match event {
                Some(ClientInput::Data(payload)) => early.push(payload),
                Some(ClientInput::Close(_)) | None => {
                    debug!(
                        connection_id,
                        "Tunnel client abandoned dial to {}", target_address
                    );
                    // Free the ID only after the pending session is released
                    drop(opening);
                    drop(input);
                    return;
                }
            },
        }
    };
    drop(opening);

    info!(
        connection_id,
        session_id = session.connection_id(),
        agent_id = %session.agent_id(),
        "Tunnel session to {} established",
        target_address
    );

    if out_tx.send(Frame::dial_ok(connection_id)).await.is_err() {
        session.close(None).await;
        return;
    }

    let (mut reader, writer) = session.into_split();

    let mut last = None;
    for payload in early {
        if let Err(e) = writer.send_data(payload).await {
            last = Some(Frame::close(connection_id, Some(e.to_string())));
            break;
        }
    }
    if last.is_none() {
        last = relay(connection_id, &mut input, &mut reader, &writer, &out_tx).await;
    }

    // Release the ID before the client can learn the session is over
    drop(input);
    if let Some(frame) = last {
        let _ = out_tx.send(frame).await;
    }
}

/// Move bytes between the client and an established session.
///
/// Returns the frame to send the client once the session ends, if any.
async fn relay(
    connection_id: ConnectionId,
    input: &mut mpsc::Receiver<ClientInput>,
    reader: &mut SessionReader,
    writer: &SessionWriter,
    out_tx: &mpsc::Sender<Frame>,
) -> Option<Frame> {
    loop {
        tokio::select! {
            event = input.recv() => match event {
                Some(ClientInput::Data(payload)) => {
                    if let Err(e) = writer.send_data(payload).await {
                        return Some(Frame::close(connection_id, Some(e.to_string())));
                    }
                }
                Some(ClientInput::Close(reason)) => {
                    writer.close(reason).await;
                    return None;
                }
                None => {
                    writer.close(None).await;
                    return None;
                }
            },

            received = reader.recv() => match received {
                Ok(Some(payload)) => {
                    if out_tx.send(Frame::data(connection_id, payload)).await.is_err() {
                        writer.close(None).await;
                        return None;
                    }
                }
                Ok(None) => return Some(Frame::close(connection_id, None)),
                Err(e) => {
                    debug!(connection_id, "Tunnel session ended: {}", e);
                    return Some(Frame::close(connection_id, Some(e.to_string())));
                }
            },
        }
    }
}

async fn open(registry: &AgentRegistry, target: &str) -> Result<Session, TunnelError> {
    let agent = registry.select()?;
    let pending = agent.open_session(target).await?;
    pending.established().await
}
