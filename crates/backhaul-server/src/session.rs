//! Session handles given to frontends
//!
//! A session is opened by [`AgentConnection::open_session`] and starts out as
//! a [`PendingSession`]. Once the agent reports a successful dial it becomes a
//! [`Session`], which can be used directly or split into a reader and writer.
//! Dropping the last handle closes the session on the agent.

use crate::error::TunnelError;
use crate::multiplexer::AgentConnection;
use backhaul_proto::ConnectionId;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Client-side read buffer used by [`pump`]
const PUMP_BUFFER_SIZE: usize = 16 * 1024;

/// Events routed from the dispatch loop to one session's consumer
#[derive(Debug)]
pub enum SessionEvent {
    Data(Vec<u8>),
    /// The agent closed the session, with an optional error
    Closed(Option<String>),
    /// The owning agent connection was torn down
    Lost,
}

/// Closes the session on drop
pub(crate) struct SessionGuard {
    agent: Arc<AgentConnection>,
    connection_id: ConnectionId,
    armed: bool,
}

impl SessionGuard {
    pub(crate) fn new(agent: Arc<AgentConnection>, connection_id: ConnectionId) -> Self {
        Self {
            agent,
            connection_id,
            armed: true,
        }
    }

    /// Drop without closing
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if self.armed {
            self.agent.close_session_detached(self.connection_id);
        }
    }
}

/// A session whose `DialRequest` has been queued but not answered yet
pub struct PendingSession {
    guard: SessionGuard,
    target_address: String,
    dial_rx: oneshot::Receiver<Result<(), TunnelError>>,
    events: mpsc::Receiver<SessionEvent>,
}

impl PendingSession {
    pub(crate) fn new(
        guard: SessionGuard,
        target_address: String,
        dial_rx: oneshot::Receiver<Result<(), TunnelError>>,
        events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        Self {
            guard,
            target_address,
            dial_rx,
            events,
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.guard.connection_id
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    /// The agent this session was opened on
    pub fn agent(&self) -> &Arc<AgentConnection> {
        &self.guard.agent
    }

    /// Wait for the agent's `DialResponse`.
    ///
    /// Fails with `DialFailed` if the agent reports an error or does not
    /// answer within the dial timeout, and with `AgentLost` if the agent
    /// goes away first.
    pub async fn established(self) -> Result<Session, TunnelError> {
        let PendingSession {
            guard,
            target_address,
            dial_rx,
            events,
        } = self;

        let dial_timeout = guard.agent.settings().dial_timeout;
        let connection_id = guard.connection_id;

        match tokio::time::timeout(dial_timeout, dial_rx).await {
            Ok(Ok(Ok(()))) => Ok(Session::new(guard, target_address, events)),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(_)) => Err(TunnelError::AgentLost),
            Err(_) => {
                warn!(
                    agent_id = %guard.agent.agent_id(),
                    connection_id,
                    target_address = %target_address,
                    timeout = ?dial_timeout,
                    "Dial timed out"
                );
                guard.agent.metrics().dial_failed();
                guard
                    .agent
                    .close_session(connection_id, Some("dial timed out".to_string()))
                    .await;
                Err(TunnelError::DialFailed(format!(
                    "no response from agent within {:?}",
                    dial_timeout
                )))
            }
        }
    }
}

/// An established session
pub struct Session {
    target_address: String,
    reader: SessionReader,
    writer: SessionWriter,
}

impl Session {
    fn new(
        guard: SessionGuard,
        target_address: String,
        events: mpsc::Receiver<SessionEvent>,
    ) -> Self {
        let guard = Arc::new(guard);
        Self {
            target_address,
            reader: SessionReader {
                guard: guard.clone(),
                events,
            },
            writer: SessionWriter { guard },
        }
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.writer.guard.connection_id
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }

    pub fn agent_id(&self) -> &str {
        self.writer.guard.agent.agent_id()
    }

    pub async fn send_data(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.writer.send_data(payload).await
    }

    /// Next payload from the target.
    ///
    /// `Ok(None)` means the agent closed the session cleanly.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TunnelError> {
        self.reader.recv().await
    }

    pub async fn close(self, reason: Option<String>) {
        self.writer.close(reason).await
    }

    pub fn into_split(self) -> (SessionReader, SessionWriter) {
        (self.reader, self.writer)
    }
}

/// Receiving half of a [`Session`]
pub struct SessionReader {
    guard: Arc<SessionGuard>,
    events: mpsc::Receiver<SessionEvent>,
}

impl SessionReader {
    pub fn connection_id(&self) -> ConnectionId {
        self.guard.connection_id
    }

    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, TunnelError> {
        match self.events.recv().await {
            Some(SessionEvent::Data(payload)) => Ok(Some(payload)),
            Some(SessionEvent::Closed(None)) => Ok(None),
            Some(SessionEvent::Closed(Some(message))) => Err(TunnelError::RemoteClosed(message)),
            Some(SessionEvent::Lost) => Err(TunnelError::AgentLost),
            None if self.guard.agent.is_lost() => Err(TunnelError::AgentLost),
            None => Ok(None),
        }
    }
}

/// Sending half of a [`Session`]
pub struct SessionWriter {
    guard: Arc<SessionGuard>,
}

impl SessionWriter {
    pub fn connection_id(&self) -> ConnectionId {
        self.guard.connection_id
    }

    pub async fn send_data(&self, payload: Vec<u8>) -> Result<(), TunnelError> {
        self.guard
            .agent
            .send_data(self.guard.connection_id, payload)
            .await
    }

    /// Close the session. Idempotent.
    pub async fn close(&self, reason: Option<String>) {
        self.guard
            .agent
            .close_session(self.guard.connection_id, reason)
            .await
    }
}

/// Copy bytes between `client` and `session` until either side ends.
///
/// The session is closed on return. Losing the agent is reported as
/// `AgentLost` so the caller can drop the client connection hard.
pub async fn pump<S>(session: Session, client: S) -> Result<(), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connection_id = session.connection_id();
    let (mut reader, writer) = session.into_split();
    let (mut client_read, mut client_write) = tokio::io::split(client);

    let upstream = async {
        let mut buf = vec![0u8; PUMP_BUFFER_SIZE];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                debug!(connection_id, "Client closed connection");
                return Ok::<(), TunnelError>(());
            }
            writer.send_data(buf[..n].to_vec()).await?;
        }
    };

    let downstream = async {
        loop {
            match reader.recv().await? {
                Some(payload) => client_write.write_all(&payload).await?,
                None => {
                    debug!(connection_id, "Agent closed session");
                    let _ = client_write.shutdown().await;
                    return Ok::<(), TunnelError>(());
                }
            }
        }
    };

    let result = tokio::select! {
        r = upstream => r,
        r = downstream => r,
    };

    let reason = match &result {
        Err(e) if !e.is_agent_lost() => Some(e.to_string()),
        _ => None,
    };
    writer.close(reason).await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionSettings;
    use crate::metrics::Metrics;
    use backhaul_proto::{AgentMetadata, Frame};
    use std::time::Duration;

    fn connection(dial_timeout: Duration) -> (Arc<AgentConnection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = AgentConnection::new(
            "agent-1".to_string(),
            1,
            AgentMetadata::default(),
            tx,
            SessionSettings {
                session_buffer: 8,
                dial_timeout,
            },
            Arc::new(Metrics::new()),
        );
        (Arc::new(conn), rx)
    }

    async fn established(
        conn: &Arc<AgentConnection>,
        rx: &mut mpsc::Receiver<Frame>,
    ) -> Session {
        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = pending.connection_id();
        assert!(matches!(
            rx.recv().await.unwrap(),
            Frame::DialRequest { .. }
        ));
        conn.on_frame(Frame::dial_ok(id)).await;
        pending.established().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_timeout_closes_session() {
        let (conn, mut rx) = connection(Duration::from_secs(2));

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = pending.connection_id();
        let _ = rx.recv().await.unwrap();

        let result = pending.established().await;
        assert!(matches!(result, Err(TunnelError::DialFailed(_))));
        assert_eq!(conn.session_count(), 0);

        match rx.recv().await.unwrap() {
            Frame::Close {
                connection_id,
                error_message,
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(error_message.as_deref(), Some("dial timed out"));
            }
            other => panic!("Expected Close, got {:?}", other),
        }
        assert_eq!(conn.metrics().snapshot().dial_failures, 1);
    }

    #[tokio::test]
    async fn test_remote_close_with_error() {
        let (conn, mut rx) = connection(Duration::from_secs(5));
        let mut session = established(&conn, &mut rx).await;

        conn.on_frame(Frame::close(
            session.connection_id(),
            Some("connection reset by target".to_string()),
        ))
        .await;

        match session.recv().await {
            Err(TunnelError::RemoteClosed(message)) => {
                assert_eq!(message, "connection reset by target")
            }
            other => panic!("Expected RemoteClosed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_split_halves_share_one_close() {
        let (conn, mut rx) = connection(Duration::from_secs(5));
        let session = established(&conn, &mut rx).await;
        let id = session.connection_id();

        let (reader, writer) = session.into_split();
        drop(reader);
        // Writer still holds the session open
        assert_eq!(conn.session_count(), 1);
        writer.send_data(b"abc".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Frame::data(id, b"abc".to_vec()));

        drop(writer);
        assert_eq!(rx.recv().await.unwrap(), Frame::close(id, None));
    }

    #[tokio::test]
    async fn test_pump_forwards_both_directions() {
        let (conn, mut rx) = connection(Duration::from_secs(5));
        let session = established(&conn, &mut rx).await;
        let id = session.connection_id();

        let (mut client, server_side) = tokio::io::duplex(1024);
        let pump_task = tokio::spawn(pump(session, server_side));

        client.write_all(b"request").await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            Frame::data(id, b"request".to_vec())
        );

        conn.on_frame(Frame::data(id, b"response".to_vec())).await;
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        // Agent closes, client sees EOF
        conn.on_frame(Frame::close(id, None)).await;
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        pump_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_pump_reports_agent_lost() {
        let (conn, mut rx) = connection(Duration::from_secs(5));
        let session = established(&conn, &mut rx).await;

        let (_client, server_side) = tokio::io::duplex(1024);
        let pump_task = tokio::spawn(pump(session, server_side));

        conn.teardown();

        let result = pump_task.await.unwrap();
        assert!(matches!(result, Err(TunnelError::AgentLost)));
    }
}
