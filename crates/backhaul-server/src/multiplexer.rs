//! Tunnel multiplexer
//!
//! Turns one agent's control stream into many independent byte pipes.
//! Every [`AgentConnection`] owns a session table keyed by [`ConnectionId`];
//! frames arriving from the agent are routed through [`AgentConnection::on_frame`]
//! and frames leaving for the agent go through a bounded outbound queue that
//! a single drain task writes to the stream.

use crate::config::SessionSettings;
use crate::error::TunnelError;
use crate::metrics::Metrics;
use crate::session::{PendingSession, SessionEvent, SessionGuard};
use backhaul_proto::{AgentMetadata, ConnectionId, Frame};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Session lifecycle
///
/// Only `Pending`, `Established` and `Closing` are observable through
/// [`AgentConnection::session_state`]; `Closed` and `Failed` are terminal and
/// reported in logs as the session leaves the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Established,
    /// `Close` is being sent to the agent
    Closing,
    Closed,
    Failed,
}

struct SessionEntry {
    state: SessionState,
    target_address: String,
    dial_tx: Option<oneshot::Sender<Result<(), TunnelError>>>,
    events: mpsc::Sender<SessionEvent>,
}

struct SessionTable {
    next_id: ConnectionId,
    entries: HashMap<ConnectionId, SessionEntry>,
}

impl SessionTable {
    fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    /// Allocate the next free connection ID (0 is never handed out)
    fn allocate(&mut self) -> ConnectionId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1).max(1);
            if !self.entries.contains_key(&id) {
                return id;
            }
        }
    }
}

/// One currently connected agent
pub struct AgentConnection {
    agent_id: String,
    instance: u64,
    metadata: AgentMetadata,
    connected_at: chrono::DateTime<chrono::Utc>,
    outbound: mpsc::Sender<Frame>,
    sessions: Mutex<SessionTable>,
    lost: AtomicBool,
    shutdown: CancellationToken,
    settings: SessionSettings,
    metrics: Arc<Metrics>,
}

impl std::fmt::Debug for AgentConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConnection")
            .field("agent_id", &self.agent_id)
            .field("instance", &self.instance)
            .field("lost", &self.is_lost())
            .finish()
    }
}

impl AgentConnection {
    pub(crate) fn new(
        agent_id: String,
        instance: u64,
        metadata: AgentMetadata,
        outbound: mpsc::Sender<Frame>,
        settings: SessionSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            agent_id,
            instance,
            metadata,
            connected_at: chrono::Utc::now(),
            outbound,
            sessions: Mutex::new(SessionTable::new()),
            lost: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            settings,
            metrics,
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Distinguishes successive registrations of the same agent ID
    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    pub fn connected_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.connected_at
    }

    /// True once the control stream has been torn down
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Resolves when the connection is torn down
    pub fn closed(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.shutdown.cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub(crate) fn settings(&self) -> SessionSettings {
        self.settings
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Number of sessions currently tracked (pending or established)
    pub fn session_count(&self) -> usize {
        self.table().entries.len()
    }

    pub fn session_state(&self, connection_id: ConnectionId) -> Option<SessionState> {
        self.table()
            .entries
            .get(&connection_id)
            .map(|entry| entry.state)
    }

    fn table(&self) -> MutexGuard<'_, SessionTable> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a session and ask the agent to dial `target_address`.
    ///
    /// Returns as soon as the `DialRequest` is queued; the dial outcome is
    /// delivered through [`PendingSession::established`]. Waits only if the
    /// outbound queue is full.
    pub async fn open_session(
        self: &Arc<Self>,
        target_address: &str,
    ) -> Result<PendingSession, TunnelError> {
        if self.is_lost() {
            return Err(TunnelError::AgentLost);
        }

        let (dial_tx, dial_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(self.settings.session_buffer);

        let connection_id = {
            let mut table = self.table();
            // Teardown marks the connection lost before draining under this lock
            if self.is_lost() {
                return Err(TunnelError::AgentLost);
            }
            let id = table.allocate();
            table.entries.insert(
                id,
                SessionEntry {
                    state: SessionState::Pending,
                    target_address: target_address.to_string(),
                    dial_tx: Some(dial_tx),
                    events: events_tx,
                },
            );
            id
        };
        self.metrics.session_opened();

        debug!(
            agent_id = %self.agent_id,
            connection_id,
            target_address = %target_address,
            "Opening session"
        );

        let guard = SessionGuard::new(self.clone(), connection_id);

        let request = Frame::DialRequest {
            connection_id,
            target_address: target_address.to_string(),
        };
        if self.outbound.send(request).await.is_err() {
            // Drain task is gone, the connection is being torn down
            self.remove_session(connection_id);
            guard.disarm();
            return Err(TunnelError::AgentLost);
        }

        Ok(PendingSession::new(
            guard,
            target_address.to_string(),
            dial_rx,
            events_rx,
        ))
    }

    /// Queue payload bytes for an established session.
    ///
    /// Blocks while the outbound queue is full; data is never dropped.
    pub async fn send_data(
        &self,
        connection_id: ConnectionId,
        payload: Vec<u8>,
    ) -> Result<(), TunnelError> {
        if self.is_lost() {
            return Err(TunnelError::AgentLost);
        }

        match self.session_state(connection_id) {
            Some(SessionState::Established) => {}
            Some(_) | None => return Err(TunnelError::SessionClosed),
        }

        let len = payload.len();
        self.outbound
            .send(Frame::data(connection_id, payload))
            .await
            .map_err(|_| TunnelError::AgentLost)?;
        self.metrics.bytes_to_agent(len);

        trace!(
            agent_id = %self.agent_id,
            connection_id,
            bytes = len,
            "Queued data for agent"
        );
        Ok(())
    }

    /// Close a session. Idempotent.
    ///
    /// Sends `Close` to the agent if the control stream is still open and the
    /// session was still known.
    pub async fn close_session(&self, connection_id: ConnectionId, reason: Option<String>) {
        if !self.begin_close(connection_id) {
            return;
        }

        if !self.is_lost() {
            debug!(
                agent_id = %self.agent_id,
                connection_id,
                reason = ?reason,
                "Closing session"
            );
            let _ = self
                .outbound
                .send(Frame::close(connection_id, reason))
                .await;
        }

        self.remove_session(connection_id);
    }

    /// Move a session to `Closing`; false if it is unknown or already closing
    fn begin_close(&self, connection_id: ConnectionId) -> bool {
        let mut table = self.table();
        match table.entries.get_mut(&connection_id) {
            Some(entry) if entry.state != SessionState::Closing => {
                entry.state = SessionState::Closing;
                true
            }
            _ => false,
        }
    }

    /// Non-async variant of [`close_session`](Self::close_session) used from `Drop`
    pub(crate) fn close_session_detached(&self, connection_id: ConnectionId) {
        let Some(entry) = self.remove_session(connection_id) else {
            return;
        };
        // A close_session already owns sending the Close frame
        if entry.state == SessionState::Closing || self.is_lost() {
            return;
        }

        let frame = Frame::close(connection_id, None);
        match self.outbound.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(frame)) => {
                // Never block inside Drop
                let outbound = self.outbound.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn remove_session(&self, connection_id: ConnectionId) -> Option<SessionEntry> {
        let removed = self.table().entries.remove(&connection_id);
        if removed.is_some() {
            self.metrics.sessions_released(1);
        }
        removed
    }

    /// Demultiplex one frame received from the agent.
    ///
    /// Returns `Break` when the agent asked to end the control stream.
    pub async fn on_frame(&self, frame: Frame) -> ControlFlow<String> {
        match frame {
            Frame::DialResponse {
                connection_id,
                ok,
                error_message,
            } => self.on_dial_response(connection_id, ok, error_message),

            Frame::Data {
                connection_id,
                payload,
            } => self.on_data(connection_id, payload).await,

            Frame::Close {
                connection_id,
                error_message,
            } => self.on_close(connection_id, error_message).await,

            Frame::Ping { timestamp } => {
                trace!(agent_id = %self.agent_id, timestamp, "Ping from agent");
                let _ = self.outbound.send(Frame::Pong { timestamp }).await;
            }

            Frame::Pong { timestamp } => {
                trace!(agent_id = %self.agent_id, timestamp, "Pong from agent");
            }

            Frame::Disconnect { reason } => {
                info!(agent_id = %self.agent_id, reason = %reason, "Agent disconnecting");
                return ControlFlow::Break(reason);
            }

            other => {
                warn!(
                    agent_id = %self.agent_id,
                    frame = other.kind(),
                    "Unexpected frame from agent, dropping"
                );
                self.metrics.frame_dropped();
            }
        }

        ControlFlow::Continue(())
    }

    fn on_dial_response(
        &self,
        connection_id: ConnectionId,
        ok: bool,
        error_message: Option<String>,
    ) {
        let mut table = self.table();

        let Some(entry) = table.entries.get_mut(&connection_id) else {
            drop(table);
            debug!(
                agent_id = %self.agent_id,
                connection_id,
                "DialResponse for unknown session, dropping"
            );
            self.metrics.frame_dropped();
            return;
        };

        if entry.state != SessionState::Pending {
            let state = entry.state;
            drop(table);
            warn!(
                agent_id = %self.agent_id,
                connection_id,
                state = ?state,
                "DialResponse for session that is not pending, dropping"
            );
            self.metrics.frame_dropped();
            return;
        }

        if ok {
            entry.state = SessionState::Established;
            let dial_tx = entry.dial_tx.take();
            let target = entry.target_address.clone();
            drop(table);

            debug!(
                agent_id = %self.agent_id,
                connection_id,
                target_address = %target,
                "Session established"
            );
            if let Some(dial_tx) = dial_tx {
                let _ = dial_tx.send(Ok(()));
            }
        } else {
            let entry = table.entries.remove(&connection_id);
            drop(table);
            self.metrics.sessions_released(1);
            self.metrics.dial_failed();

            let message = error_message.unwrap_or_else(|| "dial failed".to_string());
            if let Some(mut entry) = entry {
                warn!(
                    agent_id = %self.agent_id,
                    connection_id,
                    target_address = %entry.target_address,
                    error = %message,
                    "Agent failed to dial target"
                );
                if let Some(dial_tx) = entry.dial_tx.take() {
                    let _ = dial_tx.send(Err(TunnelError::DialFailed(message)));
                }
            }
        }
    }

    async fn on_data(&self, connection_id: ConnectionId, payload: Vec<u8>) {
        let events = {
            let table = self.table();
            match table.entries.get(&connection_id) {
                Some(entry) if entry.state == SessionState::Established => {
                    Some(entry.events.clone())
                }
                Some(entry) => {
                    warn!(
                        agent_id = %self.agent_id,
                        connection_id,
                        state = ?entry.state,
                        "Data for session that is not established, dropping"
                    );
                    None
                }
                None => {
                    debug!(
                        agent_id = %self.agent_id,
                        connection_id,
                        "Data for unknown session, dropping"
                    );
                    None
                }
            }
        };

        let Some(events) = events else {
            self.metrics.frame_dropped();
            return;
        };

        let len = payload.len();
        // Waits while the session's consumer is behind
        if events.send(SessionEvent::Data(payload)).await.is_err() {
            debug!(
                agent_id = %self.agent_id,
                connection_id,
                "Session consumer gone, dropping data"
            );
            self.metrics.frame_dropped();
            return;
        }
        self.metrics.bytes_from_agent(len);
    }

    async fn on_close(&self, connection_id: ConnectionId, error_message: Option<String>) {
        let Some(mut entry) = self.remove_session(connection_id) else {
            debug!(
                agent_id = %self.agent_id,
                connection_id,
                "Close for unknown session, dropping"
            );
            return;
        };

        let outcome = if entry.dial_tx.is_some() {
            SessionState::Failed
        } else {
            SessionState::Closed
        };
        debug!(
            agent_id = %self.agent_id,
            connection_id,
            state = ?outcome,
            reason = ?error_message,
            "Session closed by agent"
        );

        if let Some(dial_tx) = entry.dial_tx.take() {
            self.metrics.dial_failed();
            let message = error_message.unwrap_or_else(|| "closed by agent".to_string());
            let _ = dial_tx.send(Err(TunnelError::DialFailed(message)));
        } else {
            let _ = entry.events.send(SessionEvent::Closed(error_message)).await;
        }
    }

    /// Fail every session with `AgentLost` and stop the connection's tasks.
    ///
    /// Called by the registry while the agent is being removed, so no
    /// session can be opened on this connection afterwards.
    pub(crate) fn teardown(&self) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.cancel();

        let entries: Vec<(ConnectionId, SessionEntry)> = self.table().entries.drain().collect();
        let count = entries.len();

        for (connection_id, mut entry) in entries {
            trace!(
                agent_id = %self.agent_id,
                connection_id,
                target_address = %entry.target_address,
                state = ?SessionState::Failed,
                "Failing session, agent lost"
            );
            if let Some(dial_tx) = entry.dial_tx.take() {
                let _ = dial_tx.send(Err(TunnelError::AgentLost));
            } else {
                // If the buffer is full the dropped sender still reads as lost
                let _ = entry.events.try_send(SessionEvent::Lost);
            }
        }

        self.metrics.sessions_released(count);
        self.metrics.sessions_lost(count);

        info!(
            agent_id = %self.agent_id,
            instance = self.instance,
            failed_sessions = count,
            "Agent connection torn down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    fn connection(queue: usize) -> (Arc<AgentConnection>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(queue);
        let conn = AgentConnection::new(
            "agent-1".to_string(),
            1,
            AgentMetadata::default(),
            tx,
            SessionSettings {
                session_buffer: 8,
                dial_timeout: Duration::from_secs(5),
            },
            Arc::new(Metrics::new()),
        );
        (Arc::new(conn), rx)
    }

    async fn expect_dial_request(rx: &mut mpsc::Receiver<Frame>) -> ConnectionId {
        match rx.recv().await.unwrap() {
            Frame::DialRequest { connection_id, .. } => connection_id,
            other => panic!("Expected DialRequest, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_open_session_queues_dial_request() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        match rx.recv().await.unwrap() {
            Frame::DialRequest {
                connection_id,
                target_address,
            } => {
                assert_eq!(connection_id, pending.connection_id());
                assert_eq!(target_address, "10.0.0.1:80");
            }
            other => panic!("Expected DialRequest, got {:?}", other),
        }
        assert_eq!(
            conn.session_state(pending.connection_id()),
            Some(SessionState::Pending)
        );
    }

    #[tokio::test]
    async fn test_connection_ids_are_distinct_and_nonzero() {
        let (conn, _rx) = connection(64);

        let mut pending = Vec::new();
        for _ in 0..32 {
            pending.push(conn.open_session("10.0.0.1:80").await.unwrap());
        }

        let ids: HashSet<ConnectionId> = pending.iter().map(|p| p.connection_id()).collect();
        assert_eq!(ids.len(), 32);
        assert!(!ids.contains(&0));
    }

    #[tokio::test]
    async fn test_dial_ok_establishes_session_and_routes_data() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;

        assert!(conn.on_frame(Frame::dial_ok(id)).await.is_continue());
        let mut session = pending.established().await.unwrap();
        assert_eq!(conn.session_state(id), Some(SessionState::Established));

        conn.on_frame(Frame::data(id, b"hello".to_vec())).await;
        assert_eq!(session.recv().await.unwrap(), Some(b"hello".to_vec()));

        session.send_data(b"ping".to_vec()).await.unwrap();
        match rx.recv().await.unwrap() {
            Frame::Data {
                connection_id,
                payload,
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(payload, b"ping");
            }
            other => panic!("Expected Data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dial_error_fails_session() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:81").await.unwrap();
        let id = expect_dial_request(&mut rx).await;

        conn.on_frame(Frame::dial_failed(id, "connection refused"))
            .await;

        match pending.established().await {
            Err(TunnelError::DialFailed(message)) => assert_eq!(message, "connection refused"),
            other => panic!("Expected DialFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(conn.session_count(), 0);
    }

    #[tokio::test]
    async fn test_frames_for_unknown_sessions_are_dropped() {
        let (conn, _rx) = connection(8);

        assert!(conn.on_frame(Frame::data(99, b"x".to_vec())).await.is_continue());
        assert!(conn.on_frame(Frame::close(99, None)).await.is_continue());
        assert!(conn.on_frame(Frame::dial_ok(99)).await.is_continue());
        assert_eq!(conn.metrics.snapshot().frames_dropped, 2);
    }

    #[tokio::test]
    async fn test_data_before_dial_response_is_dropped() {
        let (conn, mut rx) = connection(8);

        let _pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;

        conn.on_frame(Frame::data(id, b"early".to_vec())).await;
        assert_eq!(conn.session_state(id), Some(SessionState::Pending));
        assert_eq!(conn.metrics.snapshot().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_close_from_agent_ends_session() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;
        conn.on_frame(Frame::dial_ok(id)).await;
        let mut session = pending.established().await.unwrap();

        conn.on_frame(Frame::close(id, None)).await;
        assert_eq!(session.recv().await.unwrap(), None);
        assert_eq!(conn.session_state(id), None);
    }

    #[tokio::test]
    async fn test_close_session_is_idempotent() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;

        conn.close_session(id, Some("client gone".to_string())).await;
        conn.close_session(id, None).await;
        drop(pending);

        match rx.recv().await.unwrap() {
            Frame::Close {
                connection_id,
                error_message,
            } => {
                assert_eq!(connection_id, id);
                assert_eq!(error_message.as_deref(), Some("client gone"));
            }
            other => panic!("Expected Close, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropping_session_sends_close() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;
        conn.on_frame(Frame::dial_ok(id)).await;
        let session = pending.established().await.unwrap();

        drop(session);

        assert_eq!(rx.recv().await.unwrap(), Frame::close(id, None));
        assert_eq!(conn.session_count(), 0);
    }

    #[tokio::test]
    async fn test_teardown_fails_every_session() {
        let (conn, mut rx) = connection(8);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;
        conn.on_frame(Frame::dial_ok(id)).await;
        let mut established = pending.established().await.unwrap();

        let still_pending = conn.open_session("10.0.0.2:80").await.unwrap();

        conn.teardown();

        assert!(matches!(
            established.recv().await,
            Err(TunnelError::AgentLost)
        ));
        assert!(matches!(
            still_pending.established().await,
            Err(TunnelError::AgentLost)
        ));
        assert!(matches!(
            established.send_data(b"late".to_vec()).await,
            Err(TunnelError::AgentLost)
        ));
        assert!(matches!(
            conn.open_session("10.0.0.3:80").await,
            Err(TunnelError::AgentLost)
        ));
        assert_eq!(conn.session_count(), 0);
        assert_eq!(conn.metrics.snapshot().sessions_lost, 2);
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let (conn, mut rx) = connection(8);

        conn.on_frame(Frame::Ping { timestamp: 42 }).await;
        assert_eq!(rx.recv().await.unwrap(), Frame::Pong { timestamp: 42 });
    }

    #[tokio::test]
    async fn test_disconnect_breaks_dispatch() {
        let (conn, _rx) = connection(8);

        let flow = conn
            .on_frame(Frame::Disconnect {
                reason: "agent stopping".to_string(),
            })
            .await;
        assert_eq!(flow, ControlFlow::Break("agent stopping".to_string()));
    }
    #[tokio::test]
    async fn test_close_marks_session_closing_until_sent() {
        let (conn, mut rx) = connection(1);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;
        conn.on_frame(Frame::dial_ok(id)).await;
        let session = pending.established().await.unwrap();

        // Fill the queue so the Close has to wait
        conn.on_frame(Frame::Ping { timestamp: 1 }).await;
        let closer = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.close_session(id, None).await })
        };
        tokio::task::yield_now().await;
        while conn.session_state(id) != Some(SessionState::Closing) {
            tokio::task::yield_now().await;
        }
        assert!(matches!(
            session.send_data(b"late".to_vec()).await,
            Err(TunnelError::SessionClosed)
        ));

        // Dropping the handle while closing must not queue a second Close
        drop(session);
        assert_eq!(rx.recv().await.unwrap(), Frame::Pong { timestamp: 1 });
        closer.await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Frame::close(id, None));
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.session_state(id), None);
    }

    #[tokio::test]
    async fn test_send_data_waits_for_queue_space() {
        let (conn, mut rx) = connection(1);

        let pending = conn.open_session("10.0.0.1:80").await.unwrap();
        let id = expect_dial_request(&mut rx).await;
        conn.on_frame(Frame::dial_ok(id)).await;
        let session = pending.established().await.unwrap();

        conn.send_data(id, b"one".to_vec()).await.unwrap();

        let blocked = {
            let conn = conn.clone();
            tokio::spawn(async move {
                conn.send_data(id, b"two".to_vec()).await.unwrap();
                conn.send_data(id, b"three".to_vec()).await.unwrap();
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let mut received = Vec::new();
        for _ in 0..3 {
            match rx.recv().await.unwrap() {
                Frame::Data {
                    connection_id,
                    payload,
                } => {
                    assert_eq!(connection_id, id);
                    received.push(payload);
                }
                other => panic!("Expected Data, got {:?}", other),
            }
        }
        blocked.await.unwrap();

        assert_eq!(
            received,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
        assert_eq!(conn.metrics.snapshot().frames_dropped, 0);
        drop(session);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_no_session_survives_concurrent_teardown() {
        for _ in 0..2000 {
            let (conn, _rx) = connection(8);

            let opener = {
                let conn = conn.clone();
                tokio::spawn(async move { conn.open_session("10.0.0.1:80").await })
            };
            let closer = {
                let conn = conn.clone();
                tokio::spawn(async move { conn.teardown() })
            };
            closer.await.unwrap();

            match opener.await.unwrap() {
                Err(TunnelError::AgentLost) => {}
                Ok(pending) => {
                    // Opened before teardown, so it must already be failed
                    let result =
                        tokio::time::timeout(Duration::from_secs(1), pending.established())
                            .await
                            .expect("session outlived its agent connection");
                    assert!(matches!(result, Err(TunnelError::AgentLost)));
                }
                Err(other) => panic!("Expected AgentLost, got {:?}", other),
            }
            assert_eq!(conn.session_count(), 0);
        }
    }
}
