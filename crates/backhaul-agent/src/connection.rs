use backhaul_proto::ConnectionId;
use std::collections::HashMap;
use std::future::Future;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};

/// Information about an active forwarding connection
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    /// Target address being forwarded to
    pub target_address: String,
    pub established_at: Instant,
}

struct Entry {
    info: ConnectionInfo,
    input: mpsc::Sender<Vec<u8>>,
}

/// Connections opened on one control stream.
///
/// Owned by that stream's read loop; a reconnect starts with a fresh table.
pub struct ConnectionTable {
    entries: HashMap<ConnectionId, Entry>,
    tasks: JoinSet<ConnectionId>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// True while a connection with this ID is still being served
    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.entries
            .get(&connection_id)
            .is_some_and(|entry| !entry.input.is_closed())
    }

    /// Track a connection and spawn the task serving it.
    ///
    /// `task` must return `connection_id` when it finishes.
    pub fn spawn<F>(
        &mut self,
        connection_id: ConnectionId,
        target_address: String,
        input: mpsc::Sender<Vec<u8>>,
        task: F,
    ) where
        F: Future<Output = ConnectionId> + Send + 'static,
    {
        tracing::debug!(
            connection_id,
            target_address = %target_address,
            "Registering connection"
        );

        self.entries.insert(
            connection_id,
            Entry {
                info: ConnectionInfo {
                    connection_id,
                    target_address,
                    established_at: Instant::now(),
                },
                input,
            },
        );
        self.tasks.spawn(task);
    }

    /// Sender for payloads headed to the connection's target
    pub fn input(&self, connection_id: ConnectionId) -> Option<&mpsc::Sender<Vec<u8>>> {
        self.entries.get(&connection_id).map(|entry| &entry.input)
    }

    /// Stop routing to a connection; its pump sees the input close
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<ConnectionInfo> {
        let entry = self.entries.remove(&connection_id)?;
        tracing::debug!(
            connection_id,
            target_address = %entry.info.target_address,
            duration_secs = entry.info.established_at.elapsed().as_secs(),
            "Connection removed"
        );
        Some(entry.info)
    }

    /// Wait for the next connection task to finish
    pub async fn join_next(&mut self) -> Option<Result<ConnectionId, JoinError>> {
        self.tasks.join_next().await
    }

    /// Forget a finished connection unless its ID was already reused
    pub fn finished(&mut self, connection_id: ConnectionId) {
        if self
            .entries
            .get(&connection_id)
            .is_some_and(|entry| entry.input.is_closed())
        {
            self.entries.remove(&connection_id);
        }
    }

    pub fn has_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn list(&self) -> Vec<ConnectionInfo> {
        self.entries.values().map(|entry| entry.info.clone()).collect()
    }

    /// Abort every connection and wait until their target sockets are dropped
    pub async fn shutdown(&mut self) {
        let open = self.list();
        for info in &open {
            tracing::debug!(
                connection_id = info.connection_id,
                target_address = %info.target_address,
                age = ?info.established_at.elapsed(),
                "Closing local connection"
            );
        }
        let count = open.len();
        self.entries.clear();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}

        if count > 0 {
            tracing::info!(closed = count, "Closed all local connections");
        }
    }
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}
