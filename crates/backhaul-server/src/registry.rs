//! Backend registry
//!
//! Tracks which agents are connected and picks one for each new session.

use crate::config::SessionSettings;
use crate::error::TunnelError;
use crate::metrics::Metrics;
use crate::multiplexer::AgentConnection;
use backhaul_proto::{AgentMetadata, Frame};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Default)]
struct RegistryInner {
    agents: HashMap<String, Arc<AgentConnection>>,
    /// Selection order, oldest registration first
    order: Vec<String>,
}

impl RegistryInner {
    fn remove(&mut self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        let removed = self.agents.remove(agent_id)?;
        self.order.retain(|id| id != agent_id);
        Some(removed)
    }
}

/// Registry of connected agents
pub struct AgentRegistry {
    inner: RwLock<RegistryInner>,
    cursor: AtomicUsize,
    next_instance: AtomicU64,
    ready_tx: watch::Sender<bool>,
    settings: SessionSettings,
    metrics: Arc<Metrics>,
}

impl AgentRegistry {
    pub fn new(settings: SessionSettings, metrics: Arc<Metrics>) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            inner: RwLock::new(RegistryInner::default()),
            cursor: AtomicUsize::new(0),
            next_instance: AtomicU64::new(1),
            ready_tx,
            settings,
            metrics,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an agent whose control stream was just accepted.
    ///
    /// `outbound` feeds the stream's drain task. An agent already registered
    /// under the same ID is replaced and its sessions fail with `AgentLost`.
    pub fn register(
        &self,
        agent_id: &str,
        metadata: AgentMetadata,
        outbound: mpsc::Sender<Frame>,
    ) -> Arc<AgentConnection> {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let connection = Arc::new(AgentConnection::new(
            agent_id.to_string(),
            instance,
            metadata,
            outbound,
            self.settings,
            self.metrics.clone(),
        ));

        let mut inner = self.write();
        if let Some(previous) = inner.remove(agent_id) {
            info!(
                agent_id = %agent_id,
                previous_instance = previous.instance(),
                "Agent re-registered, replacing previous connection"
            );
            previous.teardown();
        }
        inner.agents.insert(agent_id.to_string(), connection.clone());
        inner.order.push(agent_id.to_string());
        self.publish(&inner);
        drop(inner);

        info!(
            agent_id = %agent_id,
            instance,
            hostname = %connection.metadata().hostname,
            "Agent registered"
        );
        connection
    }

    /// Remove an agent and fail all of its sessions with `AgentLost`
    pub fn unregister(&self, agent_id: &str) -> bool {
        let mut inner = self.write();
        let Some(connection) = inner.remove(agent_id) else {
            return false;
        };
        // Sessions are failed before the agent becomes unselectable to readers
        connection.teardown();
        self.publish(&inner);
        drop(inner);

        info!(agent_id = %agent_id, "Agent unregistered");
        true
    }

    /// Remove `connection` if it is still the registered instance for its ID.
    ///
    /// A control stream that ends after being replaced by a newer
    /// registration only tears itself down.
    pub fn unregister_connection(&self, connection: &Arc<AgentConnection>) -> bool {
        let mut inner = self.write();
        let current = inner
            .agents
            .get(connection.agent_id())
            .is_some_and(|registered| Arc::ptr_eq(registered, connection));

        if !current {
            drop(inner);
            connection.teardown();
            debug!(
                agent_id = %connection.agent_id(),
                instance = connection.instance(),
                "Stale agent connection closed"
            );
            return false;
        }

        inner.remove(connection.agent_id());
        connection.teardown();
        self.publish(&inner);
        drop(inner);

        info!(
            agent_id = %connection.agent_id(),
            instance = connection.instance(),
            "Agent unregistered"
        );
        true
    }

    /// Pick an agent round-robin
    pub fn select(&self) -> Result<Arc<AgentConnection>, TunnelError> {
        let inner = self.read();
        let len = inner.order.len();
        if len == 0 {
            return Err(TunnelError::NoAgentAvailable);
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed);
        for offset in 0..len {
            let agent_id = &inner.order[(start + offset) % len];
            if let Some(connection) = inner.agents.get(agent_id) {
                if !connection.is_lost() {
                    return Ok(connection.clone());
                }
            }
        }

        Err(TunnelError::NoAgentAvailable)
    }

    /// True iff at least one agent is registered
    pub fn ready(&self) -> bool {
        !self.read().agents.is_empty()
    }

    /// Readiness as a watch channel
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.ready_tx.subscribe()
    }

    /// Wait until readiness equals `ready`, giving up after `timeout`
    pub async fn wait_ready(&self, ready: bool, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, rx.wait_for(|value| *value == ready))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.read().agents.len()
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.read().order.clone()
    }

    pub fn get(&self, agent_id: &str) -> Option<Arc<AgentConnection>> {
        self.read().agents.get(agent_id).cloned()
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub(crate) fn settings(&self) -> SessionSettings {
        self.settings
    }

    /// Tear down every agent connection
    pub fn shutdown(&self) {
        let mut inner = self.write();
        let agents: Vec<Arc<AgentConnection>> = inner.agents.drain().map(|(_, c)| c).collect();
        inner.order.clear();
        for connection in &agents {
            connection.teardown();
        }
        self.publish(&inner);
        drop(inner);

        if !agents.is_empty() {
            info!(count = agents.len(), "All agents disconnected");
        }
    }

    fn publish(&self, inner: &RegistryInner) {
        let count = inner.agents.len();
        self.metrics.set_agents_connected(count);
        self.ready_tx.send_if_modified(|ready| {
            let now = count > 0;
            let changed = *ready != now;
            *ready = now;
            changed
        });
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(SessionSettings::default(), Arc::new(Metrics::new()))
    }
}
