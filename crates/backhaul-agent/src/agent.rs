use crate::allowlist::{Allowlist, AllowlistConfig, AllowlistError};
use crate::connection::ConnectionTable;
use crate::forwarder::TcpForwarder;
use crate::reconnect::{ReconnectConfig, ReconnectError, ReconnectManager};
use backhaul_proto::{AgentMetadata, CodecError, ConnectionId, Frame, FrameCodec};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

/// Payloads buffered per forwarded connection before the read loop waits
const CONNECTION_BUFFER: usize = 64;

/// How long queued frames may take to flush when a control stream ends
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur in the agent
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Invalid agent configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid allowlist configuration: {0}")]
    InvalidAllowlist(#[from] AllowlistError),

    #[error("Failed to connect to server {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Registration rejected: {0}")]
    Rejected(String),

    #[error("No registration reply within {0:?}")]
    RegistrationTimeout(Duration),

    #[error("Unexpected {0} frame during registration")]
    UnexpectedFrame(&'static str),

    #[error("Control stream closed")]
    ConnectionClosed,

    #[error("Reconnect failed: {0}")]
    Reconnect(#[from] ReconnectError),
}

/// Configuration for the agent
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Unique identifier for this agent
    pub agent_id: String,

    /// Server control endpoint (host:port)
    pub server_addr: String,

    /// Interval between keepalive pings
    #[serde(with = "backhaul_proto::duration_secs")]
    pub keepalive_interval: Duration,

    /// Time allowed for one outbound dial to a target
    #[serde(with = "backhaul_proto::duration_secs")]
    pub dial_timeout: Duration,

    /// Time allowed for the server to answer `Register`
    #[serde(with = "backhaul_proto::duration_secs")]
    pub register_timeout: Duration,

    /// Frames queued towards the server before senders block
    pub outbound_queue_depth: usize,

    pub reconnect: ReconnectConfig,

    /// Targets the agent is willing to dial
    pub allowlist: AllowlistConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: format!("agent-{}", uuid::Uuid::new_v4()),
            server_addr: "127.0.0.1:8091".to_string(),
            keepalive_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
            register_timeout: Duration::from_secs(10),
            outbound_queue_depth: 256,
            reconnect: ReconnectConfig::default(),
            allowlist: AllowlistConfig::default(),
        }
    }
}

/// Connection state of the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Connecting,
    Connected,
}

/// The backhaul agent: keeps a control stream to the server open and dials
/// targets on its behalf
pub struct Agent {
    config: AgentConfig,
    metadata: AgentMetadata,
    forwarder: Arc<TcpForwarder>,
    state_tx: watch::Sender<AgentState>,
}

impl Agent {
    /// Create a new agent with the given configuration
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        if config.keepalive_interval.is_zero() {
            return Err(AgentError::InvalidConfig(
                "keepalive_interval must be greater than zero".to_string(),
            ));
        }

        let allowlist = Allowlist::from_config(&config.allowlist)?;
        if allowlist.allows_all() {
            tracing::warn!("No allowlist configured, the agent will dial any target");
        }

        let forwarder = Arc::new(TcpForwarder::new(allowlist, config.dial_timeout));
        let (state_tx, _) = watch::channel(AgentState::Disconnected);

        Ok(Self {
            config,
            metadata: AgentMetadata::default(),
            forwarder,
            state_tx,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn state(&self) -> AgentState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions
    pub fn subscribe(&self) -> watch::Receiver<AgentState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: AgentState) {
        self.state_tx.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Run until `shutdown` is cancelled, reconnecting whenever the control
    /// stream is lost.
    ///
    /// Returns an error only when the server rejects the registration or the
    /// configured number of reconnect attempts is exhausted.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), AgentError> {
        let mut reconnect = ReconnectManager::new(self.config.reconnect.clone());

        let result = loop {
            if shutdown.is_cancelled() {
                break Ok(());
            }

            self.set_state(AgentState::Connecting);
            tracing::info!(
                "Connecting to server at {} with agent ID: {} (attempt {})",
                self.config.server_addr,
                self.config.agent_id,
                reconnect.attempt() + 1
            );

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                connected = self.connect() => connected,
            };

            match connected {
                Ok(framed) => {
                    reconnect.reset();
                    self.set_state(AgentState::Connected);

                    match self.serve(framed, &shutdown).await {
                        Ok(()) => tracing::info!("Control stream closed"),
                        Err(e) => tracing::warn!("Control stream failed: {}", e),
                    }
                    self.set_state(AgentState::Disconnected);
                }
                Err(AgentError::Rejected(reason)) => {
                    tracing::error!("Server rejected registration: {}", reason);
                    break Err(AgentError::Rejected(reason));
                }
                Err(e) => {
                    self.set_state(AgentState::Disconnected);
                    tracing::warn!("Failed to connect: {}", e);
                }
            }

            if shutdown.is_cancelled() {
                break Ok(());
            }

            tracing::info!(
                "Reconnecting in {:?} (attempt {})",
                reconnect.current_backoff(),
                reconnect.attempt() + 1
            );
            match reconnect.wait(&shutdown).await {
                Ok(()) => {}
                Err(ReconnectError::Cancelled) => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };

        self.set_state(AgentState::Disconnected);
        tracing::info!("Agent {} stopped", self.config.agent_id);
        result
    }

    /// Open a control stream and register
    async fn connect(&self) -> Result<Framed<TcpStream, FrameCodec>, AgentError> {
        let stream = TcpStream::connect(&self.config.server_addr)
            .await
            .map_err(|source| AgentError::Connect {
                address: self.config.server_addr.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let mut framed = Framed::new(stream, FrameCodec::new());
        framed
            .send(Frame::Register {
                agent_id: self.config.agent_id.clone(),
                metadata: self.metadata.clone(),
            })
            .await?;

        let reply = tokio::time::timeout(self.config.register_timeout, framed.next())
            .await
            .map_err(|_| AgentError::RegistrationTimeout(self.config.register_timeout))?;

        match reply {
            Some(Ok(Frame::Registered { agent_id })) => {
                tracing::info!("✅ Registered with server as {}", agent_id);
                Ok(framed)
            }
            Some(Ok(Frame::Rejected { reason })) => Err(AgentError::Rejected(reason)),
            Some(Ok(other)) => Err(AgentError::UnexpectedFrame(other.kind())),
            Some(Err(e)) => Err(e.into()),
            None => Err(AgentError::ConnectionClosed),
        }
    }

    /// Serve one registered control stream until it ends.
    ///
    /// Every connection opened on the stream is closed before returning.
    async fn serve(
        &self,
        framed: Framed<TcpStream, FrameCodec>,
        shutdown: &CancellationToken,
    ) -> Result<(), AgentError> {
        let (mut sink, mut frames) = framed.split();
        let (out_tx, mut out_rx) =
            mpsc::channel::<Frame>(self.config.outbound_queue_depth.max(1));

        let mut writer: JoinHandle<Result<(), CodecError>> = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                sink.send(frame).await?;
            }
            sink.close().await
        });
        let mut writer_done = false;

        let mut table = ConnectionTable::new();
        let mut keepalive = tokio::time::interval(self.config.keepalive_interval);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await;

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = out_tx
                        .send(Frame::Disconnect {
                            reason: "agent shutting down".to_string(),
                        })
                        .await;
                    break Ok(());
                }

                _ = keepalive.tick() => {
                    tracing::trace!("Sending keepalive ping");
                    let _ = out_tx.send(Frame::Ping { timestamp: now_millis() }).await;
                }

                written = &mut writer, if !writer_done => {
                    writer_done = true;
                    break match written {
                        Ok(Ok(())) => Err(AgentError::ConnectionClosed),
                        Ok(Err(e)) => Err(e.into()),
                        Err(_) => Err(AgentError::ConnectionClosed),
                    };
                }

                Some(joined) = table.join_next(), if table.has_tasks() => {
                    if let Ok(connection_id) = joined {
                        table.finished(connection_id);
                    }
                }

                frame = frames.next() => match frame {
                    Some(Ok(frame)) => {
                        let flow = self.on_frame(frame, &mut table, &out_tx).await;
                        if let ControlFlow::Break(reason) = flow {
                            tracing::info!("Server closed control stream: {}", reason);
                            break Ok(());
                        }
                    }
                    Some(Err(e)) => break Err(e.into()),
                    None => break Ok(()),
                },
            }
        };

        // Sessions never survive their control stream
        table.shutdown().await;
        drop(out_tx);

        if !writer_done {
            match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await {
                Ok(_) => {}
                Err(_) => writer.abort(),
            }
        }

        result
    }

    /// Handle one frame from the server
    async fn on_frame(
        &self,
        frame: Frame,
        table: &mut ConnectionTable,
        out_tx: &mpsc::Sender<Frame>,
    ) -> ControlFlow<String> {
        match frame {
            Frame::DialRequest {
                connection_id,
                target_address,
            } => {
                self.dial(connection_id, target_address, table, out_tx).await;
            }

            Frame::Data {
                connection_id,
                payload,
            } => match table.input(connection_id) {
                Some(input) => {
                    // Waits while the target is slower than the server
                    if input.send(payload).await.is_err() {
                        tracing::debug!(connection_id, "Data for finished connection, dropping");
                    }
                }
                None => {
                    tracing::debug!(connection_id, "Data for unknown connection, dropping");
                }
            },

            Frame::Close {
                connection_id,
                error_message,
            } => {
                if table.remove(connection_id).is_some() {
                    tracing::debug!(
                        connection_id,
                        reason = ?error_message,
                        "Server closed connection"
                    );
                }
            }

            Frame::Ping { timestamp } => {
                let _ = out_tx.send(Frame::Pong { timestamp }).await;
            }

            Frame::Pong { timestamp } => {
                tracing::trace!("Received pong for {}", timestamp);
            }

            Frame::Disconnect { reason } => return ControlFlow::Break(reason),

            other => {
                tracing::warn!("Unexpected {} frame from server, dropping", other.kind());
            }
        }

        ControlFlow::Continue(())
    }

    async fn dial(
        &self,
        connection_id: ConnectionId,
        target_address: String,
        table: &mut ConnectionTable,
        out_tx: &mpsc::Sender<Frame>,
    ) {
        if table.contains(connection_id) {
            tracing::warn!(connection_id, "Dial for connection ID already in use");
            let _ = out_tx
                .send(Frame::dial_failed(connection_id, "connection id in use"))
                .await;
            return;
        }

        tracing::debug!(
            connection_id,
            target_address = %target_address,
            "Dial requested"
        );

        let (input_tx, input_rx) = mpsc::channel(CONNECTION_BUFFER);
        let forwarder = self.forwarder.clone();
        let out_tx = out_tx.clone();
        let target = target_address.clone();

        table.spawn(connection_id, target_address, input_tx, async move {
            let stream = match forwarder.dial(&target).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!("Failed to dial {}: {}", target, e);
                    let _ = out_tx
                        .send(Frame::dial_failed(connection_id, e.to_string()))
                        .await;
                    return connection_id;
                }
            };

            if out_tx.send(Frame::dial_ok(connection_id)).await.is_err() {
                return connection_id;
            }

            let stats = TcpForwarder::forward(connection_id, stream, out_tx, input_rx).await;
            tracing::debug!(
                connection_id,
                target_address = %target,
                bytes_to_target = stats.bytes_to_target,
                bytes_from_target = stats.bytes_from_target,
                "Forward completed"
            );
            connection_id
        });
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert!(config.agent_id.starts_with("agent-"));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn test_config_from_yaml() {
        let yaml = r#"
agent_id: edge-1
server_addr: proxy.internal:8091
dial_timeout: 3
allowlist:
  networks: ["10.0.0.0/8"]
  ports: [80, 443]
reconnect:
  max_attempts: 5
"#;
        let config: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.agent_id, "edge-1");
        assert_eq!(config.server_addr, "proxy.internal:8091");
        assert_eq!(config.dial_timeout, Duration::from_secs(3));
        assert_eq!(config.allowlist.ports, vec![80, 443]);
        assert_eq!(config.reconnect.max_attempts, Some(5));
        assert_eq!(config.keepalive_interval, Duration::from_secs(30));
    }

    #[test]
    fn test_zero_keepalive_rejected() {
        let config: AgentConfig = serde_yaml::from_str("keepalive_interval: 0\n").unwrap();
        match Agent::new(config) {
            Err(AgentError::InvalidConfig(message)) => {
                assert!(message.contains("keepalive_interval"))
            }
            other => panic!("Expected InvalidConfig, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_invalid_allowlist_rejected() {
        let config = AgentConfig {
            allowlist: AllowlistConfig {
                networks: vec!["not-a-cidr".to_string()],
                ports: vec![],
            },
            ..AgentConfig::default()
        };
        assert!(matches!(
            Agent::new(config),
            Err(AgentError::InvalidAllowlist(_))
        ));
    }

    #[test]
    fn test_initial_state() {
        let agent = Agent::new(AgentConfig::default()).unwrap();
        assert_eq!(agent.state(), AgentState::Disconnected);
    }
}
