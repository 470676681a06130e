//! Proxy server: agent control endpoint plus frontends
//!
//! Owns the [`AgentRegistry`] and one accept loop per enabled listener.

use crate::config::ServerConfig;
use crate::control::serve_agent;
use crate::frontend::{handle_connect, serve_tunnel_client};
use crate::metrics::Metrics;
use crate::registry::AgentRegistry;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Tunneling proxy server
pub struct ProxyServer {
    config: ServerConfig,
    registry: Arc<AgentRegistry>,
    agent_listener: TcpListener,
    tunnel_listener: Option<TcpListener>,
    connect_listener: Option<TcpListener>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Bind every configured listener
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let agent_listener = TcpListener::bind(config.agent_addr).await?;

        let tunnel_listener = match config.tunnel_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        let connect_listener = match config.connect_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };

        let registry = Arc::new(AgentRegistry::new(
            config.session_settings(),
            Arc::new(Metrics::new()),
        ));

        Ok(Self {
            config,
            registry,
            agent_listener,
            tunnel_listener,
            connect_listener,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> Arc<AgentRegistry> {
        self.registry.clone()
    }

    pub fn agent_addr(&self) -> std::io::Result<SocketAddr> {
        self.agent_listener.local_addr()
    }

    pub fn tunnel_addr(&self) -> Option<SocketAddr> {
        self.tunnel_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    pub fn connect_addr(&self) -> Option<SocketAddr> {
        self.connect_listener
            .as_ref()
            .and_then(|listener| listener.local_addr().ok())
    }

    /// Cancelling this token stops [`run`](Self::run)
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled
    pub async fn run(self) -> std::io::Result<()> {
        let ProxyServer {
            config,
            registry,
            agent_listener,
            tunnel_listener,
            connect_listener,
            shutdown,
        } = self;

        let tracker = TaskTracker::new();

        info!("Agent endpoint listening on {}", agent_listener.local_addr()?);
        {
            let registry = registry.clone();
            let config = config.clone();
            tracker.spawn(accept_loop(
                agent_listener,
                "agent",
                tracker.clone(),
                shutdown.clone(),
                move |stream, peer| {
                    serve_agent(stream, peer, registry.clone(), config.clone())
                },
            ));
        }

        if let Some(listener) = tunnel_listener {
            info!("Tunnel frontend listening on {}", listener.local_addr()?);
            let registry = registry.clone();
            tracker.spawn(accept_loop(
                listener,
                "tunnel",
                tracker.clone(),
                shutdown.clone(),
                move |stream, peer| serve_tunnel_client(stream, peer, registry.clone()),
            ));
        }

        if let Some(listener) = connect_listener {
            info!(
                "HTTP CONNECT frontend listening on {}",
                listener.local_addr()?
            );
            let registry = registry.clone();
            let head_timeout = config.handshake_timeout;
            tracker.spawn(accept_loop(
                listener,
                "connect",
                tracker.clone(),
                shutdown.clone(),
                move |stream, peer| {
                    handle_connect(stream, peer, registry.clone(), head_timeout)
                },
            ));
        }

        shutdown.cancelled().await;
        info!("Shutting down");

        registry.shutdown();
        tracker.close();
        tracker.wait().await;

        info!("Server stopped");
        Ok(())
    }
}

async fn accept_loop<F, Fut>(
    listener: TcpListener,
    name: &'static str,
    tracker: TaskTracker,
    shutdown: CancellationToken,
    handler: F,
) where
    F: Fn(TcpStream, SocketAddr) -> Fut + Send + 'static,
    Fut: Future<Output = Result<(), crate::TunnelError>> + Send + 'static,
{
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("Failed to accept {} connection: {}", name, e);
                    continue;
                }
            },
        };

        debug!("New {} connection from {}", name, peer_addr);
        let _ = stream.set_nodelay(true);

        let connection = handler(stream, peer_addr);
        let shutdown = shutdown.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = connection => {
                    if let Err(e) = result {
                        error!("{} connection from {} failed: {}", name, peer_addr, e);
                    }
                }
            }
        });
    }
}
