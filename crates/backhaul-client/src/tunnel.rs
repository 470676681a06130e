//! Client side of the streaming-tunnel frontend
//!
//! One [`TunnelClient`] owns one connection to the proxy server. Every
//! [`TunnelClient::dial`] picks a fresh connection ID, sends a
//! `DialRequest`, and once the server answers hands back a [`TunnelConn`]
//! that behaves like a plain socket to the target.

use crate::error::ClientError;
use backhaul_proto::{ConnectionId, Frame, FrameCodec};
use bytes::{Buf, Bytes};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{ready, Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::oneshot;
use tokio_util::codec::Framed;
use tokio_util::sync::{CancellationToken, PollSender};
use tracing::{debug, warn};

/// Frames queued towards the server
const OUTBOUND_QUEUE_DEPTH: usize = 256;

/// Payloads buffered per connection before the reader applies backpressure
const CONNECTION_BUFFER: usize = 64;

/// Largest payload put in a single `Data` frame
const MAX_CHUNK_SIZE: usize = 64 * 1024;

const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(30);

const TUNNEL_LOST: &str = "tunnel connection lost";

#[derive(Debug)]
enum Event {
    Data(Vec<u8>),
    Closed(Option<String>),
}

struct Route {
    dial_tx: Option<oneshot::Sender<Result<(), String>>>,
    events: mpsc::Sender<Event>,
}

#[derive(Default)]
struct Shared {
    routes: Mutex<HashMap<ConnectionId, Route>>,
    lost: AtomicBool,
}

impl Shared {
    fn routes(&self) -> MutexGuard<'_, HashMap<ConnectionId, Route>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, connection_id: ConnectionId) -> Option<Route> {
        self.routes().remove(&connection_id)
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Mark the tunnel dead and release every connection.
    ///
    /// Pending dials see their reply sender dropped; open connections see
    /// their event stream end while `lost` is already set.
    fn lose(&self) {
        self.lost.store(true, Ordering::Release);
        let drained: Vec<Route> = self.routes().drain().map(|(_, route)| route).collect();
        if !drained.is_empty() {
            debug!(connections = drained.len(), "Tunnel lost with connections open");
        }
    }
}

/// A connection to the proxy's streaming-tunnel frontend
pub struct TunnelClient {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<Frame>,
    next_id: AtomicU64,
    dial_timeout: Duration,
    shutdown: CancellationToken,
}

impl TunnelClient {
    /// Connect to the streaming-tunnel frontend at `addr`
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self::new(stream))
    }

    /// Speak the tunnel protocol over an already connected stream
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sink, mut frames) = Framed::new(stream, FrameCodec::new()).split();
        let (outbound, mut out_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE_DEPTH);
        let shared = Arc::new(Shared::default());
        let shutdown = CancellationToken::new();

        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = sink.send(frame).await {
                            debug!("Failed to write to tunnel: {}", e);
                            token.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = sink.close().await;
        });

        let token = shutdown.clone();
        let reader_shared = shared.clone();
        let pong_tx = outbound.clone();
        tokio::spawn(async move {
            let reason = loop {
                let frame = tokio::select! {
                    _ = token.cancelled() => break "client closed".to_string(),
                    frame = frames.next() => frame,
                };
                match frame {
                    Some(Ok(frame)) => dispatch(&reader_shared, frame, &pong_tx).await,
                    Some(Err(e)) => break e.to_string(),
                    None => break "server closed the tunnel".to_string(),
                }
            };

            debug!("Tunnel reader stopped: {}", reason);
            reader_shared.lose();
            token.cancel();
        });

        Self {
            shared,
            outbound,
            next_id: AtomicU64::new(1),
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            shutdown,
        }
    }

    /// Set how long [`dial`](Self::dial) waits for the server's answer
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    /// True once the tunnel to the server is gone; no further dials succeed
    pub fn is_closed(&self) -> bool {
        self.shared.is_lost()
    }

    /// Open a connection to `target_address` (host:port) through the proxy
    pub async fn dial(&self, target_address: &str) -> Result<TunnelConn, ClientError> {
        if self.is_closed() {
            return Err(ClientError::TunnelClosed);
        }

        let connection_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (dial_tx, dial_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::channel(CONNECTION_BUFFER);
        self.shared.routes().insert(
            connection_id,
            Route {
                dial_tx: Some(dial_tx),
                events: events_tx,
            },
        );

        // The reader may have drained the table before the insert
        if self.shared.is_lost() {
            self.shared.remove(connection_id);
            return Err(ClientError::TunnelClosed);
        }

        let request = Frame::DialRequest {
            connection_id,
            target_address: target_address.to_string(),
        };
        if self.outbound.send(request).await.is_err() {
            self.shared.remove(connection_id);
            return Err(ClientError::TunnelClosed);
        }

        match tokio::time::timeout(self.dial_timeout, dial_rx).await {
            Ok(Ok(Ok(()))) => {
                debug!(connection_id, target_address, "Tunnel connection open");
                Ok(TunnelConn {
                    connection_id,
                    target_address: target_address.to_string(),
                    shared: self.shared.clone(),
                    events: events_rx,
                    read_buf: Bytes::new(),
                    read_state: ReadState::Open,
                    writer: PollSender::new(self.outbound.clone()),
                    closer: self.outbound.clone(),
                    shutdown_sent: false,
                })
            }
            Ok(Ok(Err(message))) => Err(ClientError::DialFailed(message)),
            Ok(Err(_)) => Err(ClientError::TunnelClosed),
            Err(_) => {
                self.shared.remove(connection_id);
                let _ = self
                    .outbound
                    .try_send(Frame::close(connection_id, Some("dial timed out".into())));
                Err(ClientError::Timeout(self.dial_timeout))
            }
        }
    }

    /// Close the tunnel; open connections fail with a reset
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for TunnelClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn dispatch(shared: &Shared, frame: Frame, outbound: &mpsc::Sender<Frame>) {
    match frame {
        Frame::DialResponse {
            connection_id,
            ok,
            error_message,
        } => {
            if ok {
                let dial_tx = shared
                    .routes()
                    .get_mut(&connection_id)
                    .and_then(|route| route.dial_tx.take());
                let delivered = match dial_tx {
                    Some(dial_tx) => dial_tx.send(Ok(())).is_ok(),
                    None => {
                        debug!(connection_id, "DialResponse for unknown connection");
                        return;
                    }
                };
                if !delivered {
                    // Caller stopped waiting
                    shared.remove(connection_id);
                    let _ = outbound.send(Frame::close(connection_id, None)).await;
                }
            } else if let Some(Route {
                dial_tx: Some(dial_tx),
                ..
            }) = shared.remove(connection_id)
            {
                let message = error_message.unwrap_or_else(|| "dial failed".to_string());
                let _ = dial_tx.send(Err(message));
            }
        }

        Frame::Data {
            connection_id,
            payload,
        } => {
            let events = shared
                .routes()
                .get(&connection_id)
                .map(|route| route.events.clone());
            match events {
                Some(events) => {
                    let _ = events.send(Event::Data(payload)).await;
                }
                None => debug!(connection_id, "Data for unknown connection, dropping"),
            }
        }

        Frame::Close {
            connection_id,
            error_message,
        } => match shared.remove(connection_id) {
            Some(Route {
                dial_tx: Some(dial_tx),
                ..
            }) => {
                let message = error_message.unwrap_or_else(|| "closed by server".to_string());
                let _ = dial_tx.send(Err(message));
            }
            Some(route) => {
                let _ = route.events.send(Event::Closed(error_message)).await;
            }
            None => {}
        },

        Frame::Ping { timestamp } => {
            let _ = outbound.send(Frame::Pong { timestamp }).await;
        }

        other => warn!("Unexpected {} frame on tunnel, dropping", other.kind()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadState {
    Open,
    Eof,
    Reset(String),
}

/// One tunneled connection to a target.
///
/// Reads fail with [`io::ErrorKind::ConnectionReset`] when the agent closes
/// the connection with an error or the tunnel itself is lost. Shutting down
/// the write side closes the whole connection.
pub struct TunnelConn {
    connection_id: ConnectionId,
    target_address: String,
    shared: Arc<Shared>,
    events: mpsc::Receiver<Event>,
    read_buf: Bytes,
    read_state: ReadState,
    writer: PollSender<Frame>,
    closer: mpsc::Sender<Frame>,
    shutdown_sent: bool,
}

impl TunnelConn {
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn target_address(&self) -> &str {
        &self.target_address
    }
}

fn reset(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionReset, message.to_string())
}

impl AsyncRead for TunnelConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match &this.read_state {
                ReadState::Open => {}
                ReadState::Eof => return Poll::Ready(Ok(())),
                ReadState::Reset(message) => return Poll::Ready(Err(reset(message))),
            }

            match ready!(this.events.poll_recv(cx)) {
                Some(Event::Data(payload)) => this.read_buf = Bytes::from(payload),
                Some(Event::Closed(None)) => this.read_state = ReadState::Eof,
                Some(Event::Closed(Some(message))) => {
                    this.read_state = ReadState::Reset(message);
                }
                None if this.shared.is_lost() => {
                    this.read_state = ReadState::Reset(TUNNEL_LOST.to_string());
                }
                None => this.read_state = ReadState::Eof,
            }
        }
    }
}

impl AsyncWrite for TunnelConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if let ReadState::Reset(message) = &this.read_state {
            return Poll::Ready(Err(reset(message)));
        }
        if this.shared.is_lost() {
            return Poll::Ready(Err(reset(TUNNEL_LOST)));
        }
        if this.shutdown_sent || this.read_state == ReadState::Eof {
            return Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        if ready!(this.writer.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(reset(TUNNEL_LOST)));
        }

        let n = buf.len().min(MAX_CHUNK_SIZE);
        if this
            .writer
            .send_item(Frame::data(this.connection_id, &buf[..n]))
            .is_err()
        {
            return Poll::Ready(Err(reset(TUNNEL_LOST)));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.shutdown_sent || this.read_state != ReadState::Open || this.shared.is_lost() {
            return Poll::Ready(Ok(()));
        }

        if ready!(this.writer.poll_reserve(cx)).is_ok() {
            let _ = this.writer.send_item(Frame::close(this.connection_id, None));
        }
        this.shutdown_sent = true;
        this.shared.remove(this.connection_id);
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelConn {
    fn drop(&mut self) {
        self.shared.remove(self.connection_id);

        if self.shutdown_sent || self.read_state != ReadState::Open || self.shared.is_lost() {
            return;
        }

        match self.closer.try_send(Frame::close(self.connection_id, None)) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(frame)) => {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    let closer = self.closer.clone();
                    handle.spawn(async move {
                        let _ = closer.send(frame).await;
                    });
                }
            }
        }
    }
}
