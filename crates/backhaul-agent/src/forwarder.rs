use crate::allowlist::{Allowlist, AllowlistError};
use backhaul_proto::{ConnectionId, Frame};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

/// Read buffer per target connection
const BUFFER_SIZE: usize = 16 * 1024;

/// Errors that can occur while dialing a target
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to resolve {address}: {source}")]
    Resolve {
        address: String,
        source: std::io::Error,
    },

    #[error("No addresses found for {0}")]
    NoAddresses(String),

    #[error("Address not allowed: {0}")]
    NotAllowed(#[from] AllowlistError),

    #[error("Failed to connect to {address}: {source}")]
    ConnectionFailed {
        address: String,
        source: std::io::Error,
    },

    #[error("Timed out connecting to {address} after {timeout:?}")]
    Timeout { address: String, timeout: Duration },
}

/// How a forwarded connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub bytes_to_target: u64,
    pub bytes_from_target: u64,
}

/// Dials targets on the server's behalf and pumps bytes between the target
/// socket and the control stream
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    allowlist: Allowlist,
    dial_timeout: Duration,
}

impl TcpForwarder {
    pub fn new(allowlist: Allowlist, dial_timeout: Duration) -> Self {
        Self {
            allowlist,
            dial_timeout,
        }
    }

    /// Resolve `target_address` and connect to the first allowed address
    pub async fn dial(&self, target_address: &str) -> Result<TcpStream, ForwarderError> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host(target_address)
            .await
            .map_err(|source| ForwarderError::Resolve {
                address: target_address.to_string(),
                source,
            })?
            .collect();

        if addrs.is_empty() {
            return Err(ForwarderError::NoAddresses(target_address.to_string()));
        }

        let mut denied = None;
        let mut last_error = None;

        for addr in addrs {
            if let Err(e) = self.allowlist.check(&addr) {
                tracing::debug!(
                    target_address = %target_address,
                    %addr,
                    "Resolved address denied: {}",
                    e
                );
                denied.get_or_insert(e);
                continue;
            }

            match tokio::time::timeout(self.dial_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    let _ = stream.set_nodelay(true);
                    tracing::debug!(
                        target_address = %target_address,
                        %addr,
                        "Connected to target"
                    );
                    return Ok(stream);
                }
                Ok(Err(source)) => {
                    last_error = Some(ForwarderError::ConnectionFailed {
                        address: target_address.to_string(),
                        source,
                    });
                }
                Err(_) => {
                    last_error = Some(ForwarderError::Timeout {
                        address: target_address.to_string(),
                        timeout: self.dial_timeout,
                    });
                }
            }
        }

        // Prefer a real connect error over an allowlist denial of another address
        match (last_error, denied) {
            (Some(e), _) => Err(e),
            (None, Some(denied)) => Err(denied.into()),
            (None, None) => Err(ForwarderError::NoAddresses(target_address.to_string())),
        }
    }

    /// Pump bytes until either side ends.
    ///
    /// `input` carries payloads from the server; it is closed when the server
    /// closes the session, in which case no `Close` is sent back. When the
    /// target side ends, a `Close` frame is queued on `outbound`.
    pub async fn forward(
        connection_id: ConnectionId,
        stream: TcpStream,
        outbound: mpsc::Sender<Frame>,
        mut input: mpsc::Receiver<Vec<u8>>,
    ) -> ForwardStats {
        let (mut target_read, mut target_write) = stream.into_split();

        let mut bytes_to_target = 0u64;
        let mut bytes_from_target = 0u64;

        let to_target = async {
            while let Some(payload) = input.recv().await {
                target_write.write_all(&payload).await?;
                bytes_to_target += payload.len() as u64;
            }
            let _ = target_write.shutdown().await;
            Ok::<(), std::io::Error>(())
        };

        let from_target = async {
            let mut buffer = vec![0u8; BUFFER_SIZE];
            loop {
                let n = target_read.read(&mut buffer).await?;
                if n == 0 {
                    return Ok::<(), std::io::Error>(());
                }
                if outbound
                    .send(Frame::data(connection_id, buffer[..n].to_vec()))
                    .await
                    .is_err()
                {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::BrokenPipe,
                        "control stream closed",
                    ));
                }
                bytes_from_target += n as u64;
            }
        };

        let close = tokio::select! {
            result = to_target => match result {
                Ok(()) => {
                    tracing::debug!(connection_id, "Session closed by server");
                    None
                }
                Err(e) => {
                    tracing::debug!(connection_id, "Write to target failed: {}", e);
                    Some(Frame::close(connection_id, Some(e.to_string())))
                }
            },
            result = from_target => match result {
                Ok(()) => {
                    tracing::debug!(connection_id, "Target closed connection");
                    Some(Frame::close(connection_id, None))
                }
                Err(e) => {
                    tracing::debug!(connection_id, "Read from target failed: {}", e);
                    Some(Frame::close(connection_id, Some(e.to_string())))
                }
            },
        };

        if let Some(frame) = close {
            let _ = outbound.send(frame).await;
        }

        ForwardStats {
            bytes_to_target,
            bytes_from_target,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn forwarder(allowlist: Allowlist) -> TcpForwarder {
        TcpForwarder::new(allowlist, Duration::from_secs(2))
    }

    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let (mut read, mut write) = socket.split();
                    let _ = tokio::io::copy(&mut read, &mut write).await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port nothing listens on
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let result = forwarder(Allowlist::default())
            .dial(&addr.to_string())
            .await;
        assert!(matches!(
            result,
            Err(ForwarderError::ConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_dial_denied_by_allowlist() {
        let addr = echo_server().await;
        let allowlist = Allowlist::new(vec!["10.0.0.0/8".to_string()], vec![]).unwrap();

        let result = forwarder(allowlist).dial(&addr.to_string()).await;
        assert!(matches!(result, Err(ForwarderError::NotAllowed(_))));
    }

    #[tokio::test]
    async fn test_dial_unresolvable() {
        let result = forwarder(Allowlist::default())
            .dial("not-a-valid-address")
            .await;
        assert!(matches!(result, Err(ForwarderError::Resolve { .. })));
    }

    #[tokio::test]
    async fn test_forward_echo() {
        let addr = echo_server().await;
        let stream = forwarder(Allowlist::default())
            .dial(&addr.to_string())
            .await
            .unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (in_tx, in_rx) = mpsc::channel(16);
        let task = tokio::spawn(TcpForwarder::forward(3, stream, out_tx, in_rx));

        in_tx.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(out_rx.recv().await.unwrap(), Frame::data(3, b"hello".to_vec()));

        // Server closes the session: no Close goes back
        drop(in_tx);
        let stats = task.await.unwrap();
        assert_eq!(stats.bytes_to_target, 5);
        assert_eq!(stats.bytes_from_target, 5);
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_target_close_sends_close_frame() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            socket.write_all(b"bye").await.unwrap();
        });

        let stream = forwarder(Allowlist::default())
            .dial(&addr.to_string())
            .await
            .unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (_in_tx, in_rx) = mpsc::channel(16);
        tokio::spawn(TcpForwarder::forward(9, stream, out_tx, in_rx));

        assert_eq!(out_rx.recv().await.unwrap(), Frame::data(9, b"bye".to_vec()));
        assert_eq!(out_rx.recv().await.unwrap(), Frame::close(9, None));
    }
}
