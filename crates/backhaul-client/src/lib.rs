//! Backhaul Client - reach targets behind an agent through the proxy server
//!
//! Two ways in, matching the server's two frontends:
//!
//! - [`TunnelClient`] speaks the streaming-tunnel protocol; each
//!   [`TunnelClient::dial`] yields a [`TunnelConn`] usable as a plain socket.
//! - [`http_connect`] opens a raw TCP tunnel with an HTTP `CONNECT` request.
//!
//! ```no_run
//! use backhaul_client::TunnelClient;
//! use tokio::io::AsyncWriteExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TunnelClient::connect("127.0.0.1:8090").await?;
//! let mut conn = client.dial("10.0.0.5:80").await?;
//! conn.write_all(b"GET / HTTP/1.1\r\nHost: 10.0.0.5\r\n\r\n").await?;
//! # Ok(())
//! # }
//! ```

mod connect;
mod error;
mod tunnel;

pub use connect::http_connect;
pub use error::ClientError;
pub use tunnel::{TunnelClient, TunnelConn};
