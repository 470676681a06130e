//! HTTP CONNECT helper for the proxy's CONNECT frontend

use crate::error::ClientError;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, ToSocketAddrs};

const MAX_HEAD_SIZE: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// Open a tunnel to `target_address` through the proxy at `proxy_addr`.
///
/// On success the returned stream is connected to the target; nothing past
/// the proxy's response head has been consumed.
pub async fn http_connect<A: ToSocketAddrs>(
    proxy_addr: A,
    target_address: &str,
) -> Result<TcpStream, ClientError> {
    let mut stream = TcpStream::connect(proxy_addr).await?;
    let _ = stream.set_nodelay(true);

    let request = format!(
        "CONNECT {target_address} HTTP/1.1\r\nHost: {target_address}\r\n\r\n"
    );
    stream.write_all(request.as_bytes()).await?;

    let head = read_head(&mut stream).await?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(ClientError::InvalidResponse("incomplete head".to_string()))
        }
        Err(e) => return Err(ClientError::InvalidResponse(e.to_string())),
    }

    match response.code {
        Some(200) => {
            tracing::debug!(target_address, "CONNECT tunnel established");
            Ok(stream)
        }
        code => Err(ClientError::ProxyRejected {
            status: code.unwrap_or_default(),
            reason: response.reason.unwrap_or_default().to_string(),
        }),
    }
}

/// Read up to and including the blank line ending the response head.
///
/// Reads one byte at a time so tunneled bytes stay in the socket.
async fn read_head(stream: &mut TcpStream) -> Result<Vec<u8>, ClientError> {
    let mut head = Vec::with_capacity(128);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_HEAD_SIZE {
            return Err(ClientError::InvalidResponse(
                "response head too large".to_string(),
            ));
        }
        head.push(stream.read_u8().await?);
    }
    Ok(head)
}
