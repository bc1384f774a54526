//! HTTP `CONNECT` traversal

use siptun_proto::ServerEndpoint;
use siptun_transport::{HttpProxy, TransportError, TransportResult};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Upper bound on the proxy response head
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Ask the proxy to open a raw tunnel to `target` over `stream`.
///
/// The response head is consumed byte by byte so that no byte belonging to
/// the TLS handshake is read past the blank line.
pub async fn http_connect<S>(
    stream: &mut S,
    target: &ServerEndpoint,
    proxy: &HttpProxy,
) -> TransportResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = target.to_string();
    let mut request = format!(
        "CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\nProxy-Connection: keep-alive\r\n"
    );
    if let Some(authorization) = proxy.authorization() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", authorization));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::ProxyError(
                "Proxy response head too large".to_string(),
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(TransportError::ProxyError(
                "Proxy closed the connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(&head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(TransportError::ProxyError(
                "Incomplete proxy response".to_string(),
            ))
        }
        Err(e) => {
            return Err(TransportError::ProxyError(format!(
                "Malformed proxy response: {}",
                e
            )))
        }
    }

    let code = response.code.unwrap_or(0);
    if !(200..300).contains(&code) {
        return Err(TransportError::ProxyError(format!(
            "Proxy refused CONNECT to {}: {} {}",
            authority,
            code,
            response.reason.unwrap_or("")
        )));
    }

    debug!(
        "HTTP proxy {}:{} opened tunnel to {}",
        proxy.host, proxy.port, authority
    );
    Ok(())
}
