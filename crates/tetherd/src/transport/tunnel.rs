//! HTTP CONNECT tunnelling through a forward proxy.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use percent_encoding::percent_decode_str;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use tether_core::{ProxyAuth, ProxyInfo};

use super::TransportError;

/// Upper bound on the proxy's response head.
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// Opens a TCP connection to `host:port`, tunnelling through `proxy` when
/// one is given.
pub async fn open_tcp(
    host: &str,
    port: u16,
    proxy: Option<&ProxyInfo>,
) -> Result<TcpStream, TransportError> {
    match proxy {
        Some(proxy) => connect_via_proxy(proxy, host, port).await,
        None => TcpStream::connect((host, port))
            .await
            .map_err(TransportError::connect),
    }
}

/// Connects to the proxy and issues `CONNECT host:port`.
///
/// Returns the raw stream positioned after the proxy's response head.
pub async fn connect_via_proxy(
    proxy: &ProxyInfo,
    host: &str,
    port: u16,
) -> Result<TcpStream, TransportError> {
    if !proxy.scheme.eq_ignore_ascii_case("http") {
        return Err(TransportError::Tunnel(format!(
            "unsupported proxy scheme '{}'",
            proxy.scheme
        )));
    }

    let mut stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
        .await
        .map_err(|e| TransportError::Tunnel(format!("{}: {e}", proxy.authority())))?;

    let request = connect_request(host, port, proxy.auth.as_ref());
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| TransportError::Tunnel(e.to_string()))?;

    let head = read_response_head(&mut stream).await?;
    let status = parse_status(&head)?;
    if !(200..300).contains(&status) {
        return Err(TransportError::Tunnel(format!(
            "proxy refused CONNECT with status {status}"
        )));
    }

    debug!(proxy = %proxy.authority(), target = %format!("{host}:{port}"), "Proxy tunnel established");
    Ok(stream)
}

fn connect_request(host: &str, port: u16, auth: Option<&ProxyAuth>) -> String {
    let authority = if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = auth {
        let credentials = STANDARD.encode(format!("{}:{}", auth.username, auth.password));
        request.push_str(&format!("Proxy-Authorization: Basic {credentials}\r\n"));
    }
    request.push_str("\r\n");
    request
}

/// Reads byte-by-byte up to the blank line so no tunnelled bytes are
/// consumed.
async fn read_response_head(stream: &mut TcpStream) -> Result<String, TransportError> {
    let mut head = Vec::with_capacity(128);
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(TransportError::Tunnel("proxy response too large".to_string()));
        }
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| TransportError::Tunnel(e.to_string()))?;
        if n == 0 {
            return Err(TransportError::Tunnel(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).into_owned())
}

fn parse_status(head: &str) -> Result<u16, TransportError> {
    head.lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| TransportError::Tunnel(format!("malformed proxy response: {head:?}")))
}

/// Decodes a percent-encoded userinfo component.
fn decode_userinfo(raw: &str, part: &str) -> Result<String, TransportError> {
    percent_decode_str(part)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|e| TransportError::Tunnel(format!("{raw}: invalid credentials: {e}")))
}

/// Parses a proxy URL such as `http://user:pw@proxy:3128`. Credentials are
/// percent-decoded.
pub fn parse_proxy_url(raw: &str) -> Result<ProxyInfo, TransportError> {
    let url = Url::parse(raw).map_err(|e| TransportError::Tunnel(format!("{raw}: {e}")))?;
    let host = url
        .host_str()
        .ok_or_else(|| TransportError::Tunnel(format!("{raw}: missing host")))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| TransportError::Tunnel(format!("{raw}: missing port")))?;
    let auth = if url.username().is_empty() {
        None
    } else {
        Some(ProxyAuth {
            username: decode_userinfo(raw, url.username())?,
            password: decode_userinfo(raw, url.password().unwrap_or_default())?,
        })
    };
    Ok(ProxyInfo {
        scheme: url.scheme().to_string(),
        host,
        port,
        auth,
    })
}
