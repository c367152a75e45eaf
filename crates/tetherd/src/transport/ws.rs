//! WebSocket stream connector built on `tokio-tungstenite`.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, WebSocketStream};
use tracing::{debug, warn};
use url::Url;

use super::tunnel::open_tcp;
use super::{Inbound, Outbound, StreamConnector, StreamLink, StreamRequest, TransportError, LINK_BUFFER};

const SUBPROTOCOL_HEADER: &str = "sec-websocket-protocol";

/// Opens WebSocket connections, optionally through an HTTP CONNECT proxy.
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, request: StreamRequest) -> Result<StreamLink, TransportError> {
        let url = Url::parse(&request.url)
            .map_err(|e| TransportError::InvalidTarget(format!("{}: {e}", request.url)))?;
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::InvalidTarget(format!("{}: missing host", request.url)))?
            .trim_matches(|c| c == '[' || c == ']')
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| TransportError::InvalidTarget(format!("{}: missing port", request.url)))?;

        let tcp = open_tcp(&host, port, request.resolution.proxy.as_ref()).await?;
        let handshake = build_request(&request)?;
        let connector = tls_connector(request.resolution.tls_bypass)?;

        let (ws, response) = client_async_tls_with_config(handshake, tcp, None, connector)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let protocol = response
            .headers()
            .get(SUBPROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        debug!(url = %request.url, protocol = ?protocol, "WebSocket connected");

        let (outbound_tx, outbound_rx) = mpsc::channel(LINK_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(LINK_BUFFER);
        tokio::spawn(pump(ws, outbound_rx, inbound_tx));

        Ok(StreamLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
            protocol,
        })
    }
}

/// Builds the client handshake request with custom headers and requested
/// sub-protocols.
fn build_request(request: &StreamRequest) -> Result<Request, TransportError> {
    let mut handshake = request
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::InvalidTarget(e.to_string()))?;

    let headers = handshake.headers_mut();
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::Handshake(format!("header '{name}': {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TransportError::Handshake(format!("header '{name}': {e}")))?;
        headers.insert(name, value);
    }

    if !request.subprotocols.is_empty() {
        let joined = request.subprotocols.join(", ");
        let value = HeaderValue::from_str(&joined)
            .map_err(|e| TransportError::Handshake(format!("sub-protocols: {e}")))?;
        headers.insert(HeaderName::from_static(SUBPROTOCOL_HEADER), value);
    }

    Ok(handshake)
}

/// A permissive TLS connector when certificate validation is disabled,
/// otherwise the library default.
fn tls_connector(tls_bypass: bool) -> Result<Option<Connector>, TransportError> {
    if !tls_bypass {
        return Ok(None);
    }
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map_err(|e| TransportError::Handshake(e.to_string()))?;
    Ok(Some(Connector::NativeTls(tls)))
}

/// Moves frames between the socket and the link channels until either side
/// finishes.
async fn pump<S>(
    ws: WebSocketStream<S>,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Inbound>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let message = match frame {
                    Some(Outbound::Text(text)) => Message::text(text),
                    Some(Outbound::Binary(bytes)) => Message::binary(bytes),
                    Some(Outbound::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                            debug!(error = %e, "Close frame not delivered");
                        }
                        break;
                    }
                    None => {
                        let _ = sink.close().await;
                        break;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    let _ = inbound.send(Inbound::Error(e.to_string())).await;
                    break;
                }
            }
            item = stream.next() => {
                let forwarded = match item {
                    Some(Ok(Message::Text(text))) => Inbound::Text(text.as_str().to_owned()),
                    Some(Ok(Message::Binary(bytes))) => Inbound::Binary(bytes.to_vec()),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (Some(u16::from(frame.code)), frame.reason.as_str().to_owned()),
                            None => (None, String::new()),
                        };
                        let _ = inbound.send(Inbound::Closed { code, reason }).await;
                        break;
                    }
                    // Ping/pong are answered by the library.
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket read failed");
                        let _ = inbound.send(Inbound::Error(e.to_string())).await;
                        break;
                    }
                    None => {
                        let _ = inbound
                            .send(Inbound::Closed {
                                code: None,
                                reason: "connection ended".to_string(),
                            })
                            .await;
                        break;
                    }
                };
                if inbound.send(forwarded).await.is_err() {
                    break;
                }
            }
        }
    }
}
