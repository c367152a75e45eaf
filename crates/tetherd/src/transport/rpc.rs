//! JSON-lines RPC connector over TCP.
//!
//! One TCP connection carries one call. Each line is a JSON object:
//!
//! ```text
//! client → {"type":"call","service":"pkg.Svc","method":"Do","call_type":"unary","metadata":{}}
//! client → {"type":"message","payload":{...}}     (zero or more)
//! client → {"type":"end"}                         (half-close)
//! server → {"type":"message","payload":{...}}     (zero or more)
//! server → {"type":"status","code":0,"details":""}
//! ```
//!
//! A status code of 0 ends the call successfully; anything else is a
//! failure carrying the code and details.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::debug;

use tether_core::proxy::GRPC_PROXY_ENV;
use tether_core::ProxyInfo;

use super::tunnel::{open_tcp, parse_proxy_url};
use super::{
    CallRequest, ChannelRequest, RpcCall, RpcChannel, RpcConnector, RpcEvent, TransportError,
    LINK_BUFFER,
};

/// Maximum length of one framed line.
pub const MAX_LINE_LENGTH: usize = 1024 * 1024;

/// Delay between connection attempts while waiting for readiness.
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Status code reported when the server hangs up without a status line.
pub const STATUS_UNAVAILABLE: i64 = 14;

/// Lines written by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Call {
        service: String,
        method: String,
        call_type: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        metadata: BTreeMap<String, String>,
    },
    Message {
        payload: serde_json::Value,
    },
    End,
}

/// Lines written by the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        payload: serde_json::Value,
    },
    Status {
        code: i64,
        #[serde(default)]
        details: String,
    },
}

/// Creates [`JsonLinesChannel`]s.
#[derive(Debug, Default, Clone)]
pub struct JsonLinesConnector;

impl JsonLinesConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RpcConnector for JsonLinesConnector {
    async fn channel(&self, request: ChannelRequest) -> Result<Box<dyn RpcChannel>, TransportError> {
        let proxy = request
            .proxy_hints
            .get(GRPC_PROXY_ENV)
            .map(|raw| parse_proxy_url(raw))
            .transpose()?;
        Ok(Box::new(JsonLinesChannel {
            host: request.host,
            port: request.port,
            proxy,
            stream: None,
        }))
    }
}

/// A lazily connected channel to one endpoint.
pub struct JsonLinesChannel {
    host: String,
    port: u16,
    proxy: Option<ProxyInfo>,
    stream: Option<TcpStream>,
}

#[async_trait]
impl RpcChannel for JsonLinesChannel {
    /// Retries until a connection succeeds; callers bound the wait.
    async fn ready(&mut self) -> Result<(), TransportError> {
        loop {
            match open_tcp(&self.host, self.port, self.proxy.as_ref()).await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    return Ok(());
                }
                Err(e) => {
                    debug!(host = %self.host, port = self.port, error = %e, "RPC channel not ready, retrying");
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn start_call(self: Box<Self>, request: CallRequest) -> Result<RpcCall, TransportError> {
        let stream = match self.stream {
            Some(stream) => stream,
            None => open_tcp(&self.host, self.port, self.proxy.as_ref()).await?,
        };
        let mut framed = Framed::new(stream, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));

        let header = ClientFrame::Call {
            service: request.descriptor.service.clone(),
            method: request.descriptor.method.clone(),
            call_type: request.call_type.as_str().to_string(),
            metadata: request.metadata,
        };
        framed
            .send(encode(&header)?)
            .await
            .map_err(|e| TransportError::connect(e))?;

        let (requests_tx, requests_rx) = mpsc::channel(LINK_BUFFER);
        let (responses_tx, responses_rx) = mpsc::channel(LINK_BUFFER);
        tokio::spawn(drive_call(framed, requests_rx, responses_tx));

        Ok(RpcCall {
            requests: requests_tx,
            responses: responses_rx,
        })
    }
}

fn encode(frame: &ClientFrame) -> Result<String, TransportError> {
    serde_json::to_string(frame).map_err(|e| TransportError::Handshake(e.to_string()))
}

/// Relays request messages out and response lines in until the server
/// sends a status, the connection drops or the caller goes away.
async fn drive_call(
    framed: Framed<TcpStream, LinesCodec>,
    mut requests: mpsc::Receiver<serde_json::Value>,
    responses: mpsc::Sender<RpcEvent>,
) {
    let (mut sink, mut lines) = framed.split();
    let mut half_closed = false;

    loop {
        tokio::select! {
            _ = responses.closed() => break,
            request = requests.recv(), if !half_closed => {
                let frame = match request {
                    Some(payload) => ClientFrame::Message { payload },
                    None => {
                        half_closed = true;
                        ClientFrame::End
                    }
                };
                let line = match encode(&frame) {
                    Ok(line) => line,
                    Err(e) => {
                        let _ = responses.send(unavailable(e.to_string())).await;
                        break;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    let _ = responses.send(unavailable(e.to_string())).await;
                    break;
                }
            }
            line = lines.next() => {
                let event = match line {
                    Some(Ok(line)) => match serde_json::from_str::<ServerFrame>(&line) {
                        Ok(ServerFrame::Message { payload }) => RpcEvent::Message(payload),
                        Ok(ServerFrame::Status { code: 0, .. }) => RpcEvent::End,
                        Ok(ServerFrame::Status { code, details }) => RpcEvent::Status { code, details },
                        Err(e) => unavailable(format!("malformed response line: {e}")),
                    },
                    Some(Err(e)) => unavailable(e.to_string()),
                    None => unavailable("connection closed before status".to_string()),
                };
                let terminal = !matches!(event, RpcEvent::Message(_));
                if responses.send(event).await.is_err() || terminal {
                    break;
                }
            }
        }
    }
}

fn unavailable(details: String) -> RpcEvent {
    RpcEvent::Status {
        code: STATUS_UNAVAILABLE,
        details,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{CallDescriptor, RpcCallType};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn call_request() -> CallRequest {
        CallRequest {
            descriptor: CallDescriptor::new("demo.Echo", "Say"),
            call_type: RpcCallType::Unary,
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_client_frame_shape() {
        let line = encode(&ClientFrame::End).unwrap();
        assert_eq!(line, r#"{"type":"end"}"#);
    }

    #[tokio::test]
    async fn test_unary_call_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (read, mut write) = socket.into_split();
            let mut lines = BufReader::new(read).lines();
            let header = lines.next_line().await.unwrap().unwrap();
            let message = lines.next_line().await.unwrap().unwrap();
            let end = lines.next_line().await.unwrap().unwrap();
            write
                .write_all(b"{\"type\":\"message\",\"payload\":{\"reply\":\"hi\"}}\n{\"type\":\"status\",\"code\":0}\n")
                .await
                .unwrap();
            (header, message, end)
        });

        let request = ChannelRequest {
            host: "127.0.0.1".to_string(),
            port,
            proxy_hints: BTreeMap::new(),
            tls_bypass: false,
        };
        let mut channel = JsonLinesConnector::new().channel(request).await.unwrap();
        channel.ready().await.unwrap();
        let mut call = channel.start_call(call_request()).await.unwrap();
        call.requests
            .send(serde_json::json!({"name": "tether"}))
            .await
            .unwrap();
        drop(call.requests);

        assert_eq!(
            call.responses.recv().await,
            Some(RpcEvent::Message(serde_json::json!({"reply": "hi"})))
        );
        assert_eq!(call.responses.recv().await, Some(RpcEvent::End));

        let (header, message, end) = server.await.unwrap();
        assert!(header.contains("\"service\":\"demo.Echo\""));
        assert!(header.contains("\"call_type\":\"unary\""));
        assert!(message.contains("tether"));
        assert_eq!(end, r#"{"type":"end"}"#);
    }

    #[tokio::test]
    async fn test_ready_waits_for_listener() {
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let request = ChannelRequest {
            host: "127.0.0.1".to_string(),
            port,
            proxy_hints: BTreeMap::new(),
            tls_bypass: false,
        };
        let mut channel = JsonLinesConnector::new().channel(request).await.unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(300), channel.ready()).await;
        assert!(waited.is_err(), "readiness should keep waiting on a closed port");
    }

    #[tokio::test]
    async fn test_bad_proxy_hint_rejected() {
        let mut hints = BTreeMap::new();
        hints.insert(GRPC_PROXY_ENV.to_string(), "::not-a-url".to_string());
        let request = ChannelRequest {
            host: "127.0.0.1".to_string(),
            port: 1,
            proxy_hints: hints,
            tls_bypass: false,
        };
        assert!(JsonLinesConnector::new().channel(request).await.is_err());
    }
}
