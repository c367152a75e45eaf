//! Transport primitives consumed by the lifecycle controllers.
//!
//! Each protocol family reaches the network through a narrow connector
//! trait. The manager only ever sees channels: a stream connector hands
//! back an outbound sender plus an inbound receiver, and an RPC connector
//! hands back a channel that can be awaited for readiness and then asked to
//! start a call. Deadlines are enforced by the caller, not the connector.
//!
//! Built-in implementations:
//! - [`ws::WsConnector`] - WebSocket via `tokio-tungstenite`
//! - [`rpc::JsonLinesConnector`] - JSON-lines RPC over TCP

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use tether_core::{CallDescriptor, ProxyResolution, RpcCallType};

pub mod rpc;
pub mod tunnel;
pub mod ws;

pub use rpc::JsonLinesConnector;
pub use ws::WsConnector;

/// Buffer size of the channels connectors hand back.
pub const LINK_BUFFER: usize = 64;

// ============================================================================
// Errors
// ============================================================================

/// Failures raised by connectors and channels.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("proxy tunnel failed: {0}")]
    Tunnel(String),

    #[error("invalid target: {0}")]
    InvalidTarget(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn connect<E: std::fmt::Display>(err: E) -> Self {
        Self::Connect(err.to_string())
    }
}

// ============================================================================
// Stream transports
// ============================================================================

/// Parameters for opening a stream transport.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub subprotocols: Vec<String>,
    pub resolution: ProxyResolution,
}

/// Frames written to a stream transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    /// Close the transport with a close code and reason; nothing may follow.
    Close { code: u16, reason: String },
}

/// Items read from a stream transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Binary(Vec<u8>),
    /// The peer closed the transport.
    Closed { code: Option<u16>, reason: String },
    /// The transport failed.
    Error(String),
}

impl Inbound {
    /// True for items after which nothing else is delivered.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed { .. } | Self::Error(_))
    }
}

/// An open stream transport.
///
/// Dropping `outbound` closes the transport without a close frame.
#[derive(Debug)]
pub struct StreamLink {
    pub outbound: mpsc::Sender<Outbound>,
    pub inbound: mpsc::Receiver<Inbound>,
    /// Sub-protocol selected by the server, if any.
    pub protocol: Option<String>,
}

/// Opens stream transports (WebSocket-style).
#[async_trait]
pub trait StreamConnector: Send + Sync + 'static {
    async fn connect(&self, request: StreamRequest) -> Result<StreamLink, TransportError>;
}

// ============================================================================
// RPC transports
// ============================================================================

/// Parameters for establishing an RPC channel.
#[derive(Debug, Clone)]
pub struct ChannelRequest {
    pub host: String,
    pub port: u16,
    /// Environment-style proxy hints (`grpc_proxy`, `https_proxy`).
    pub proxy_hints: BTreeMap<String, String>,
    pub tls_bypass: bool,
}

/// Parameters for starting one call on a ready channel.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub descriptor: CallDescriptor,
    pub call_type: RpcCallType,
    pub metadata: BTreeMap<String, String>,
}

/// Events produced by an in-flight call.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEvent {
    /// A response message.
    Message(serde_json::Value),
    /// The call finished with a non-OK status.
    Status { code: i64, details: String },
    /// The call finished successfully.
    End,
}

/// An in-flight call.
///
/// Dropping `requests` half-closes the client side; dropping the whole
/// value cancels the call.
#[derive(Debug)]
pub struct RpcCall {
    pub requests: mpsc::Sender<serde_json::Value>,
    pub responses: mpsc::Receiver<RpcEvent>,
}

/// A channel to one RPC endpoint.
#[async_trait]
pub trait RpcChannel: Send {
    /// Resolves once the endpoint is reachable. Callers bound this with
    /// their own deadline.
    async fn ready(&mut self) -> Result<(), TransportError>;

    /// Starts a call; the channel is consumed and released with the call.
    async fn start_call(self: Box<Self>, request: CallRequest) -> Result<RpcCall, TransportError>;
}

/// Creates RPC channels.
#[async_trait]
pub trait RpcConnector: Send + Sync + 'static {
    async fn channel(&self, request: ChannelRequest) -> Result<Box<dyn RpcChannel>, TransportError>;
}

// ============================================================================
// Connector set
// ============================================================================

/// The connectors a manager uses, one per transport family.
#[derive(Clone)]
pub struct Connectors {
    pub stream: Arc<dyn StreamConnector>,
    pub rpc: Arc<dyn RpcConnector>,
}

impl Connectors {
    pub fn new(stream: Arc<dyn StreamConnector>, rpc: Arc<dyn RpcConnector>) -> Self {
        Self { stream, rpc }
    }
}

impl Default for Connectors {
    fn default() -> Self {
        Self {
            stream: Arc::new(WsConnector::new()),
            rpc: Arc::new(JsonLinesConnector::new()),
        }
    }
}
