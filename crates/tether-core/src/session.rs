//! Session domain entities and value objects.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{DomainError, DomainResult};

/// Default Message Log capacity for stream and RPC sessions.
pub const DEFAULT_LOG_CAPACITY: usize = 50;

/// Message Log capacity for subscription sessions.
pub const SUBSCRIPTION_LOG_CAPACITY: usize = 100;

/// Prefix used for ids derived from a subscription's target and query.
pub const SUBSCRIPTION_ID_PREFIX: &str = "sub-";

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Unique identifier for a managed session.
///
/// Generated at configuration time (UUID v7) and stable for the session's
/// lifetime. Subscription sessions use an id derived from target + query so
/// that re-subscribing to the same feed addresses the same session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Creates a SessionId from an existing string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh, time-ordered session id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Derives the id of a subscription from its target and query text.
    ///
    /// The same target and query always map to the same id.
    pub fn for_subscription(target: &str, query: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(target.as_bytes());
        hasher.update(b"\n");
        hasher.update(query.trim().as_bytes());
        let digest = hasher.finalize();

        let mut id = String::with_capacity(SUBSCRIPTION_ID_PREFIX.len() + 32);
        id.push_str(SUBSCRIPTION_ID_PREFIX);
        for byte in digest.iter().take(16) {
            id.push_str(&format!("{byte:02x}"));
        }
        Self(id)
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a shortened display form (first 8 characters).
    #[must_use]
    pub fn short(&self) -> &str {
        self.0.get(..8).unwrap_or(&self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Protocol Kinds
// ============================================================================

/// The protocol a session speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolKind {
    /// WebSocket-style bidirectional message stream.
    Stream,
    /// Single request, single response RPC.
    RpcUnary,
    /// Single request, many responses.
    RpcServerStream,
    /// Many requests, single response.
    RpcClientStream,
    /// Many requests, many responses.
    RpcBidiStream,
    /// GraphQL subscription over a WebSocket.
    Subscription,
}

/// RPC call multiplicity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcCallType {
    Unary,
    ServerStreaming,
    ClientStreaming,
    BidiStreaming,
}

impl RpcCallType {
    /// Returns true if the client writes more than one message.
    #[must_use]
    pub fn is_client_streaming(&self) -> bool {
        matches!(self, Self::ClientStreaming | Self::BidiStreaming)
    }

    /// Wire name of the call type.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server_streaming",
            Self::ClientStreaming => "client_streaming",
            Self::BidiStreaming => "bidi_streaming",
        }
    }
}

impl fmt::Display for RpcCallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle controller family a protocol kind belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolFamily {
    Stream,
    Rpc(RpcCallType),
    Subscription,
}

impl ProtocolKind {
    /// Returns the controller family for this kind.
    #[must_use]
    pub fn family(&self) -> ProtocolFamily {
        match self {
            Self::Stream => ProtocolFamily::Stream,
            Self::RpcUnary => ProtocolFamily::Rpc(RpcCallType::Unary),
            Self::RpcServerStream => ProtocolFamily::Rpc(RpcCallType::ServerStreaming),
            Self::RpcClientStream => ProtocolFamily::Rpc(RpcCallType::ClientStreaming),
            Self::RpcBidiStream => ProtocolFamily::Rpc(RpcCallType::BidiStreaming),
            Self::Subscription => ProtocolFamily::Subscription,
        }
    }

    /// Returns the RPC call type, if this is an RPC kind.
    #[must_use]
    pub fn call_type(&self) -> Option<RpcCallType> {
        match self.family() {
            ProtocolFamily::Rpc(call_type) => Some(call_type),
            _ => None,
        }
    }

    /// Returns true for the RPC kinds.
    #[must_use]
    pub fn is_rpc(&self) -> bool {
        self.call_type().is_some()
    }

    /// Default Message Log capacity for sessions of this kind.
    #[must_use]
    pub fn default_log_capacity(&self) -> usize {
        match self {
            Self::Subscription => SUBSCRIPTION_LOG_CAPACITY,
            _ => DEFAULT_LOG_CAPACITY,
        }
    }

    /// Returns the display label for this kind.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Stream => "stream",
            Self::RpcUnary => "rpc-unary",
            Self::RpcServerStream => "rpc-server-stream",
            Self::RpcClientStream => "rpc-client-stream",
            Self::RpcBidiStream => "rpc-bidi-stream",
            Self::Subscription => "subscription",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// RPC method being invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallDescriptor {
    /// Fully-qualified service name (e.g. "helloworld.Greeter")
    pub service: String,
    /// Method name (e.g. "SayHello")
    pub method: String,
}

impl CallDescriptor {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// Returns "service/method".
    pub fn path(&self) -> String {
        format!("{}/{}", self.service, self.method)
    }
}

/// GraphQL subscription operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub variables: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_name: Option<String>,
}

impl SubscriptionQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            variables: serde_json::Value::Null,
            operation_name: None,
        }
    }

    #[must_use]
    pub fn with_variables(mut self, variables: serde_json::Value) -> Self {
        self.variables = variables;
        self
    }
}

/// Immutable creation parameters of a session.
///
/// Which fields matter depends on the protocol kind: streams use `headers`
/// and `subprotocols`, RPC kinds require `call` (headers become call
/// metadata), subscriptions require `subscription`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Request headers (streams, subscriptions) or call metadata (RPC)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,

    /// Requested WebSocket sub-protocols
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subprotocols: Vec<String>,

    /// RPC method to call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call: Option<CallDescriptor>,

    /// GraphQL subscription operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionQuery>,

    /// Caller-supplied fingerprint for duplicate suppression
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

/// Everything needed to create a session: kind, target and configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSpec {
    pub kind: ProtocolKind,
    pub target: String,
    #[serde(default)]
    pub config: SessionConfig,
}

impl SessionSpec {
    pub fn new(kind: ProtocolKind, target: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            kind,
            target: target.into(),
            config,
        }
    }

    /// Checks that the target and protocol-specific parameters are usable.
    ///
    /// # Errors
    ///
    /// Returns a `DomainError` describing the first problem found.
    pub fn validate(&self) -> DomainResult<()> {
        let target = self.target.trim();
        if target.is_empty() {
            return Err(DomainError::MissingField {
                field: "target".to_string(),
            });
        }

        match self.kind.family() {
            ProtocolFamily::Stream | ProtocolFamily::Subscription => {
                let url = Url::parse(target).map_err(|e| DomainError::InvalidTarget {
                    target: target.to_string(),
                    reason: e.to_string(),
                })?;
                if !matches!(url.scheme(), "ws" | "wss") {
                    return Err(DomainError::InvalidTarget {
                        target: target.to_string(),
                        reason: format!("unsupported scheme '{}', expected ws or wss", url.scheme()),
                    });
                }
                if url.host_str().is_none() {
                    return Err(DomainError::InvalidTarget {
                        target: target.to_string(),
                        reason: "missing host".to_string(),
                    });
                }
            }
            ProtocolFamily::Rpc(_) => {
                rpc_authority(target)?;
                let call = self.config.call.as_ref().ok_or_else(|| DomainError::MissingField {
                    field: "call".to_string(),
                })?;
                if call.service.trim().is_empty() {
                    return Err(DomainError::MissingField {
                        field: "call.service".to_string(),
                    });
                }
                if call.method.trim().is_empty() {
                    return Err(DomainError::MissingField {
                        field: "call.method".to_string(),
                    });
                }
            }
        }

        if self.kind == ProtocolKind::Subscription {
            let query = self
                .config
                .subscription
                .as_ref()
                .map(|s| s.query.trim())
                .unwrap_or_default();
            if query.is_empty() {
                return Err(DomainError::MissingField {
                    field: "subscription.query".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Returns the id a new session for this spec should receive.
    pub fn derive_id(&self) -> SessionId {
        match (&self.kind, &self.config.subscription) {
            (ProtocolKind::Subscription, Some(sub)) => {
                SessionId::for_subscription(self.target.trim(), &sub.query)
            }
            _ => SessionId::generate(),
        }
    }
}

/// Splits an RPC target ("host:port", or a URL with host and port) into
/// its host and port.
///
/// # Errors
///
/// Returns `DomainError::InvalidTarget` if either part is missing.
pub fn rpc_authority(target: &str) -> DomainResult<(String, u16)> {
    let target = target.trim();
    let has_scheme = target.contains("://");
    let candidate = if has_scheme {
        target.to_string()
    } else {
        format!("http://{target}")
    };

    let url = Url::parse(&candidate).map_err(|e| DomainError::InvalidTarget {
        target: target.to_string(),
        reason: e.to_string(),
    })?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| DomainError::InvalidTarget {
            target: target.to_string(),
            reason: "missing host".to_string(),
        })?;
    // A bare "host" has no scheme to imply a default port.
    let port = if has_scheme {
        url.port_or_known_default()
    } else {
        url.port()
    };
    let port = port.ok_or_else(|| DomainError::InvalidTarget {
            target: target.to_string(),
            reason: "missing port".to_string(),
        })?;

    Ok((host.trim_matches(|c| c == '[' || c == ']').to_string(), port))
}

// ============================================================================
// Session State
// ============================================================================

/// Lifecycle state of a session.
///
/// Streams: Configured → Connecting → Open ⇄ Paused → Closed.
/// Unary RPC: Configured → Requesting → Completed | Errored.
/// Streaming RPC: Configured → Open → Closed.
/// Subscriptions: Configured → Connecting → Open → Completed | Closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Configured,
    Connecting,
    Open,
    Paused,
    Requesting,
    Completed,
    Errored,
    Closed,
}

impl SessionState {
    /// Returns the display label for this state.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Configured => "configured",
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Paused => "paused",
            Self::Requesting => "requesting",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Closed => "closed",
        }
    }

    /// Returns true once the session can no longer carry traffic.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Closed)
    }

    /// Returns true while a transport or call is (being) established.
    #[must_use]
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Open | Self::Paused | Self::Requesting
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ============================================================================
// Session Entity
// ============================================================================

/// A session's identity, configuration and lifecycle bookkeeping.
///
/// The live transport handle is owned by the registry entry wrapping this
/// value, not by the session itself.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub spec: SessionSpec,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,

    /// Set by a deliberate close; a later activate replays instead of
    /// reconnecting until the flag is cleared.
    pub explicitly_closed: bool,

    /// Generation of the latest transport attempt. Callbacks carrying any
    /// other generation belong to a superseded transport and are ignored.
    pub generation: u64,
}

impl Session {
    pub fn new(id: SessionId, spec: SessionSpec) -> Self {
        Self {
            id,
            spec,
            state: SessionState::Configured,
            created_at: Utc::now(),
            explicitly_closed: false,
            generation: 0,
        }
    }

    pub fn kind(&self) -> ProtocolKind {
        self.spec.kind
    }

    pub fn target(&self) -> &str {
        &self.spec.target
    }

    /// Adopts the generation issued for a new transport attempt.
    ///
    /// Generations come from a manager-wide counter, so a session re-created
    /// under an existing id never reuses a number its predecessor held.
    pub fn begin_generation(&mut self, generation: u64) {
        self.generation = generation;
    }
}

// ============================================================================
// Session View (for status queries and the wire)
// ============================================================================

/// Read-only snapshot of a session returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    pub kind: ProtocolKind,
    pub target: String,
    pub state: SessionState,
    pub buffered_records: usize,
    pub explicitly_closed: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl SessionView {
    /// Builds a view from a session plus its Message Log statistics.
    pub fn from_session(
        session: &Session,
        buffered_records: usize,
        last_record_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: session.id.clone(),
            kind: session.kind(),
            target: session.target().to_string(),
            state: session.state,
            buffered_records,
            explicitly_closed: session.explicitly_closed,
            created_at: session.created_at,
            last_activity_at: last_record_at.unwrap_or(session.created_at),
        }
    }
}
