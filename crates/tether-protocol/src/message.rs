//! Protocol message types for daemon communication.

use crate::version::ProtocolVersion;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tether_core::{
    ActivateOutcome, ConfigureOutcome, ConnectionEvent, ControlOutcome, MessageRecord,
    NetworkSettings, Payload, SendOutcome, SessionId, SessionSpec, SessionView,
};

/// Message types that can be sent by clients to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    /// Client handshake/connection request
    Connect {
        /// Client identifier (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
    },

    /// Register a session description
    Configure { spec: SessionSpec },

    /// Attach to a session, connecting or replaying history
    Activate { session_id: SessionId },

    /// Send a payload on a session
    Send {
        session_id: SessionId,
        payload: Payload,
    },

    Pause {
        session_id: SessionId,
        #[serde(default)]
        reason: String,
    },

    Resume { session_id: SessionId },

    Close {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Cancel an in-flight RPC call
    Cancel { session_id: SessionId },

    /// Half-close the request side of a client/bidi streaming call
    End { session_id: SessionId },

    ClearClosedState { session_id: SessionId },

    /// Request one session's status
    Status { session_id: SessionId },

    /// Request current session list
    ListSessions,

    /// Request buffered records, optionally only those after `since`
    Records {
        session_id: SessionId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        since: Option<DateTime<Utc>>,
    },

    /// Replace the proxy/TLS settings used by subsequent connections
    UpdateNetworkSettings { settings: NetworkSettings },

    /// Subscribe to session events
    Subscribe {
        /// Optional filter by session ID
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<SessionId>,
    },

    /// Unsubscribe from events
    Unsubscribe,

    /// Ping to check connection
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },

    /// Client disconnecting gracefully
    Disconnect,
}

/// Messages sent from client to daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Echoed back on the matching response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,

    /// Message payload
    #[serde(flatten)]
    pub message: MessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: MessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            request_id: None,
            message,
        }
    }

    /// Tags the message with a request id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: u64) -> Self {
        self.request_id = Some(request_id);
        self
    }

    /// Creates a connect message.
    pub fn connect(client_id: Option<String>) -> Self {
        Self::new(MessageType::Connect { client_id })
    }

    pub fn configure(spec: SessionSpec) -> Self {
        Self::new(MessageType::Configure { spec })
    }

    pub fn activate(session_id: SessionId) -> Self {
        Self::new(MessageType::Activate { session_id })
    }

    pub fn send(session_id: SessionId, payload: Payload) -> Self {
        Self::new(MessageType::Send {
            session_id,
            payload,
        })
    }

    pub fn pause(session_id: SessionId, reason: impl Into<String>) -> Self {
        Self::new(MessageType::Pause {
            session_id,
            reason: reason.into(),
        })
    }

    pub fn resume(session_id: SessionId) -> Self {
        Self::new(MessageType::Resume { session_id })
    }

    pub fn close(session_id: SessionId, reason: Option<String>) -> Self {
        Self::new(MessageType::Close { session_id, reason })
    }

    pub fn cancel(session_id: SessionId) -> Self {
        Self::new(MessageType::Cancel { session_id })
    }

    pub fn end(session_id: SessionId) -> Self {
        Self::new(MessageType::End { session_id })
    }

    pub fn clear_closed_state(session_id: SessionId) -> Self {
        Self::new(MessageType::ClearClosedState { session_id })
    }

    pub fn status(session_id: SessionId) -> Self {
        Self::new(MessageType::Status { session_id })
    }

    /// Creates a list sessions request.
    pub fn list_sessions() -> Self {
        Self::new(MessageType::ListSessions)
    }

    pub fn records(session_id: SessionId, since: Option<DateTime<Utc>>) -> Self {
        Self::new(MessageType::Records { session_id, since })
    }

    pub fn update_network_settings(settings: NetworkSettings) -> Self {
        Self::new(MessageType::UpdateNetworkSettings { settings })
    }

    /// Creates a subscribe message.
    pub fn subscribe(session_id: Option<SessionId>) -> Self {
        Self::new(MessageType::Subscribe { session_id })
    }

    pub fn unsubscribe() -> Self {
        Self::new(MessageType::Unsubscribe)
    }

    /// Creates a ping message.
    pub fn ping(seq: u64) -> Self {
        Self::new(MessageType::Ping { seq })
    }

    /// Creates a disconnect message.
    pub fn disconnect() -> Self {
        Self::new(MessageType::Disconnect)
    }
}

/// Body of a successful response to a session operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResponseBody {
    Configured(ConfigureOutcome),
    Activated(ActivateOutcome),
    Sent(SendOutcome),
    Control(ControlOutcome),
    Status(Box<SessionView>),
    Records(Vec<MessageRecord>),
    SettingsUpdated,
}

/// Messages sent from daemon to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Connection accepted
    Connected {
        /// Daemon's protocol version
        protocol_version: ProtocolVersion,
        /// Assigned client ID
        client_id: String,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    /// Successful result of a session operation
    Response {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        body: ResponseBody,
    },

    /// Full session list response
    SessionList {
        /// All current sessions
        sessions: Vec<SessionView>,
    },

    /// A session event pushed to subscribers
    Event { event: Box<ConnectionEvent> },

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Error response
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    /// Creates a connected response.
    pub fn connected(client_id: String) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            client_id,
        }
    }

    /// Creates a rejected response.
    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn response(request_id: Option<u64>, body: ResponseBody) -> Self {
        Self::Response { request_id, body }
    }

    /// Creates a session list response.
    pub fn session_list(sessions: Vec<SessionView>) -> Self {
        Self::SessionList { sessions }
    }

    pub fn event(event: ConnectionEvent) -> Self {
        Self::Event {
            event: Box::new(event),
        }
    }

    /// Creates a pong response.
    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an error response.
    pub fn error(message: &str) -> Self {
        Self::Error {
            request_id: None,
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with code, echoing the request id.
    pub fn error_with_code(request_id: Option<u64>, message: &str, code: &str) -> Self {
        Self::Error {
            request_id,
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}
