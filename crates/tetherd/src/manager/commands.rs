//! Manager actor commands, errors, and internal task events.
//!
//! This module defines the message types for communicating with the `ManagerActor`:
//! - `ManagerCommand`: Requests sent through a `ManagerHandle`
//! - `ManagerError`: Failures returned to callers
//! - `TaskEvent`: Callbacks posted by transport and timer tasks
//!
//! All types are designed for async message passing and follow the panic-free policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use tether_core::{
    ActivateOutcome, ConfigureOutcome, ControlOutcome, DomainError, MessageRecord,
    NetworkSettings, Payload, SendOutcome, SessionId, SessionSpec, SessionState, SessionView,
};

use crate::sweeper::TimerKind;
use crate::transport::{Inbound, Outbound, RpcEvent, TransportError};

/// Response channel carried by every request command.
pub type Responder<T> = oneshot::Sender<Result<T, ManagerError>>;

// ============================================================================
// Manager Commands
// ============================================================================

/// Commands sent to the manager actor.
///
/// Each request carries a oneshot channel for the response. `Send` on a
/// unary RPC session is answered only when the call finishes; every other
/// command is answered before the actor moves on.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Validate a session description and register it.
    Configure {
        spec: Box<SessionSpec>,
        respond_to: Responder<ConfigureOutcome>,
    },

    /// Open the session's transport, or replay its history.
    Activate {
        session_id: SessionId,
        respond_to: Responder<ActivateOutcome>,
    },

    Send {
        session_id: SessionId,
        payload: Payload,
        respond_to: Responder<SendOutcome>,
    },

    Pause {
        session_id: SessionId,
        reason: String,
        respond_to: Responder<ControlOutcome>,
    },

    Resume {
        session_id: SessionId,
        respond_to: Responder<ControlOutcome>,
    },

    Close {
        session_id: SessionId,
        reason: String,
        respond_to: Responder<ControlOutcome>,
    },

    Cancel {
        session_id: SessionId,
        respond_to: Responder<ControlOutcome>,
    },

    /// Half-close the client side of a streaming call.
    End {
        session_id: SessionId,
        respond_to: Responder<ControlOutcome>,
    },

    ClearClosedState {
        session_id: SessionId,
        respond_to: Responder<ControlOutcome>,
    },

    Status {
        session_id: SessionId,
        respond_to: Responder<SessionView>,
    },

    List {
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    /// Read the Message Log without emitting replay events.
    Records {
        session_id: SessionId,
        since: Option<DateTime<Utc>>,
        respond_to: Responder<Vec<MessageRecord>>,
    },

    /// Replace the network settings used for new connections.
    UpdateNetworkSettings {
        settings: Box<NetworkSettings>,
        respond_to: oneshot::Sender<()>,
    },

    /// Run one inactivity sweep. Fire-and-forget, sent by the sweep task.
    Sweep,

    /// Close everything and stop the actor.
    Shutdown { respond_to: oneshot::Sender<()> },
}

// ============================================================================
// Task Events
// ============================================================================

/// Callbacks from spawned transport and timer tasks.
///
/// Transport events carry the generation of the transport that produced
/// them so the actor can discard callbacks from a superseded connection.
#[derive(Debug)]
pub enum TaskEvent {
    StreamOpened {
        session_id: SessionId,
        generation: u64,
        outbound: mpsc::Sender<Outbound>,
        protocol: Option<String>,
    },

    StreamInbound {
        session_id: SessionId,
        generation: u64,
        inbound: Inbound,
    },

    /// The connect attempt or channel readiness failed.
    ConnectFailed {
        session_id: SessionId,
        generation: u64,
        error: ManagerError,
    },

    /// An RPC call was issued on a ready channel.
    RpcStarted {
        session_id: SessionId,
        generation: u64,
    },

    Rpc {
        session_id: SessionId,
        generation: u64,
        event: RpcEvent,
    },

    TimerFired {
        session_id: SessionId,
        kind: TimerKind,
        token: u64,
    },
}

// ============================================================================
// Manager Errors
// ============================================================================

/// Errors returned by manager operations.
#[derive(Debug, Clone, Error)]
pub enum ManagerError {
    /// The session description is unusable; nothing was created.
    #[error("invalid configuration: {0}")]
    Configuration(#[from] DomainError),

    /// The transport did not become ready within the connect timeout.
    #[error("connect timed out after {}ms", .0.as_millis())]
    ConnectTimeout(Duration),

    #[error("transport error: {0}")]
    Transport(String),

    /// RPC status or subscription-level failure.
    #[error("protocol error (code {code}): {details}")]
    Protocol { code: i64, details: String },

    #[error("session not found: {0}")]
    NotFound(SessionId),

    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The call was cancelled before it finished.
    #[error("call cancelled")]
    Cancelled,

    /// The response channel was closed before receiving a response.
    ///
    /// This typically indicates the actor was shut down.
    #[error("manager channel closed")]
    ChannelClosed,
}

impl ManagerError {
    /// Stable identifier for the wire protocol.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Transport(_) => "transport",
            Self::Protocol { .. } => "protocol",
            Self::NotFound(_) => "not_found",
            Self::InvalidState { .. } => "invalid_state",
            Self::Cancelled => "cancelled",
            Self::ChannelClosed => "channel_closed",
        }
    }

    pub fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        Self::InvalidState { operation, state }
    }
}

impl From<TransportError> for ManagerError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_error_display() {
        let err = ManagerError::ConnectTimeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "connect timed out after 1500ms");

        let err = ManagerError::NotFound(SessionId::new("abc"));
        assert_eq!(err.to_string(), "session not found: abc");

        let err = ManagerError::invalid_state("send", SessionState::Paused);
        assert_eq!(err.to_string(), "cannot send while paused");

        let err = ManagerError::Protocol {
            code: 5,
            details: "not found".to_string(),
        };
        assert_eq!(err.to_string(), "protocol error (code 5): not found");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ManagerError::ChannelClosed.code(), "channel_closed");
        assert_eq!(
            ManagerError::from(DomainError::MissingField {
                field: "target".to_string()
            })
            .code(),
            "configuration"
        );
        assert_eq!(ManagerError::from(TransportError::Closed).code(), "transport");
    }

    #[tokio::test]
    async fn test_responder_closed() {
        let (tx, rx) = oneshot::channel::<Result<(), ManagerError>>();
        drop(tx);
        assert!(rx.await.is_err());
    }
}
