//! Client interface for interacting with the ManagerActor.
//!
//! The `ManagerHandle` provides a cheap-to-clone interface for sending
//! commands to the manager actor and subscribing to connection events.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Channel errors are mapped to `ManagerError::ChannelClosed`

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};

use tether_core::{
    ActivateOutcome, ConfigureOutcome, ConnectionEvent, ControlOutcome, MessageRecord,
    NetworkSettings, Payload, SendOutcome, SessionId, SessionSpec, SessionView,
};

use super::commands::{ManagerCommand, ManagerError, Responder};

/// Reason recorded when `close` is called without one.
pub const DEFAULT_CLOSE_REASON: &str = "user";

// ============================================================================
// Manager Handle
// ============================================================================

/// Handle for interacting with the manager actor.
///
/// This is a cheap-to-clone handle that can be shared across tasks.
///
/// # Usage
///
/// ```ignore
/// let handle = manager_handle.clone();
///
/// let outcome = handle.configure(spec).await?;
/// if let Some(id) = outcome.session_id() {
///     handle.activate(id.clone()).await?;
/// }
///
/// let mut rx = handle.subscribe();
/// while let Ok(event) = rx.recv().await {
///     // Handle event
/// }
/// ```
#[derive(Clone)]
pub struct ManagerHandle {
    /// Command sender to the actor
    sender: mpsc::Sender<ManagerCommand>,

    /// Event broadcaster for subscribing to updates
    event_sender: broadcast::Sender<ConnectionEvent>,
}

impl ManagerHandle {
    pub fn new(
        sender: mpsc::Sender<ManagerCommand>,
        event_sender: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        Self {
            sender,
            event_sender,
        }
    }

    /// Sends a command built around a fresh responder and awaits the reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(Responder<T>) -> ManagerCommand,
    ) -> Result<T, ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| ManagerError::ChannelClosed)?;
        rx.await.map_err(|_| ManagerError::ChannelClosed)?
    }

    /// Validate a session description and register it.
    ///
    /// # Errors
    ///
    /// - `ManagerError::Configuration` if the description is unusable
    /// - `ManagerError::ChannelClosed` if the actor has shut down
    pub async fn configure(&self, spec: SessionSpec) -> Result<ConfigureOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::Configure {
            spec: Box::new(spec),
            respond_to,
        })
        .await
    }

    /// Connect the session, or replay its history to observers.
    ///
    /// # Errors
    ///
    /// - `ManagerError::NotFound` if the session doesn't exist
    /// - `ManagerError::ChannelClosed` if the actor has shut down
    pub async fn activate(&self, session_id: SessionId) -> Result<ActivateOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::Activate {
            session_id,
            respond_to,
        })
        .await
    }

    /// Send a payload on the session.
    ///
    /// For unary RPC sessions this resolves when the call finishes, with
    /// the response or the call's error.
    pub async fn send(
        &self,
        session_id: SessionId,
        payload: Payload,
    ) -> Result<SendOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::Send {
            session_id,
            payload,
            respond_to,
        })
        .await
    }

    pub async fn pause(
        &self,
        session_id: SessionId,
        reason: impl Into<String>,
    ) -> Result<ControlOutcome, ManagerError> {
        let reason = reason.into();
        self.request(|respond_to| ManagerCommand::Pause {
            session_id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn resume(&self, session_id: SessionId) -> Result<ControlOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::Resume {
            session_id,
            respond_to,
        })
        .await
    }

    /// Deliberately close the session. A later `activate` replays history
    /// instead of reconnecting, until `clear_closed_state` is called.
    pub async fn close(
        &self,
        session_id: SessionId,
        reason: Option<String>,
    ) -> Result<ControlOutcome, ManagerError> {
        let reason = reason.unwrap_or_else(|| DEFAULT_CLOSE_REASON.to_string());
        self.request(|respond_to| ManagerCommand::Close {
            session_id,
            reason,
            respond_to,
        })
        .await
    }

    pub async fn cancel(&self, session_id: SessionId) -> Result<ControlOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::Cancel {
            session_id,
            respond_to,
        })
        .await
    }

    /// Half-close a client-streaming or bidirectional RPC call.
    pub async fn end(&self, session_id: SessionId) -> Result<ControlOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::End {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn clear_closed_state(
        &self,
        session_id: SessionId,
    ) -> Result<ControlOutcome, ManagerError> {
        self.request(|respond_to| ManagerCommand::ClearClosedState {
            session_id,
            respond_to,
        })
        .await
    }

    pub async fn status(&self, session_id: SessionId) -> Result<SessionView, ManagerError> {
        self.request(|respond_to| ManagerCommand::Status {
            session_id,
            respond_to,
        })
        .await
    }

    /// Get all sessions, oldest first.
    ///
    /// Returns an empty vector if the actor has shut down.
    pub async fn list(&self) -> Vec<SessionView> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(ManagerCommand::List { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Read the session's Message Log, optionally only records strictly
    /// newer than `since`.
    pub async fn records(
        &self,
        session_id: SessionId,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<MessageRecord>, ManagerError> {
        self.request(|respond_to| ManagerCommand::Records {
            session_id,
            since,
            respond_to,
        })
        .await
    }

    /// Replace the network settings used by subsequent connections.
    pub async fn update_network_settings(
        &self,
        settings: NetworkSettings,
    ) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::UpdateNetworkSettings {
                settings: Box::new(settings),
                respond_to: tx,
            })
            .await
            .map_err(|_| ManagerError::ChannelClosed)?;
        rx.await.map_err(|_| ManagerError::ChannelClosed)
    }

    /// Trigger an inactivity sweep now (fire-and-forget).
    pub async fn sweep(&self) -> Result<(), ManagerError> {
        self.sender
            .send(ManagerCommand::Sweep)
            .await
            .map_err(|_| ManagerError::ChannelClosed)
    }

    /// Close every session and stop the actor.
    ///
    /// Resolves once the actor has closed all transports.
    pub async fn shutdown(&self) -> Result<(), ManagerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| ManagerError::ChannelClosed)?;
        rx.await.map_err(|_| ManagerError::ChannelClosed)
    }

    /// Subscribe to connection events.
    ///
    /// Returns a receiver for live and replayed events. Slow receivers
    /// miss events (`RecvError::Lagged`) rather than blocking the actor.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_sender.subscribe()
    }

    /// Returns true while the actor is accepting commands.
    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
