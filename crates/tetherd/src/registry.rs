//! Session registry: the authoritative map from session id to session
//! state plus its live transport.
//!
//! Owned by the manager actor; never shared, never locked.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::{Payload, SendOutcome, Session, SessionId, SessionState};

use crate::manager::ManagerError;
use crate::transport::Outbound;

/// Reply slot for a unary call awaiting its response.
pub type PendingReply = oneshot::Sender<Result<SendOutcome, ManagerError>>;

/// Where a session's writes go once its transport is up.
#[derive(Debug)]
pub enum TransportSink {
    Stream(mpsc::Sender<Outbound>),
    Rpc(mpsc::Sender<serde_json::Value>),
}

/// A session's transport, from connect attempt until release.
///
/// `generation` ties the transport to the events its task posts; anything
/// carrying another generation is stale.
#[derive(Debug)]
pub struct TransportHandle {
    pub generation: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    pub sink: Option<TransportSink>,
}

impl TransportHandle {
    pub fn new(generation: u64, cancel: CancellationToken, task: JoinHandle<()>) -> Self {
        Self {
            generation,
            cancel,
            task,
            sink: None,
        }
    }

    /// Sends a close frame and lets the task wind down on its own.
    pub fn close(self, code: u16, reason: &str) {
        match self.sink {
            Some(TransportSink::Stream(tx)) => {
                let frame = Outbound::Close {
                    code,
                    reason: reason.to_string(),
                };
                if tx.try_send(frame).is_err() {
                    self.cancel.cancel();
                }
            }
            _ => self.cancel.cancel(),
        }
    }

    /// Queues a close frame for the peer, then stops the forwarding task so
    /// nothing this transport receives afterwards reaches the manager.
    pub fn detach(self, code: u16, reason: &str) {
        if let Some(TransportSink::Stream(tx)) = &self.sink {
            let _ = tx.try_send(Outbound::Close {
                code,
                reason: reason.to_string(),
            });
        }
        self.abort();
    }

    /// Cancels the task and drops the transport immediately.
    pub fn abort(self) {
        self.cancel.cancel();
        self.task.abort();
    }
}

/// Registry entry: the session plus what only the manager may touch.
#[derive(Debug)]
pub struct SessionEntry {
    pub session: Session,
    pub transport: Option<TransportHandle>,
    pub pending_reply: Option<PendingReply>,
    /// Response held until a unary call's status arrives.
    pub unary_response: Option<Payload>,
}

impl SessionEntry {
    pub fn new(session: Session) -> Self {
        Self {
            session,
            transport: None,
            pending_reply: None,
            unary_response: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Returns the transport if it belongs to `generation`.
    pub fn transport_for(&mut self, generation: u64) -> Option<&mut TransportHandle> {
        self.transport
            .as_mut()
            .filter(|t| t.generation == generation)
    }

    pub fn has_transport(&self) -> bool {
        self.transport.is_some()
    }
}

/// Map of all known sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<SessionId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a session. Creation is pure bookkeeping and never fails; an
    /// existing entry under the same id is returned to the caller.
    pub fn create(&mut self, session: Session) -> Option<SessionEntry> {
        self.entries
            .insert(session.id.clone(), SessionEntry::new(session))
    }

    pub fn get(&self, id: &SessionId) -> Option<&SessionEntry> {
        self.entries.get(id)
    }

    pub fn get_mut(&mut self, id: &SessionId) -> Option<&mut SessionEntry> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &SessionId) -> Option<SessionEntry> {
        self.entries.remove(id)
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &SessionEntry> {
        self.entries.values()
    }

    pub fn ids(&self) -> Vec<SessionId> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ProtocolKind, SessionConfig, SessionSpec};

    fn session(id: &str) -> Session {
        let spec = SessionSpec::new(ProtocolKind::Stream, "wss://x.example.com", SessionConfig::default());
        Session::new(SessionId::new(id), spec)
    }

    #[test]
    fn test_create_get_remove() {
        let mut registry = SessionRegistry::new();
        assert!(registry.create(session("a")).is_none());
        assert!(registry.contains(&SessionId::new("a")));
        assert_eq!(registry.len(), 1);

        let entry = registry.get(&SessionId::new("a")).unwrap();
        assert_eq!(entry.state(), SessionState::Configured);
        assert!(!entry.has_transport());

        assert!(registry.remove(&SessionId::new("a")).is_some());
        assert!(registry.is_empty());
        assert!(registry.remove(&SessionId::new("a")).is_none());
    }

    #[test]
    fn test_create_replaces_existing() {
        let mut registry = SessionRegistry::new();
        registry.create(session("a"));
        assert!(registry.create(session("a")).is_some());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_generation_filter() {
        let mut registry = SessionRegistry::new();
        registry.create(session("a"));
        let entry = registry.get_mut(&SessionId::new("a")).unwrap();
        let task = tokio::spawn(async {});
        entry.transport = Some(TransportHandle::new(3, CancellationToken::new(), task));

        assert!(entry.transport_for(2).is_none());
        assert!(entry.transport_for(3).is_some());
    }

    #[tokio::test]
    async fn test_close_sends_close_frame() {
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(async {});
        let mut handle = TransportHandle::new(1, CancellationToken::new(), task);
        handle.sink = Some(TransportSink::Stream(tx));
        handle.close(1000, "user");
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: 1000,
                reason: "user".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_detach_sends_close_and_stops_forwarding() {
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(std::future::pending::<()>());
        let mut handle = TransportHandle::new(1, cancel.clone(), task);
        handle.sink = Some(TransportSink::Stream(tx));
        handle.detach(4001, "resubscribed");

        assert!(cancel.is_cancelled());
        assert_eq!(
            rx.recv().await,
            Some(Outbound::Close {
                code: 4001,
                reason: "resubscribed".to_string()
            })
        );
        // The handle's sender is gone with it
        assert_eq!(rx.recv().await, None);
    }
}
