//! Unix socket server for the tether daemon.
//!
//! Every accepted client runs its own [`ConnectionHandler`] task. Clients
//! that send `subscribe` land in the shared [`SubscribersMap`], and a single
//! [`EventFanout`] task forwards each [`ConnectionEvent`] the manager
//! publishes to the subscribers whose session filter matches.
//!
//! ```text
//!   UnixListener ──accept──▶ ConnectionHandler ──commands──▶ ManagerHandle
//!                                  │ (subscribe)                   │
//!                                  ▼                               │ ConnectionEvent
//!                            SubscribersMap ◀──── EventFanout ◀────┘
//! ```
//!
//! Replayed history travels the same path as live records; clients tell
//! them apart by `is_replayed`. A fan-out that falls behind the broadcast
//! channel skips events, and clients recover them from the session log.
//!
//! Nothing here panics: socket and encoding errors are logged and the
//! affected client is dropped.

mod connection;

pub use connection::{
    ConnectionError, ConnectionHandler, Subscriber, SubscriberWriter, SubscribersMap,
    MAX_SUBSCRIBERS,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::RwLock;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tether_core::ConnectionEvent;
use tether_protocol::DaemonMessage;

use crate::manager::ManagerHandle;

/// Default socket path
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/tether.sock";

/// Unix socket front end for a [`ManagerHandle`].
pub struct DaemonServer {
    socket_path: PathBuf,
    manager: ManagerHandle,
    cancel_token: CancellationToken,

    /// Clients receiving events, keyed by client id.
    subscribers: SubscribersMap,
}

impl DaemonServer {
    pub fn new(
        socket_path: impl Into<PathBuf>,
        manager: ManagerHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            socket_path: socket_path.into(),
            manager,
            cancel_token,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a server with the default socket path.
    pub fn with_default_path(manager: ManagerHandle, cancel_token: CancellationToken) -> Self {
        Self::new(DEFAULT_SOCKET_PATH, manager, cancel_token)
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Serves clients until the cancellation token fires.
    ///
    /// On shutdown the client tasks are aborted, the fan-out stops and the
    /// socket file is removed. Sessions are left to the manager.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = bind_socket(&self.socket_path)?;
        info!(socket = %self.socket_path.display(), "Daemon server listening");

        let fanout = EventFanout::new(self.manager.subscribe(), Arc::clone(&self.subscribers));
        let fanout_task = tokio::spawn(fanout.run(self.cancel_token.clone()));

        let mut clients: JoinSet<Option<String>> = JoinSet::new();
        let mut accepted: u64 = 0;

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => break,

                result = listener.accept() => match result {
                    Ok((stream, _addr)) => {
                        clients.spawn(self.handler_for(stream, accepted).run());
                        accepted += 1;
                    }
                    Err(e) => error!(error = %e, "Failed to accept connection"),
                },

                Some(finished) = clients.join_next(), if !clients.is_empty() => {
                    self.forget_client(finished).await;
                }
            }
        }

        info!(open_clients = clients.len(), "Server shutdown requested");
        clients.shutdown().await;
        if let Err(e) = fanout_task.await {
            warn!(error = %e, "Event fan-out ended abnormally");
        }
        self.cleanup().await;
        Ok(())
    }

    fn handler_for(&self, stream: UnixStream, connection_number: u64) -> ConnectionHandler {
        let (reader, writer) = stream.into_split();
        ConnectionHandler::new(
            reader,
            writer,
            self.manager.clone(),
            Arc::clone(&self.subscribers),
            connection_number,
        )
    }

    /// Drops the subscription of a client whose task has ended.
    async fn forget_client(&self, finished: Result<Option<String>, JoinError>) {
        match finished {
            Ok(Some(client_id)) => {
                if self.subscribers.write().await.remove(&client_id).is_some() {
                    debug!(client_id = %client_id, "Removed disconnected subscriber");
                }
            }
            Ok(None) => {}
            // The fan-out prunes the subscriber on its next failed write.
            Err(e) => warn!(error = %e, "Client task ended abnormally"),
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    async fn cleanup(&self) {
        self.subscribers.write().await.clear();

        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove socket file"
                );
            }
        }

        info!("Server cleanup complete");
    }
}

/// Binds the listener, replacing a stale socket file and creating the
/// parent directory when missing.
fn bind_socket(path: &Path) -> Result<UnixListener, ServerError> {
    let setup = |e: std::io::Error| ServerError::SocketSetup {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    if path.exists() {
        std::fs::remove_file(path).map_err(setup)?;
    }
    if let Some(parent) = path.parent().filter(|parent| !parent.exists()) {
        std::fs::create_dir_all(parent).map_err(setup)?;
    }
    UnixListener::bind(path).map_err(setup)
}

/// Forwards manager events to subscribed clients.
pub struct EventFanout {
    events: broadcast::Receiver<ConnectionEvent>,
    subscribers: SubscribersMap,
}

impl EventFanout {
    pub fn new(events: broadcast::Receiver<ConnectionEvent>, subscribers: SubscribersMap) -> Self {
        Self {
            events,
            subscribers,
        }
    }

    /// Delivers events until cancelled or until the manager goes away.
    pub async fn run(mut self, cancel_token: CancellationToken) {
        loop {
            let received = tokio::select! {
                _ = cancel_token.cancelled() => break,
                received = self.events.recv() => received,
            };

            match received {
                Ok(event) => {
                    self.deliver(event).await;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event fan-out lagged; skipped events remain in session logs");
                }
                Err(RecvError::Closed) => {
                    debug!("Manager event channel closed");
                    break;
                }
            }
        }
        debug!("Event fan-out stopped");
    }

    /// Writes `event` to every subscriber whose filter matches and removes
    /// the ones that can no longer be written to. Returns how many clients
    /// received it.
    pub async fn deliver(&self, event: ConnectionEvent) -> usize {
        let session_id = event.session_id.clone();
        let line = match serde_json::to_string(&DaemonMessage::event(event)) {
            Ok(line) => line,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Failed to encode event");
                return 0;
            }
        };

        let mut delivered = 0;
        let mut unreachable = Vec::new();
        {
            let subs = self.subscribers.read().await;
            for (client_id, sub) in subs.iter().filter(|(_, sub)| sub.wants(&session_id)) {
                match connection::write_line(&sub.writer, &line).await {
                    Ok(()) => delivered += 1,
                    Err(e) => {
                        debug!(client_id = %client_id, error = %e, "Event delivery failed");
                        unreachable.push(client_id.clone());
                    }
                }
            }
        }

        if !unreachable.is_empty() {
            let mut subs = self.subscribers.write().await;
            for client_id in unreachable {
                subs.remove(&client_id);
                debug!(client_id = %client_id, "Removed unreachable subscriber");
            }
        }
        delivered
    }
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}
