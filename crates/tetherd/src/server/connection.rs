//! Connection handler for individual client connections.
//!
//! Each client connection gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Parses incoming messages
//! - Routes session operations to the manager
//! - Sends responses and registers the client for event fan-out
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Connection errors are logged and result in graceful disconnect

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use tether_core::SessionId;
use tether_protocol::{ClientMessage, DaemonMessage, MessageType, ProtocolVersion, ResponseBody};

use crate::manager::{ManagerError, ManagerHandle};

/// Type alias for subscriber writer handle
pub type SubscriberWriter = Arc<Mutex<BufWriter<OwnedWriteHalf>>>;

/// Information about a subscribed client
pub struct Subscriber {
    /// Writer for sending events
    pub writer: SubscriberWriter,

    /// Optional filter for session-specific subscriptions
    pub filter: Option<SessionId>,
}

impl Subscriber {
    /// Whether events for `session_id` pass this subscriber's filter.
    pub fn wants(&self, session_id: &SessionId) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter == session_id)
    }
}

/// Type alias for the subscribers map
pub type SubscribersMap = Arc<RwLock<HashMap<String, Subscriber>>>;

/// Maximum number of concurrent event subscribers
pub const MAX_SUBSCRIBERS: usize = 10;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Read timeout for idle connections (5 minutes)
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Unique identifier for this connection
type ClientId = String;

/// Connection handler for a single client.
///
/// Manages the lifecycle of a client connection including:
/// - Protocol handshake
/// - Message processing loop
/// - Event subscription
/// - Graceful shutdown
pub struct ConnectionHandler {
    /// Buffered reader for incoming messages
    reader: BufReader<OwnedReadHalf>,

    /// Buffered writer for outgoing messages (shared for event broadcast)
    writer: SubscriberWriter,

    /// Handle to the connection manager
    manager: ManagerHandle,

    /// Shared subscribers map for event broadcasting
    subscribers: SubscribersMap,

    /// Unique client identifier (assigned after handshake)
    client_id: Option<ClientId>,

    /// Whether this client is subscribed to events
    subscribed: bool,

    /// Counter for generating client IDs
    connection_number: u64,
}

impl ConnectionHandler {
    /// Creates a new connection handler.
    pub fn new(
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        manager: ManagerHandle,
        subscribers: SubscribersMap,
        connection_number: u64,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            manager,
            subscribers,
            client_id: None,
            subscribed: false,
            connection_number,
        }
    }

    /// Runs the connection handler.
    ///
    /// Performs the handshake, then processes messages until the
    /// connection closes. Returns the client id if the handshake succeeded.
    pub async fn run(mut self) -> Option<ClientId> {
        debug!(connection = self.connection_number, "New client connected");

        match self.handle_handshake().await {
            Ok(()) => {
                info!(client_id = ?self.client_id, "Client handshake completed");
            }
            Err(e) => {
                warn!(
                    connection = self.connection_number,
                    error = %e,
                    "Handshake failed"
                );
                return None;
            }
        }

        let client_id = self.client_id.clone();

        if let Err(e) = self.process_messages().await {
            debug!(
                client_id = ?self.client_id,
                error = %e,
                "Connection closed"
            );
        }

        info!(client_id = ?self.client_id, "Client disconnected");
        client_id
    }

    /// Expects a `Connect` message, validates the protocol version, and
    /// responds with `Connected` or `Rejected`.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = timeout(READ_TIMEOUT, self.read_message())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        let client_version = msg.protocol_version;
        if let Err(e) = ProtocolVersion::CURRENT.check(&client_version) {
            warn!(
                client_version = %client_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string()))
                .await?;
            return Err(ConnectionError::VersionMismatch {
                client: client_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            MessageType::Connect { client_id } => {
                let assigned_id =
                    client_id.unwrap_or_else(|| format!("client-{}", self.connection_number));
                self.client_id = Some(assigned_id.clone());
                self.send_message(DaemonMessage::connected(assigned_id))
                    .await
            }
            other => {
                self.send_message(DaemonMessage::error(
                    "Expected Connect message for handshake",
                ))
                .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    /// Reads and processes messages until the connection closes or an
    /// unrecoverable error occurs.
    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match timeout(READ_TIMEOUT, self.read_message()).await {
                Ok(Ok(msg)) => msg,
                Ok(Err(ConnectionError::Eof)) => {
                    debug!(client_id = ?self.client_id, "Client sent EOF");
                    return Ok(());
                }
                Ok(Err(e @ ConnectionError::ParseError(_))) => {
                    // A malformed line is reported but does not end the connection
                    warn!(client_id = ?self.client_id, error = %e, "Malformed client message");
                    self.send_message(DaemonMessage::error(&e.to_string()))
                        .await?;
                    continue;
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    debug!(client_id = ?self.client_id, "Connection timed out");
                    return Err(ConnectionError::Timeout);
                }
            };

            self.handle_message(msg).await?;
        }
    }

    /// Handles a single client message.
    async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), ConnectionError> {
        let request_id = msg.request_id;
        let manager = &self.manager;

        let result = match msg.message {
            MessageType::Connect { .. } => {
                return self
                    .send_message(DaemonMessage::error("Already connected"))
                    .await;
            }

            MessageType::Configure { spec } => manager
                .configure(spec)
                .await
                .map(ResponseBody::Configured),

            MessageType::Activate { session_id } => manager
                .activate(session_id)
                .await
                .map(ResponseBody::Activated),

            MessageType::Send {
                session_id,
                payload,
            } => {
                // A unary call answers only when it completes, so the reply
                // is written from its own task.
                let manager = manager.clone();
                let writer = Arc::clone(&self.writer);
                tokio::spawn(async move {
                    let result = manager.send(session_id, payload).await;
                    let msg = reply(request_id, result.map(ResponseBody::Sent));
                    if let Err(e) = write_message(&writer, &msg).await {
                        debug!(error = %e, "Failed to write send response");
                    }
                });
                return Ok(());
            }

            MessageType::Pause { session_id, reason } => manager
                .pause(session_id, reason)
                .await
                .map(ResponseBody::Control),

            MessageType::Resume { session_id } => {
                manager.resume(session_id).await.map(ResponseBody::Control)
            }

            MessageType::Close { session_id, reason } => manager
                .close(session_id, reason)
                .await
                .map(ResponseBody::Control),

            MessageType::Cancel { session_id } => {
                manager.cancel(session_id).await.map(ResponseBody::Control)
            }

            MessageType::End { session_id } => {
                manager.end(session_id).await.map(ResponseBody::Control)
            }

            MessageType::ClearClosedState { session_id } => manager
                .clear_closed_state(session_id)
                .await
                .map(ResponseBody::Control),

            MessageType::Status { session_id } => manager
                .status(session_id)
                .await
                .map(|view| ResponseBody::Status(Box::new(view))),

            MessageType::Records { session_id, since } => manager
                .records(session_id, since)
                .await
                .map(ResponseBody::Records),

            MessageType::UpdateNetworkSettings { settings } => manager
                .update_network_settings(settings)
                .await
                .map(|()| ResponseBody::SettingsUpdated),

            MessageType::ListSessions => {
                let sessions = manager.list().await;
                return self.send_message(DaemonMessage::session_list(sessions)).await;
            }

            MessageType::Subscribe { session_id } => {
                return self.handle_subscribe(session_id).await;
            }

            MessageType::Unsubscribe => {
                if let Some(ref client_id) = self.client_id {
                    let mut subs = self.subscribers.write().await;
                    subs.remove(client_id);
                }
                self.subscribed = false;
                debug!(client_id = ?self.client_id, "Client unsubscribed from events");
                return Ok(());
            }

            MessageType::Ping { seq } => {
                return self.send_message(DaemonMessage::pong(seq)).await;
            }

            MessageType::Disconnect => {
                debug!(client_id = ?self.client_id, "Client requested disconnect");
                return Err(ConnectionError::Eof);
            }
        };

        self.send_message(reply(request_id, result)).await
    }

    /// Registers the client for event fan-out, optionally filtered to one
    /// session, and sends the current session list as initial state.
    async fn handle_subscribe(&mut self, filter: Option<SessionId>) -> Result<(), ConnectionError> {
        let Some(client_id) = self.client_id.clone() else {
            return self
                .send_message(DaemonMessage::error("Must connect before subscribing"))
                .await;
        };

        {
            let mut subs = self.subscribers.write().await;
            if subs.len() >= MAX_SUBSCRIBERS && !subs.contains_key(&client_id) {
                drop(subs);
                return self
                    .send_message(DaemonMessage::error(&format!(
                        "Too many subscribers (max: {MAX_SUBSCRIBERS})"
                    )))
                    .await;
            }
            subs.insert(
                client_id.clone(),
                Subscriber {
                    writer: Arc::clone(&self.writer),
                    filter: filter.clone(),
                },
            );
        }
        self.subscribed = true;
        debug!(client_id = %client_id, filter = ?filter, "Client subscribed to events");

        let sessions = self.manager.list().await;
        self.send_message(DaemonMessage::session_list(sessions))
            .await
    }

    /// Reads a single message from the client.
    ///
    /// Lines longer than the size limit are rejected before they are fully
    /// buffered.
    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();
        let limit = (MAX_MESSAGE_SIZE + 1) as u64;

        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            client_id = ?self.client_id,
            request_id = ?msg.request_id,
            "Received message"
        );

        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }

    /// Checks if this client is subscribed to events.
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    /// Returns the client ID (if connected).
    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }
}

/// Builds the response or error message for a manager result.
fn reply(request_id: Option<u64>, result: Result<ResponseBody, ManagerError>) -> DaemonMessage {
    match result {
        Ok(body) => DaemonMessage::response(request_id, body),
        Err(e) => DaemonMessage::error_with_code(request_id, &e.to_string(), e.code()),
    }
}

/// Writes one JSON line to a client within the write timeout.
pub async fn write_message(
    writer: &SubscriberWriter,
    msg: &DaemonMessage,
) -> Result<(), ConnectionError> {
    let json =
        serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;
    write_line(writer, &json).await
}

/// Writes an already-encoded message plus the line terminator.
pub async fn write_line(writer: &SubscriberWriter, json: &str) -> Result<(), ConnectionError> {
    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Read timeout")]
    Timeout,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}
