//! GraphQL subscriptions over a stream transport (`graphql-transport-ws`).
//!
//! `Configured → Connecting → Open → {Completed | Closed}`. The session is
//! only `Open` once the server acknowledges `connection_init`; the
//! `subscribe` message is sent right after the ack.
//!
//! Subscription ids are derived from target + query, so configuring the
//! same subscription again disposes the existing session first and creates
//! the replacement after a short grace delay.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::{
    ActivateOutcome, ConfigureOutcome, ControlOutcome, ErrorInfo, ErrorSource, MessageRecord,
    Payload, SessionId, SessionSpec, SessionState, CLOSE_NORMAL, CLOSE_REPLACED,
};

use super::stream;
use crate::manager::{ManagerContext, ManagerError, PendingResubscribe, Responder};
use crate::registry::TransportSink;
use crate::sweeper::TimerKind;
use crate::transport::{Inbound, Outbound};

/// WebSocket sub-protocol spoken by subscription sessions.
pub const GRAPHQL_TRANSPORT_WS: &str = "graphql-transport-ws";

/// Messages this client writes.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ConnectionInit {
        payload: Value,
    },
    Subscribe {
        id: String,
        payload: SubscribePayload,
    },
    Complete {
        id: String,
    },
    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        payload: Option<Value>,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubscribePayload {
    query: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    variables: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    operation_name: Option<String>,
}

/// Messages the server writes.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    ConnectionAck,
    Next {
        id: String,
        payload: Value,
    },
    Error {
        id: String,
        payload: Value,
    },
    Complete {
        id: String,
    },
    Ping {
        #[serde(default)]
        payload: Option<Value>,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

fn encode(message: &ClientMessage) -> String {
    // Serializing these plain structs cannot fail.
    serde_json::to_string(message).unwrap_or_default()
}

// ============================================================================
// Caller operations
// ============================================================================

/// Replaces an existing (or already pending) subscription with the same id.
///
/// The old session is disposed now; the new one is created when the grace
/// timer fires, and `respond_to` is answered then.
pub fn resubscribe(
    ctx: &mut ManagerContext,
    session_id: SessionId,
    spec: SessionSpec,
    respond_to: Responder<ConfigureOutcome>,
) {
    dispose(ctx, &session_id);

    let pending = ctx
        .pending_resubscribe
        .entry(session_id.clone())
        .or_insert_with(|| PendingResubscribe {
            spec: spec.clone(),
            waiters: Vec::new(),
        });
    pending.spec = spec;
    pending.waiters.push(respond_to);

    let grace = ctx.settings.resubscribe_grace();
    ctx.sweeper
        .schedule(&session_id, TimerKind::Resubscribe, grace, ctx.events.clone());
    info!(session_id = %session_id, grace_ms = grace.as_millis() as u64, "Subscription re-create scheduled");
}

/// Creates the replacement subscription once the grace delay has passed.
pub fn on_resubscribe_due(ctx: &mut ManagerContext, session_id: &SessionId) {
    let Some(pending) = ctx.pending_resubscribe.remove(session_id) else {
        return;
    };
    ctx.create_session(session_id.clone(), pending.spec);
    for waiter in pending.waiters {
        let _ = waiter.send(Ok(ConfigureOutcome::Created {
            session_id: session_id.clone(),
        }));
    }
}

pub fn activate(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ActivateOutcome, ManagerError> {
    let state = ctx.entry(session_id)?.state();
    if state == SessionState::Completed {
        let replayed = ctx.replay(session_id);
        return Ok(ActivateOutcome::Attached { state, replayed });
    }
    stream::activate_with(ctx, session_id, &[GRAPHQL_TRANSPORT_WS])
}

/// Tells the server the operation is done, then closes like a stream.
pub fn close(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    reason: String,
) -> Result<ControlOutcome, ManagerError> {
    if let Some(tx) = open_sink(ctx, session_id) {
        let complete = ClientMessage::Complete {
            id: session_id.to_string(),
        };
        let _ = tx.try_send(Outbound::Text(encode(&complete)));
    }
    stream::close(ctx, session_id, reason)
}

/// Disposes a session ahead of its replacement: transport closed, a close
/// record broadcast, the log cleared and the purge timer dropped.
fn dispose(ctx: &mut ManagerContext, session_id: &SessionId) {
    let Some(mut entry) = ctx.registry.remove(session_id) else {
        return;
    };
    if let Some(reply) = entry.pending_reply.take() {
        let _ = reply.send(Err(ManagerError::NotFound(session_id.clone())));
    }
    if let Some(transport) = entry.transport.take() {
        transport.detach(CLOSE_REPLACED, "resubscribed");
        ctx.record(
            session_id,
            MessageRecord::close(Some(CLOSE_REPLACED), "resubscribed"),
        );
    }
    ctx.sweeper.cancel(session_id, TimerKind::Purge);
    ctx.log.clear(session_id);
    info!(session_id = %session_id, "Subscription disposed for re-create");
}

// ============================================================================
// Transport callbacks
// ============================================================================

/// The socket is up: start the protocol handshake. The session stays
/// `Connecting` until the server acknowledges.
pub fn on_opened(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
    protocol: Option<String>,
) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    let Some(transport) = entry.transport_for(generation) else {
        return;
    };
    if protocol.as_deref().is_some_and(|p| p != GRAPHQL_TRANSPORT_WS) {
        warn!(session_id = %session_id, protocol = ?protocol, "Server selected unexpected sub-protocol");
    }

    let init = ClientMessage::ConnectionInit {
        payload: Value::Object(serde_json::Map::new()),
    };
    let sent = outbound.try_send(Outbound::Text(encode(&init))).is_ok();
    transport.sink = Some(TransportSink::Stream(outbound));
    if !sent {
        ctx.fail(
            session_id,
            ManagerError::Transport("connection_init not delivered".to_string()),
            SessionState::Closed,
        );
        return;
    }
    debug!(session_id = %session_id, "connection_init sent");
}

pub fn on_inbound(ctx: &mut ManagerContext, session_id: &SessionId, generation: u64, inbound: Inbound) {
    let Some(state) = stream::live_state(ctx, session_id, generation) else {
        return;
    };
    match inbound {
        Inbound::Text(text) => on_message(ctx, session_id, state, &text),
        Inbound::Binary(bytes) => {
            debug!(session_id = %session_id, bytes = bytes.len(), "Ignoring binary frame on subscription");
        }
        Inbound::Closed { code, reason } => stream::on_peer_closed(ctx, session_id, code, reason),
        Inbound::Error(message) => {
            ctx.fail(session_id, ManagerError::Transport(message), SessionState::Closed)
        }
    }
}

fn on_message(ctx: &mut ManagerContext, session_id: &SessionId, state: SessionState, text: &str) {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Malformed subscription message");
            return;
        }
    };
    let operation_id = session_id.to_string();

    match message {
        ServerMessage::ConnectionAck => on_ack(ctx, session_id, state),
        ServerMessage::Next { id, payload } if id == operation_id => {
            // Partial results carry both `data` and `errors`; keep both.
            let errors = graphql_errors(&payload);
            if errors.is_none() || has_data(&payload) {
                stream::deliver(ctx, session_id, state, Payload::Json(payload));
            }
            if let Some(errors) = errors {
                let info = ErrorInfo::new(ErrorSource::Protocol, "subscription returned errors")
                    .with_details(errors);
                ctx.record(session_id, MessageRecord::error(info));
            }
        }
        ServerMessage::Error { id, payload } if id == operation_id => {
            if let Some(transport) = ctx
                .registry
                .get_mut(session_id)
                .and_then(|e| e.transport.take())
            {
                transport.close(CLOSE_NORMAL, "subscription error");
            }
            let details = payload.to_string();
            let info = ErrorInfo::new(ErrorSource::Protocol, "subscription failed").with_details(payload);
            ctx.fail_with(
                session_id,
                info,
                ManagerError::Protocol { code: 0, details },
                SessionState::Closed,
            );
        }
        ServerMessage::Complete { id } if id == operation_id => {
            let Some(entry) = ctx.registry.get_mut(session_id) else {
                return;
            };
            if let Some(transport) = entry.transport.take() {
                transport.close(CLOSE_NORMAL, "complete");
            }
            entry.session.state = SessionState::Completed;
            info!(session_id = %session_id, "Subscription completed by server");
            ctx.record(session_id, MessageRecord::complete());
            ctx.schedule_purge(session_id);
        }
        ServerMessage::Ping { payload } => {
            if let Some(tx) = sink(ctx, session_id) {
                let _ = tx.try_send(Outbound::Text(encode(&ClientMessage::Pong { payload })));
            }
        }
        ServerMessage::Pong => {}
        other => debug!(session_id = %session_id, message = ?other, "Ignoring subscription message"),
    }
}

/// `connection_ack`: the session opens and the operation is subscribed.
fn on_ack(ctx: &mut ManagerContext, session_id: &SessionId, state: SessionState) {
    if state != SessionState::Connecting {
        debug!(session_id = %session_id, state = %state, "Duplicate connection_ack");
        return;
    }
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    let Some(query) = entry.session.spec.config.subscription.clone() else {
        return;
    };
    entry.session.state = SessionState::Open;
    info!(session_id = %session_id, "Subscription opened");
    ctx.record(session_id, MessageRecord::open());

    let payload = SubscribePayload {
        query: query.query,
        variables: query.variables,
        operation_name: query.operation_name,
    };
    let subscribe = ClientMessage::Subscribe {
        id: session_id.to_string(),
        payload,
    };
    let text = encode(&subscribe);
    let Some(tx) = sink(ctx, session_id) else {
        return;
    };
    if tx.try_send(Outbound::Text(text.clone())).is_err() {
        ctx.fail(
            session_id,
            ManagerError::Transport("subscribe not delivered".to_string()),
            SessionState::Closed,
        );
        return;
    }
    let recorded = serde_json::from_str(&text).map_or(Payload::Text(text), Payload::Json);
    ctx.record(session_id, MessageRecord::data_out(recorded));
}

/// Returns a non-empty `errors` array from a `next` payload.
fn graphql_errors(payload: &Value) -> Option<Value> {
    payload
        .get("errors")
        .filter(|errors| errors.as_array().is_some_and(|a| !a.is_empty()))
        .cloned()
}

fn has_data(payload: &Value) -> bool {
    payload.get("data").is_some_and(|data| !data.is_null())
}

fn sink(ctx: &ManagerContext, session_id: &SessionId) -> Option<mpsc::Sender<Outbound>> {
    match ctx
        .registry
        .get(session_id)?
        .transport
        .as_ref()?
        .sink
        .as_ref()?
    {
        TransportSink::Stream(tx) => Some(tx.clone()),
        TransportSink::Rpc(_) => None,
    }
}

fn open_sink(ctx: &ManagerContext, session_id: &SessionId) -> Option<mpsc::Sender<Outbound>> {
    let state = ctx.state_of(session_id)?;
    matches!(state, SessionState::Open | SessionState::Paused)
        .then(|| sink(ctx, session_id))
        .flatten()
}
