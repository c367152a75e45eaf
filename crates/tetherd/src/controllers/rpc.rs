//! RPC lifecycle for all four call types.
//!
//! Unary: `Configured → Requesting → Completed | Errored`; the `send` reply
//! is held until the call finishes. Streaming kinds: `Configured → Open →
//! Closed`; the call starts on the first `send` and client-streaming calls
//! half-close on `end`.
//!
//! Requests are queued on an in-process channel before the call is up, so
//! messages sent while the channel is still becoming ready are not lost.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{
    rpc_authority, ActivateOutcome, ControlOutcome, DomainError, MessageRecord, Payload,
    RpcCallType, SendOutcome, SessionId, SessionState, CLOSE_INACTIVITY, CLOSE_NORMAL,
};

use crate::manager::{ManagerContext, ManagerError, Responder, TaskEvent};
use crate::registry::{TransportHandle, TransportSink};
use crate::sweeper::TimerKind;
use crate::transport::rpc::STATUS_UNAVAILABLE;
use crate::transport::{
    CallRequest, ChannelRequest, RpcCall, RpcConnector, RpcEvent, TransportError, LINK_BUFFER,
};

// ============================================================================
// Caller operations
// ============================================================================

/// RPC sessions have nothing to connect ahead of the first request;
/// activation attaches the caller and replays history.
pub fn activate(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ActivateOutcome, ManagerError> {
    let state = ctx.entry(session_id)?.state();
    let replayed = ctx.replay(session_id);
    Ok(ActivateOutcome::Attached { state, replayed })
}

/// Issues a request. Unary replies arrive through `respond_to` once the
/// call completes; every other call type is answered immediately.
pub fn send(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    call_type: RpcCallType,
    payload: Payload,
    respond_to: Responder<SendOutcome>,
) {
    match try_send(ctx, session_id, call_type, payload) {
        Ok(()) if call_type == RpcCallType::Unary => match ctx.registry.get_mut(session_id) {
            Some(entry) => entry.pending_reply = Some(respond_to),
            None => {
                let _ = respond_to.send(Err(ManagerError::NotFound(session_id.clone())));
            }
        },
        Ok(()) => {
            let _ = respond_to.send(Ok(SendOutcome::Sent));
        }
        Err(e) => {
            let _ = respond_to.send(Err(e));
        }
    }
}

fn try_send(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    call_type: RpcCallType,
    payload: Payload,
) -> Result<(), ManagerError> {
    let entry = ctx.entry(session_id)?;
    let state = entry.state();
    if entry.session.explicitly_closed {
        return Err(ManagerError::invalid_state("send", state));
    }
    // None: no call yet. Some(None): a call whose request side is closed.
    let existing = entry.transport.as_ref().map(|t| match &t.sink {
        Some(TransportSink::Rpc(tx)) => Some(tx.clone()),
        _ => None,
    });
    let request = json_payload(&payload)?;

    if call_type.is_client_streaming() {
        let sink = match existing {
            Some(Some(tx)) => tx,
            Some(None) => return Err(ManagerError::invalid_state("send", state)),
            None => start_call(ctx, session_id, call_type)?,
        };
        ctx.record(session_id, MessageRecord::data_out(payload));
        return match sink.try_send(request) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                Err(ManagerError::Transport("request buffer full".to_string()))
            }
            Err(TrySendError::Closed(_)) => Err(ManagerError::Transport("call closed".to_string())),
        };
    }

    // Single-request calls: one request per call, then half-close.
    if existing.is_some() {
        return Err(ManagerError::invalid_state("send", state));
    }
    let sink = start_call(ctx, session_id, call_type)?;
    ctx.record(session_id, MessageRecord::data_out(payload));
    if sink.try_send(request).is_err() {
        return Err(ManagerError::Transport("call closed".to_string()));
    }
    if let Some(transport) = ctx.registry.get_mut(session_id).and_then(|e| e.transport.as_mut()) {
        transport.sink = None;
    }
    if call_type == RpcCallType::Unary {
        ctx.set_state(session_id, SessionState::Requesting);
    }
    Ok(())
}

/// Half-closes a client-streaming call.
pub fn end(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let state = entry.state();
    let streaming = entry
        .session
        .kind()
        .call_type()
        .is_some_and(|t| t.is_client_streaming());
    let Some(transport) = entry.transport.as_mut().filter(|t| t.sink.is_some()) else {
        return Ok(ControlOutcome::NoOp { state });
    };
    if !streaming {
        return Ok(ControlOutcome::NoOp { state });
    }
    transport.sink = None;
    info!(session_id = %session_id, "Client side of call ended");
    Ok(ControlOutcome::Applied)
}

/// Aborts the call. A waiting unary caller gets `Cancelled`.
pub fn cancel(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let Some(transport) = entry.transport.take() else {
        return Ok(ControlOutcome::NoOp { state: entry.state() });
    };
    transport.abort();
    if let Some(reply) = entry.pending_reply.take() {
        let _ = reply.send(Err(ManagerError::Cancelled));
    }
    entry.unary_response = None;
    entry.session.state = SessionState::Closed;

    info!(session_id = %session_id, "Call cancelled");
    ctx.record(session_id, MessageRecord::cancel("cancelled by client"));
    ctx.schedule_purge(session_id);
    Ok(ControlOutcome::Applied)
}

/// Deliberate close of an in-flight call.
pub fn close(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    reason: String,
) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let Some(transport) = entry.transport.take() else {
        return Ok(ControlOutcome::NoOp { state: entry.state() });
    };
    transport.abort();
    if let Some(reply) = entry.pending_reply.take() {
        let _ = reply.send(Err(ManagerError::Cancelled));
    }
    entry.unary_response = None;
    entry.session.state = SessionState::Closed;
    entry.session.explicitly_closed = true;

    info!(session_id = %session_id, reason = %reason, "Call closed");
    ctx.record(session_id, MessageRecord::close(Some(CLOSE_NORMAL), reason));
    ctx.schedule_purge(session_id);
    Ok(ControlOutcome::Applied)
}

pub fn reap(ctx: &mut ManagerContext, session_id: &SessionId) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    let Some(transport) = entry.transport.take() else {
        return;
    };
    transport.abort();
    if let Some(reply) = entry.pending_reply.take() {
        let _ = reply.send(Err(ManagerError::Cancelled));
    }
    entry.session.state = SessionState::Closed;
    ctx.record(
        session_id,
        MessageRecord::close(Some(CLOSE_INACTIVITY), "inactivity timeout"),
    );
}

// ============================================================================
// Transport callbacks
// ============================================================================

pub fn on_started(ctx: &mut ManagerContext, session_id: &SessionId, generation: u64, call_type: RpcCallType) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    if entry.transport_for(generation).is_none() {
        return;
    }
    debug!(session_id = %session_id, generation, call_type = call_type.as_str(), "Call started");
    if call_type != RpcCallType::Unary {
        ctx.record(session_id, MessageRecord::open());
    }
}

pub fn on_event(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    generation: u64,
    call_type: RpcCallType,
    event: RpcEvent,
) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    if entry.transport_for(generation).is_none() {
        debug!(session_id = %session_id, generation, "Ignoring stale call event");
        return;
    }

    match event {
        RpcEvent::Message(value) => {
            if call_type == RpcCallType::Unary {
                entry.unary_response = Some(Payload::Json(value.clone()));
            }
            ctx.record(session_id, MessageRecord::data_in(Payload::Json(value)));
        }
        RpcEvent::End => {
            if let Some(transport) = entry.transport.take() {
                transport.abort();
            }
            let response = entry.unary_response.take().unwrap_or(Payload::Empty);
            let reply = entry.pending_reply.take();
            entry.session.state = match call_type {
                RpcCallType::Unary => SessionState::Completed,
                _ => SessionState::Closed,
            };
            info!(session_id = %session_id, call_type = call_type.as_str(), "Call finished");
            ctx.record(session_id, MessageRecord::complete());
            ctx.record(session_id, MessageRecord::close(Some(CLOSE_NORMAL), "stream closed"));
            if let Some(reply) = reply {
                let _ = reply.send(Ok(SendOutcome::Response { payload: response }));
            }
            ctx.schedule_purge(session_id);
        }
        RpcEvent::Status { code, details } => {
            entry.unary_response = None;
            ctx.fail(
                session_id,
                ManagerError::Protocol { code, details },
                SessionState::Errored,
            );
        }
    }
}

pub fn on_connect_failed(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    generation: u64,
    error: ManagerError,
) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    if entry.transport_for(generation).is_none() {
        return;
    }
    ctx.fail(session_id, error, SessionState::Errored);
}

// ============================================================================
// Call task
// ============================================================================

/// Spawns a call under a new transport generation and returns the sender
/// its requests are queued on.
fn start_call(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    call_type: RpcCallType,
) -> Result<mpsc::Sender<Value>, ManagerError> {
    let spec = ctx.entry(session_id)?.session.spec.clone();
    let (host, port) = rpc_authority(&spec.target)?;
    let descriptor = spec.config.call.clone().ok_or_else(|| DomainError::MissingField {
        field: "call".to_string(),
    })?;
    let resolution = ctx.resolve(&spec.target);
    let channel_request = ChannelRequest {
        host,
        port,
        proxy_hints: resolution.env_hints(),
        tls_bypass: resolution.tls_bypass,
    };
    let call_request = CallRequest {
        descriptor,
        call_type,
        metadata: spec.config.headers.clone(),
    };

    let connector = Arc::clone(&ctx.connectors.rpc);
    let timeout = ctx.network.connect_timeout();
    let events = ctx.events.clone();
    ctx.sweeper.cancel(session_id, TimerKind::Purge);

    let (tx, rx) = mpsc::channel(LINK_BUFFER);
    let generation = ctx.next_generation();
    let entry = ctx.entry(session_id)?;
    entry.session.begin_generation(generation);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_call(
        connector,
        channel_request,
        call_request,
        timeout,
        CallTask {
            session_id: session_id.clone(),
            generation,
            events,
            cancel: cancel.clone(),
        },
        rx,
    ));
    let mut handle = TransportHandle::new(generation, cancel, task);
    handle.sink = Some(TransportSink::Rpc(tx.clone()));
    entry.transport = Some(handle);
    entry.unary_response = None;
    entry.session.state = SessionState::Open;

    info!(
        session_id = %session_id,
        generation,
        call_type = call_type.as_str(),
        proxied = resolution.proxy.is_some(),
        "Starting call"
    );
    Ok(tx)
}

struct CallTask {
    session_id: SessionId,
    generation: u64,
    events: mpsc::Sender<TaskEvent>,
    cancel: CancellationToken,
}

impl CallTask {
    async fn post(&self, event: TaskEvent) -> bool {
        self.events.send(event).await.is_ok()
    }
}

async fn run_call(
    connector: Arc<dyn RpcConnector>,
    channel_request: ChannelRequest,
    call_request: CallRequest,
    timeout: Duration,
    task: CallTask,
    mut outgoing: mpsc::Receiver<Value>,
) {
    let opened = tokio::select! {
        _ = task.cancel.cancelled() => return,
        result = open_call(connector, channel_request, call_request, timeout) => result,
    };
    let RpcCall {
        requests,
        mut responses,
    } = match opened {
        Ok(call) => call,
        Err(error) => {
            task.post(TaskEvent::ConnectFailed {
                session_id: task.session_id.clone(),
                generation: task.generation,
                error,
            })
            .await;
            return;
        }
    };

    let started = TaskEvent::RpcStarted {
        session_id: task.session_id.clone(),
        generation: task.generation,
    };
    if !task.post(started).await {
        return;
    }

    let mut requests = Some(requests);
    loop {
        tokio::select! {
            _ = task.cancel.cancelled() => break,
            item = outgoing.recv(), if requests.is_some() => {
                match (item, &requests) {
                    (Some(request), Some(tx)) => {
                        if tx.send(request).await.is_err() {
                            requests = None;
                        }
                    }
                    // All request senders dropped: half-close the call.
                    _ => requests = None,
                }
            }
            event = responses.recv() => {
                let event = event.unwrap_or(RpcEvent::Status {
                    code: STATUS_UNAVAILABLE,
                    details: "call ended without status".to_string(),
                });
                let terminal = !matches!(event, RpcEvent::Message(_));
                let posted = task
                    .post(TaskEvent::Rpc {
                        session_id: task.session_id.clone(),
                        generation: task.generation,
                        event,
                    })
                    .await;
                if !posted || terminal {
                    break;
                }
            }
        }
    }
}

/// Opens a channel, waits for it to become ready within `timeout`, and
/// issues the call.
async fn open_call(
    connector: Arc<dyn RpcConnector>,
    channel_request: ChannelRequest,
    call_request: CallRequest,
    timeout: Duration,
) -> Result<RpcCall, ManagerError> {
    let ready = tokio::time::timeout(timeout, async {
        let mut channel = connector.channel(channel_request).await?;
        channel.ready().await?;
        Ok::<_, TransportError>(channel)
    })
    .await;
    let channel = match ready {
        Ok(result) => result?,
        Err(_) => {
            warn!(timeout_ms = timeout.as_millis() as u64, "Channel not ready in time");
            return Err(ManagerError::ConnectTimeout(timeout));
        }
    };
    Ok(channel.start_call(call_request).await?)
}

/// Converts a caller payload into a JSON request message. Text that is not
/// JSON is sent as a JSON string.
pub(crate) fn json_payload(payload: &Payload) -> Result<Value, ManagerError> {
    match payload {
        Payload::Json(value) => Ok(value.clone()),
        Payload::Text(text) => {
            Ok(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone())))
        }
        Payload::Empty => Ok(Value::Object(serde_json::Map::new())),
        other => Err(ManagerError::Configuration(DomainError::InvalidFieldValue {
            field: "payload".to_string(),
            value: format!("{other:?}"),
            expected: "JSON or text".to_string(),
        })),
    }
}
