//! Stream lifecycle: `Configured → Connecting → Open ⇄ Paused → Closed`.
//!
//! Also provides the connect task and transport plumbing reused by the
//! subscription controller, which rides on the same stream transport.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tether_core::{
    ActivateOutcome, ControlOutcome, DomainError, MessageRecord, Payload, SendOutcome, SessionId,
    SessionState, CLOSE_INACTIVITY, CLOSE_NORMAL,
};

use crate::manager::{ManagerContext, ManagerError, TaskEvent};
use crate::registry::{TransportHandle, TransportSink};
use crate::sweeper::TimerKind;
use crate::transport::{Inbound, Outbound, StreamConnector, StreamLink, StreamRequest};

// ============================================================================
// Caller operations
// ============================================================================

/// Connects a session without a transport, or replays the history of one
/// that is already connected.
pub fn activate(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ActivateOutcome, ManagerError> {
    activate_with(ctx, session_id, &[])
}

pub(crate) fn activate_with(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    required_protocols: &[&str],
) -> Result<ActivateOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    if entry.has_transport() {
        let state = entry.state();
        let replayed = ctx.replay(session_id);
        return Ok(ActivateOutcome::Attached { state, replayed });
    }
    connect(ctx, session_id, required_protocols)?;
    Ok(ActivateOutcome::Connecting)
}

/// Records the payload and writes it to the transport. Only valid while
/// `Open`.
pub fn send(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    payload: Payload,
) -> Result<SendOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let state = entry.state();
    if state != SessionState::Open {
        return Err(ManagerError::invalid_state("send", state));
    }
    let Some(TransportSink::Stream(tx)) = entry.transport.as_ref().and_then(|t| t.sink.as_ref()) else {
        return Err(ManagerError::invalid_state("send", state));
    };
    let tx = tx.clone();
    let frame = outbound_frame(&payload)?;

    // Reserve first so a record always means the frame was queued.
    let permit = match tx.try_reserve() {
        Ok(permit) => permit,
        Err(TrySendError::Full(())) => {
            return Err(ManagerError::Transport("outbound buffer full".to_string()))
        }
        Err(TrySendError::Closed(())) => {
            let error = ManagerError::Transport("transport closed".to_string());
            ctx.fail(session_id, error.clone(), SessionState::Closed);
            return Err(error);
        }
    };
    ctx.record(session_id, MessageRecord::data_out(payload));
    permit.send(frame);
    Ok(SendOutcome::Sent)
}

/// `Open → Paused`. The transport stays up; inbound data is dropped until
/// resumed.
pub fn pause(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    reason: String,
) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let state = entry.state();
    if state != SessionState::Open || !entry.has_transport() {
        return Ok(ControlOutcome::NoOp { state });
    }
    entry.session.state = SessionState::Paused;
    info!(session_id = %session_id, reason = %reason, "Session paused");
    ctx.record(session_id, MessageRecord::pause(reason));
    Ok(ControlOutcome::Applied)
}

/// `Paused → Open`, only while the transport is still live.
pub fn resume(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let state = entry.state();
    let live = entry
        .transport
        .as_ref()
        .is_some_and(|t| t.sink.is_some());
    if state != SessionState::Paused || !live {
        return Ok(ControlOutcome::NoOp { state });
    }
    entry.session.state = SessionState::Open;
    info!(session_id = %session_id, "Session resumed");
    ctx.record(session_id, MessageRecord::open());
    Ok(ControlOutcome::Applied)
}

/// Deliberate close: the transport gets the normal close code and a later
/// `activate` replays instead of reconnecting.
pub fn close(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    reason: String,
) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let Some(transport) = entry.transport.take() else {
        return Ok(ControlOutcome::NoOp { state: entry.state() });
    };
    transport.close(CLOSE_NORMAL, &reason);
    entry.session.state = SessionState::Closed;
    entry.session.explicitly_closed = true;

    info!(session_id = %session_id, reason = %reason, "Session closed");
    ctx.record(session_id, MessageRecord::close(Some(CLOSE_NORMAL), reason));
    ctx.schedule_purge(session_id);
    Ok(ControlOutcome::Applied)
}

/// Aborts the transport without a close handshake.
pub fn cancel(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    let Some(transport) = entry.transport.take() else {
        return Ok(ControlOutcome::NoOp { state: entry.state() });
    };
    transport.abort();
    entry.session.state = SessionState::Closed;

    info!(session_id = %session_id, "Session cancelled");
    ctx.record(session_id, MessageRecord::cancel("cancelled by client"));
    ctx.schedule_purge(session_id);
    Ok(ControlOutcome::Applied)
}

/// Closes an idle session's transport with the inactivity code.
pub fn reap(ctx: &mut ManagerContext, session_id: &SessionId) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    let Some(transport) = entry.transport.take() else {
        return;
    };
    transport.close(CLOSE_INACTIVITY, "inactivity timeout");
    entry.session.state = SessionState::Closed;
    ctx.record(
        session_id,
        MessageRecord::close(Some(CLOSE_INACTIVITY), "inactivity timeout"),
    );
}

// ============================================================================
// Transport callbacks
// ============================================================================

pub fn on_opened(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    generation: u64,
    outbound: mpsc::Sender<Outbound>,
) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    let Some(transport) = entry.transport_for(generation) else {
        debug!(session_id = %session_id, generation, "Ignoring stale open");
        return;
    };
    transport.sink = Some(TransportSink::Stream(outbound));
    entry.session.state = SessionState::Open;
    info!(session_id = %session_id, target = %entry.session.target(), "Stream opened");
    ctx.record(session_id, MessageRecord::open());
}

pub fn on_inbound(ctx: &mut ManagerContext, session_id: &SessionId, generation: u64, inbound: Inbound) {
    let Some(state) = live_state(ctx, session_id, generation) else {
        return;
    };
    match inbound {
        Inbound::Text(text) => deliver(ctx, session_id, state, Payload::Text(text)),
        Inbound::Binary(bytes) => deliver(ctx, session_id, state, Payload::Binary(bytes)),
        Inbound::Closed { code, reason } => on_peer_closed(ctx, session_id, code, reason),
        Inbound::Error(message) => {
            ctx.fail(session_id, ManagerError::Transport(message), SessionState::Closed)
        }
    }
}

pub fn on_connect_failed(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    generation: u64,
    error: ManagerError,
) {
    if live_state(ctx, session_id, generation).is_none() {
        return;
    }
    ctx.fail(session_id, error, SessionState::Closed);
}

/// Returns the session state if `generation` is its current transport.
pub(crate) fn live_state(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    generation: u64,
) -> Option<SessionState> {
    let entry = ctx.registry.get_mut(session_id)?;
    let state = entry.state();
    if entry.transport_for(generation).is_none() {
        debug!(session_id = %session_id, generation, "Ignoring stale transport event");
        return None;
    }
    Some(state)
}

/// Records inbound data unless the session is paused.
pub(crate) fn deliver(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    state: SessionState,
    payload: Payload,
) {
    if state == SessionState::Paused {
        debug!(session_id = %session_id, bytes = payload.data_len(), "Dropped inbound data while paused");
        return;
    }
    ctx.record(session_id, MessageRecord::data_in(payload));
}

/// The peer ended the transport: not an explicit close, so a later
/// `activate` reconnects.
pub(crate) fn on_peer_closed(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    code: Option<u16>,
    reason: String,
) {
    let Some(entry) = ctx.registry.get_mut(session_id) else {
        return;
    };
    if let Some(transport) = entry.transport.take() {
        transport.abort();
    }
    entry.session.state = SessionState::Closed;
    warn!(session_id = %session_id, code = ?code, reason = %reason, "Transport closed by peer");
    ctx.record(session_id, MessageRecord::close(code, reason));
    ctx.schedule_purge(session_id);
}

// ============================================================================
// Connect task
// ============================================================================

/// Starts a connect attempt under a new transport generation.
pub(crate) fn connect(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    required_protocols: &[&str],
) -> Result<(), ManagerError> {
    let spec = ctx.entry(session_id)?.session.spec.clone();
    let mut subprotocols = spec.config.subprotocols.clone();
    for protocol in required_protocols {
        if !subprotocols.iter().any(|p| p == protocol) {
            subprotocols.push((*protocol).to_string());
        }
    }
    let request = StreamRequest {
        url: spec.target.trim().to_string(),
        headers: spec.config.headers.clone(),
        subprotocols,
        resolution: ctx.resolve(&spec.target),
    };
    let proxied = request.resolution.proxy.is_some();
    let connector = Arc::clone(&ctx.connectors.stream);
    let timeout = ctx.network.connect_timeout();
    let events = ctx.events.clone();
    ctx.sweeper.cancel(session_id, TimerKind::Purge);

    let generation = ctx.next_generation();
    let entry = ctx.entry(session_id)?;
    entry.session.begin_generation(generation);
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_stream(
        connector,
        request,
        timeout,
        session_id.clone(),
        generation,
        events,
        cancel.clone(),
    ));
    entry.transport = Some(TransportHandle::new(generation, cancel, task));
    entry.session.state = SessionState::Connecting;

    info!(
        session_id = %session_id,
        generation,
        proxied,
        "Connecting"
    );
    Ok(())
}

/// Connects within `timeout`, then forwards inbound items to the actor
/// until the transport ends or the attempt is cancelled.
async fn run_stream(
    connector: Arc<dyn StreamConnector>,
    request: StreamRequest,
    timeout: Duration,
    session_id: SessionId,
    generation: u64,
    events: mpsc::Sender<TaskEvent>,
    cancel: CancellationToken,
) {
    let attempt = tokio::select! {
        _ = cancel.cancelled() => return,
        result = tokio::time::timeout(timeout, connector.connect(request)) => result,
    };

    let link = match attempt {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => {
            let _ = events
                .send(TaskEvent::ConnectFailed {
                    session_id,
                    generation,
                    error: e.into(),
                })
                .await;
            return;
        }
        Err(_) => {
            let _ = events
                .send(TaskEvent::ConnectFailed {
                    session_id,
                    generation,
                    error: ManagerError::ConnectTimeout(timeout),
                })
                .await;
            return;
        }
    };

    let StreamLink {
        outbound,
        mut inbound,
        protocol,
    } = link;
    let opened = TaskEvent::StreamOpened {
        session_id: session_id.clone(),
        generation,
        outbound,
        protocol,
    };
    if events.send(opened).await.is_err() {
        return;
    }

    loop {
        let item = tokio::select! {
            _ = cancel.cancelled() => break,
            item = inbound.recv() => item,
        };
        let item = item.unwrap_or(Inbound::Closed {
            code: None,
            reason: "transport ended".to_string(),
        });
        let terminal = item.is_terminal();
        let event = TaskEvent::StreamInbound {
            session_id: session_id.clone(),
            generation,
            inbound: item,
        };
        if events.send(event).await.is_err() || terminal {
            break;
        }
    }
}

/// Maps a caller payload onto a transport frame.
pub(crate) fn outbound_frame(payload: &Payload) -> Result<Outbound, ManagerError> {
    match payload {
        Payload::Text(text) => Ok(Outbound::Text(text.clone())),
        Payload::Binary(bytes) => Ok(Outbound::Binary(bytes.clone())),
        Payload::Json(value) => Ok(Outbound::Text(value.to_string())),
        Payload::Empty => Ok(Outbound::Text(String::new())),
        other => Err(ManagerError::Configuration(DomainError::InvalidFieldValue {
            field: "payload".to_string(),
            value: format!("{other:?}"),
            expected: "text, binary or JSON".to_string(),
        })),
    }
}
