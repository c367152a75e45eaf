//! Lifecycle controllers, one per protocol family.
//!
//! Controllers hold no state of their own. Each operation receives the
//! manager context and a session id, and the functions here route it to
//! the family the session's protocol kind belongs to.

pub mod rpc;
pub mod stream;
pub mod subscription;

use tracing::info;

use tether_core::{
    ActivateOutcome, ControlOutcome, Payload, ProtocolFamily, SendOutcome, SessionId,
};

use crate::manager::{ManagerContext, ManagerError, Responder, TaskEvent};
use crate::sweeper::TimerKind;

fn family(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ProtocolFamily, ManagerError> {
    Ok(ctx.entry(session_id)?.session.kind().family())
}

/// Connects the session, or replays its history if it is already
/// connected or was deliberately closed.
pub fn activate(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ActivateOutcome, ManagerError> {
    if ctx.entry(session_id)?.session.explicitly_closed {
        let replayed = ctx.replay(session_id);
        return Ok(ActivateOutcome::ClosedWithHistory { replayed });
    }
    match family(ctx, session_id)? {
        ProtocolFamily::Stream => stream::activate(ctx, session_id),
        ProtocolFamily::Rpc(_) => rpc::activate(ctx, session_id),
        ProtocolFamily::Subscription => subscription::activate(ctx, session_id),
    }
}

/// Sends a payload. Unary RPC replies are deferred until the call ends,
/// so the responder is handed through rather than answered here.
pub fn send(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    payload: Payload,
    respond_to: Responder<SendOutcome>,
) {
    let result = match family(ctx, session_id) {
        Ok(ProtocolFamily::Rpc(call_type)) => {
            return rpc::send(ctx, session_id, call_type, payload, respond_to);
        }
        Ok(ProtocolFamily::Stream) => stream::send(ctx, session_id, payload),
        Ok(ProtocolFamily::Subscription) => {
            let state = ctx.state_of(session_id).unwrap_or_default();
            Err(ManagerError::invalid_state("send", state))
        }
        Err(e) => Err(e),
    };
    let _ = respond_to.send(result);
}

pub fn pause(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    reason: String,
) -> Result<ControlOutcome, ManagerError> {
    match family(ctx, session_id)? {
        ProtocolFamily::Stream | ProtocolFamily::Subscription => stream::pause(ctx, session_id, reason),
        ProtocolFamily::Rpc(_) => Ok(ControlOutcome::NoOp {
            state: ctx.entry(session_id)?.state(),
        }),
    }
}

pub fn resume(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    match family(ctx, session_id)? {
        ProtocolFamily::Stream | ProtocolFamily::Subscription => stream::resume(ctx, session_id),
        ProtocolFamily::Rpc(_) => Ok(ControlOutcome::NoOp {
            state: ctx.entry(session_id)?.state(),
        }),
    }
}

pub fn close(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
    reason: String,
) -> Result<ControlOutcome, ManagerError> {
    match family(ctx, session_id)? {
        ProtocolFamily::Stream => stream::close(ctx, session_id, reason),
        ProtocolFamily::Rpc(_) => rpc::close(ctx, session_id, reason),
        ProtocolFamily::Subscription => subscription::close(ctx, session_id, reason),
    }
}

pub fn cancel(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    match family(ctx, session_id)? {
        ProtocolFamily::Stream | ProtocolFamily::Subscription => stream::cancel(ctx, session_id),
        ProtocolFamily::Rpc(_) => rpc::cancel(ctx, session_id),
    }
}

pub fn end(ctx: &mut ManagerContext, session_id: &SessionId) -> Result<ControlOutcome, ManagerError> {
    match family(ctx, session_id)? {
        ProtocolFamily::Rpc(_) => rpc::end(ctx, session_id),
        _ => Ok(ControlOutcome::NoOp {
            state: ctx.entry(session_id)?.state(),
        }),
    }
}

/// Forgets a deliberate close so the next `activate` connects again. The
/// history stays and the pending purge is dropped.
pub fn clear_closed_state(
    ctx: &mut ManagerContext,
    session_id: &SessionId,
) -> Result<ControlOutcome, ManagerError> {
    let entry = ctx.entry(session_id)?;
    if !entry.session.explicitly_closed {
        return Ok(ControlOutcome::NoOp { state: entry.state() });
    }
    entry.session.explicitly_closed = false;
    ctx.sweeper.cancel(session_id, TimerKind::Purge);
    info!(session_id = %session_id, "Closed state cleared");
    Ok(ControlOutcome::Applied)
}

/// Closes an idle session's transport with the inactivity reason.
pub fn reap(ctx: &mut ManagerContext, session_id: &SessionId) {
    match family(ctx, session_id) {
        Ok(ProtocolFamily::Stream | ProtocolFamily::Subscription) => stream::reap(ctx, session_id),
        Ok(ProtocolFamily::Rpc(_)) => rpc::reap(ctx, session_id),
        Err(_) => {}
    }
}

/// Routes a transport or timer callback to its controller.
pub fn on_task_event(ctx: &mut ManagerContext, event: TaskEvent) {
    match event {
        TaskEvent::StreamOpened {
            session_id,
            generation,
            outbound,
            protocol,
        } => match family(ctx, &session_id) {
            Ok(ProtocolFamily::Subscription) => {
                subscription::on_opened(ctx, &session_id, generation, outbound, protocol)
            }
            Ok(_) => stream::on_opened(ctx, &session_id, generation, outbound),
            Err(_) => {}
        },
        TaskEvent::StreamInbound {
            session_id,
            generation,
            inbound,
        } => match family(ctx, &session_id) {
            Ok(ProtocolFamily::Subscription) => {
                subscription::on_inbound(ctx, &session_id, generation, inbound)
            }
            Ok(_) => stream::on_inbound(ctx, &session_id, generation, inbound),
            Err(_) => {}
        },
        TaskEvent::ConnectFailed {
            session_id,
            generation,
            error,
        } => match family(ctx, &session_id) {
            Ok(ProtocolFamily::Rpc(_)) => rpc::on_connect_failed(ctx, &session_id, generation, error),
            Ok(_) => stream::on_connect_failed(ctx, &session_id, generation, error),
            Err(_) => {}
        },
        TaskEvent::RpcStarted {
            session_id,
            generation,
        } => {
            if let Ok(ProtocolFamily::Rpc(call_type)) = family(ctx, &session_id) {
                rpc::on_started(ctx, &session_id, generation, call_type);
            }
        }
        TaskEvent::Rpc {
            session_id,
            generation,
            event,
        } => {
            if let Ok(ProtocolFamily::Rpc(call_type)) = family(ctx, &session_id) {
                rpc::on_event(ctx, &session_id, generation, call_type, event);
            }
        }
        TaskEvent::TimerFired {
            session_id,
            kind,
            token,
        } => {
            if !ctx.sweeper.claim(&session_id, kind, token) {
                return;
            }
            match kind {
                TimerKind::Purge => ctx.purge(&session_id),
                TimerKind::Resubscribe => subscription::on_resubscribe_due(ctx, &session_id),
            }
        }
    }
}
