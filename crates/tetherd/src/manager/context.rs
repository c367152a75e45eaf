//! State owned by the manager actor and the helpers every controller uses.
//!
//! Controllers are stateless: they receive the context plus a session id,
//! and all bookkeeping (records, observer events, timers, terminal failure
//! handling) goes through the methods here.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tether_core::{
    resolve_proxy, ConfigureOutcome, ConnectionEvent, DedupGuard, ErrorInfo, ErrorSource,
    ManagerSettings, MessageLog, MessageRecord, NetworkSettings, ProtocolKind, ProxyResolution,
    Session, SessionId, SessionSpec, SessionState, SessionView, Settings,
};

use super::commands::{ManagerError, Responder, TaskEvent};
use crate::registry::{SessionEntry, SessionRegistry};
use crate::sweeper::{Sweeper, TimerKind};
use crate::transport::Connectors;

/// A subscription waiting out the grace delay before being re-created.
#[derive(Debug)]
pub struct PendingResubscribe {
    pub spec: SessionSpec,
    pub waiters: Vec<Responder<ConfigureOutcome>>,
}

/// Everything the manager owns: registry, logs, dedup keys, timers and
/// settings. Only the actor task touches it.
pub struct ManagerContext {
    pub registry: SessionRegistry,
    pub log: MessageLog,
    pub dedup: DedupGuard,
    pub sweeper: Sweeper,
    pub settings: ManagerSettings,
    pub network: NetworkSettings,
    pub connectors: Connectors,
    pub pending_resubscribe: HashMap<SessionId, PendingResubscribe>,

    /// Last transport generation issued, across all sessions.
    generations: u64,

    /// Sender handed to spawned tasks for posting callbacks.
    pub events: mpsc::Sender<TaskEvent>,

    /// Observer fan-out.
    pub publisher: broadcast::Sender<ConnectionEvent>,
}

impl ManagerContext {
    pub fn new(
        settings: Settings,
        connectors: Connectors,
        events: mpsc::Sender<TaskEvent>,
        publisher: broadcast::Sender<ConnectionEvent>,
    ) -> Self {
        let Settings { manager, network } = settings;
        Self {
            registry: SessionRegistry::new(),
            log: MessageLog::new(),
            dedup: DedupGuard::new(manager.dedup_window()),
            sweeper: Sweeper::new(manager.inactivity_threshold()),
            settings: manager,
            network,
            connectors,
            pending_resubscribe: HashMap::new(),
            generations: 0,
            events,
            publisher,
        }
    }

    // ========================================================================
    // Lookup
    // ========================================================================

    pub fn entry(&mut self, session_id: &SessionId) -> Result<&mut SessionEntry, ManagerError> {
        self.registry
            .get_mut(session_id)
            .ok_or_else(|| ManagerError::NotFound(session_id.clone()))
    }

    pub fn state_of(&self, session_id: &SessionId) -> Option<SessionState> {
        self.registry.get(session_id).map(SessionEntry::state)
    }

    pub fn view(&self, session_id: &SessionId) -> Option<SessionView> {
        self.registry.get(session_id).map(|entry| {
            SessionView::from_session(
                &entry.session,
                self.log.len(session_id),
                self.log.last_activity(session_id),
            )
        })
    }

    pub fn resolve(&self, target: &str) -> ProxyResolution {
        resolve_proxy(&self.network, target)
    }

    /// Issues a transport generation no session has used before.
    pub fn next_generation(&mut self) -> u64 {
        self.generations = self.generations.wrapping_add(1);
        self.generations
    }

    // ========================================================================
    // Records and observers
    // ========================================================================

    /// Appends a record to the session's log and broadcasts it live.
    pub fn record(&mut self, session_id: &SessionId, record: MessageRecord) {
        debug!(session_id = %session_id, kind = %record.kind, "Record appended");
        self.log.append(session_id, record.clone());
        // No receivers is fine; history stays in the log.
        let _ = self
            .publisher
            .send(ConnectionEvent::live(session_id.clone(), record));
    }

    /// Re-emits the session's history tagged as replayed. Returns the
    /// number of records replayed.
    pub fn replay(&self, session_id: &SessionId) -> usize {
        let records = self.log.records_since(session_id, None);
        let count = records.len();
        for record in records {
            let _ = self
                .publisher
                .send(ConnectionEvent::replayed(session_id.clone(), record));
        }
        debug!(session_id = %session_id, count, "History replayed");
        count
    }

    pub fn set_state(&mut self, session_id: &SessionId, state: SessionState) {
        if let Some(entry) = self.registry.get_mut(session_id) {
            if entry.session.state != state {
                debug!(
                    session_id = %session_id,
                    from = %entry.session.state,
                    to = %state,
                    "State transition"
                );
                entry.session.state = state;
            }
        }
    }

    // ========================================================================
    // Creation and teardown
    // ========================================================================

    /// Registers a new session and opens its log.
    pub fn create_session(&mut self, session_id: SessionId, spec: SessionSpec) {
        let capacity = match spec.kind {
            ProtocolKind::Subscription => self.settings.subscription_log_capacity,
            _ => self.settings.log_capacity,
        };
        self.sweeper.cancel(&session_id, TimerKind::Purge);
        self.log.open(&session_id, capacity);
        info!(
            session_id = %session_id,
            kind = %spec.kind,
            target = %spec.target,
            "Session configured"
        );
        if let Some(previous) = self.registry.create(Session::new(session_id, spec)) {
            if let Some(transport) = previous.transport {
                transport.abort();
            }
        }
    }

    /// Tears a session down after a terminal failure: exactly one error
    /// record and one close record, the transport dropped, any waiting
    /// unary caller answered with `error`, and the purge scheduled.
    pub fn fail(&mut self, session_id: &SessionId, error: ManagerError, state: SessionState) {
        let info = error_info(&error);
        self.fail_with(session_id, info, error, state);
    }

    /// Like [`fail`](Self::fail), recording `info` instead of the error's
    /// default mapping.
    pub fn fail_with(
        &mut self,
        session_id: &SessionId,
        info: ErrorInfo,
        error: ManagerError,
        state: SessionState,
    ) {
        let Some(entry) = self.registry.get_mut(session_id) else {
            return;
        };
        if let Some(transport) = entry.transport.take() {
            transport.abort();
        }
        if let Some(reply) = entry.pending_reply.take() {
            let _ = reply.send(Err(error.clone()));
        }
        entry.session.state = state;

        warn!(session_id = %session_id, error = %error, "Session failed");
        self.record(session_id, MessageRecord::error(info));
        self.record(session_id, MessageRecord::close(None, error.to_string()));
        self.schedule_purge(session_id);
    }

    pub fn schedule_purge(&mut self, session_id: &SessionId) {
        let grace = self.settings.purge_grace();
        self.sweeper
            .schedule(session_id, TimerKind::Purge, grace, self.events.clone());
    }

    /// Removes the registry entry and deletes the log.
    pub fn purge(&mut self, session_id: &SessionId) {
        self.sweeper.cancel_all_for(session_id);
        if let Some(mut entry) = self.registry.remove(session_id) {
            if let Some(transport) = entry.transport.take() {
                transport.abort();
            }
            if let Some(reply) = entry.pending_reply.take() {
                let _ = reply.send(Err(ManagerError::NotFound(session_id.clone())));
            }
        }
        let had_log = self.log.clear(session_id);
        info!(
            session_id = %session_id,
            had_log,
            remaining_sessions = self.registry.len(),
            "Session purged"
        );
    }

    /// Closes every live transport with `code` and answers every waiter.
    pub fn close_all(&mut self, code: u16, reason: &str) {
        for session_id in self.registry.ids() {
            let Some(entry) = self.registry.get_mut(&session_id) else {
                continue;
            };
            if let Some(reply) = entry.pending_reply.take() {
                let _ = reply.send(Err(ManagerError::ChannelClosed));
            }
            let Some(transport) = entry.transport.take() else {
                continue;
            };
            transport.close(code, reason);
            entry.session.state = SessionState::Closed;
            self.record(&session_id, MessageRecord::close(Some(code), reason));
        }

        for (_, pending) in self.pending_resubscribe.drain() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(ManagerError::ChannelClosed));
            }
        }
        self.sweeper.shutdown();
    }
}

/// Maps a manager error onto the structured error stored in records.
pub fn error_info(error: &ManagerError) -> ErrorInfo {
    match error {
        ManagerError::ConnectTimeout(_) => ErrorInfo::new(ErrorSource::Timeout, error.to_string()),
        ManagerError::Transport(message) => ErrorInfo::new(ErrorSource::Transport, message.clone()),
        ManagerError::Protocol { code, details } => {
            ErrorInfo::new(ErrorSource::Protocol, details.clone()).with_code(*code)
        }
        _ => ErrorInfo::new(ErrorSource::Internal, error.to_string()),
    }
}
