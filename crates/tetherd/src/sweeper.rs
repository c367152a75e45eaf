//! Cleanup sweeper: inactivity detection and the manager's delayed timers.
//!
//! Every timer (log purge after close, subscription re-create grace) is a
//! spawned sleep that posts `TaskEvent::TimerFired` back to the actor. Each
//! schedule gets a fresh token, so a timer that fired just before being
//! cancelled or replaced is recognised as stale and ignored.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use tether_core::{MessageLog, SessionId};

use crate::manager::TaskEvent;
use crate::registry::SessionRegistry;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Remove the registry entry and delete the Message Log.
    Purge,
    /// Create a subscription whose predecessor was disposed.
    Resubscribe,
}

struct Timer {
    token: u64,
    task: JoinHandle<()>,
}

/// Owns all delayed timers and decides which sessions are idle.
pub struct Sweeper {
    inactivity_threshold: TimeDelta,
    timers: HashMap<(SessionId, TimerKind), Timer>,
    next_token: u64,
}

impl Sweeper {
    pub fn new(inactivity_threshold: Duration) -> Self {
        Self {
            inactivity_threshold: TimeDelta::from_std(inactivity_threshold)
                .unwrap_or(TimeDelta::MAX),
            timers: HashMap::new(),
            next_token: 0,
        }
    }

    /// Schedules (or reschedules) a timer for `session_id`.
    pub fn schedule(
        &mut self,
        session_id: &SessionId,
        kind: TimerKind,
        delay: Duration,
        events: mpsc::Sender<TaskEvent>,
    ) {
        self.cancel(session_id, kind);
        self.next_token = self.next_token.wrapping_add(1);
        let token = self.next_token;

        let id = session_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events
                .send(TaskEvent::TimerFired {
                    session_id: id,
                    kind,
                    token,
                })
                .await;
        });

        debug!(session_id = %session_id, kind = ?kind, delay_ms = delay.as_millis() as u64, "Timer scheduled");
        self.timers
            .insert((session_id.clone(), kind), Timer { token, task });
    }

    /// Cancels a pending timer. Returns true if one was pending.
    pub fn cancel(&mut self, session_id: &SessionId, kind: TimerKind) -> bool {
        match self.timers.remove(&(session_id.clone(), kind)) {
            Some(timer) => {
                timer.task.abort();
                true
            }
            None => false,
        }
    }

    /// Cancels every timer held for `session_id`.
    pub fn cancel_all_for(&mut self, session_id: &SessionId) {
        self.cancel(session_id, TimerKind::Purge);
        self.cancel(session_id, TimerKind::Resubscribe);
    }

    /// Claims a fired timer. Returns false when the timer was cancelled or
    /// replaced after it fired.
    pub fn claim(&mut self, session_id: &SessionId, kind: TimerKind, token: u64) -> bool {
        let key = (session_id.clone(), kind);
        match self.timers.get(&key) {
            Some(timer) if timer.token == token => {
                self.timers.remove(&key);
                true
            }
            _ => false,
        }
    }

    pub fn is_scheduled(&self, session_id: &SessionId, kind: TimerKind) -> bool {
        self.timers.contains_key(&(session_id.clone(), kind))
    }

    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    /// Aborts every timer.
    pub fn shutdown(&mut self) {
        for (_, timer) in self.timers.drain() {
            timer.task.abort();
        }
    }

    /// Returns sessions whose last activity is at least the inactivity
    /// threshold before `now`, skipping those already awaiting purge.
    pub fn idle_sessions(
        &self,
        registry: &SessionRegistry,
        log: &MessageLog,
        now: DateTime<Utc>,
    ) -> Vec<SessionId> {
        registry
            .list()
            .filter(|entry| !self.is_scheduled(&entry.session.id, TimerKind::Purge))
            .filter(|entry| {
                let last = log
                    .last_activity(&entry.session.id)
                    .unwrap_or(entry.session.created_at);
                now.signed_duration_since(last) >= self.inactivity_threshold
            })
            .map(|entry| entry.session.id.clone())
            .collect()
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
