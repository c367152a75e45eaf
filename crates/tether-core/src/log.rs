//! Bounded per-session message history used for replay.
//!
//! Each session gets a ring buffer: appending to a full log evicts the
//! oldest record. Records may arrive slightly out of timestamp order when
//! I/O callbacks race, so reads sort (stably) instead of writes.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::record::MessageRecord;
use crate::session::{SessionId, DEFAULT_LOG_CAPACITY};

struct SessionLog {
    capacity: usize,
    records: VecDeque<MessageRecord>,
}

impl SessionLog {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: VecDeque::with_capacity(capacity),
        }
    }
}

/// Message logs for all sessions, keyed by session id.
///
/// A log lives independently of its registry entry so history can outlive
/// the session for a grace period.
#[derive(Default)]
pub struct MessageLog {
    logs: HashMap<SessionId, SessionLog>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ensures a log exists for `session_id` with the given capacity.
    ///
    /// An existing log keeps its records; only the capacity is updated
    /// (shrinking drops the oldest records).
    pub fn open(&mut self, session_id: &SessionId, capacity: usize) {
        let log = self
            .logs
            .entry(session_id.clone())
            .or_insert_with(|| SessionLog::new(capacity));
        log.capacity = capacity.max(1);
        while log.records.len() > log.capacity {
            log.records.pop_front();
        }
    }

    /// Appends a record, evicting the oldest one when the log is full.
    ///
    /// Returns the evicted record, if any.
    pub fn append(&mut self, session_id: &SessionId, record: MessageRecord) -> Option<MessageRecord> {
        let log = self
            .logs
            .entry(session_id.clone())
            .or_insert_with(|| SessionLog::new(DEFAULT_LOG_CAPACITY));

        let evicted = if log.records.len() >= log.capacity {
            log.records.pop_front()
        } else {
            None
        };
        if evicted.is_some() {
            debug!(session_id = %session_id, capacity = log.capacity, "Message log full, evicted oldest record");
        }

        log.records.push_back(record);
        evicted
    }

    /// Returns the session's records in ascending timestamp order.
    ///
    /// With `since`, only records strictly newer than it are returned.
    /// Reading never mutates the log.
    pub fn records_since(
        &self,
        session_id: &SessionId,
        since: Option<DateTime<Utc>>,
    ) -> Vec<MessageRecord> {
        let Some(log) = self.logs.get(session_id) else {
            return Vec::new();
        };

        let mut records: Vec<MessageRecord> = log
            .records
            .iter()
            .filter(|r| since.map_or(true, |ts| r.timestamp > ts))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        records
    }

    /// Deletes the session's log. Returns true if one existed.
    pub fn clear(&mut self, session_id: &SessionId) -> bool {
        self.logs.remove(session_id).is_some()
    }

    /// Number of buffered records for the session.
    pub fn len(&self, session_id: &SessionId) -> usize {
        self.logs.get(session_id).map_or(0, |l| l.records.len())
    }

    pub fn contains(&self, session_id: &SessionId) -> bool {
        self.logs.contains_key(session_id)
    }

    /// Timestamp of the newest record, if any.
    pub fn last_activity(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.logs
            .get(session_id)
            .and_then(|l| l.records.iter().map(|r| r.timestamp).max())
    }

    /// Number of sessions that currently have a log.
    pub fn session_count(&self) -> usize {
        self.logs.len()
    }
}
