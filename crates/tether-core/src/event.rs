//! Observer events fanned out for every recorded session event.

use serde::{Deserialize, Serialize};

use crate::record::{MessageRecord, RecordKind};
use crate::session::SessionId;

/// Event category seen by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Opened,
    Message,
    Sent,
    Paused,
    Error,
    Closed,
    Completed,
    Cancelled,
}

impl From<RecordKind> for EventKind {
    fn from(kind: RecordKind) -> Self {
        match kind {
            RecordKind::Open => Self::Opened,
            RecordKind::DataIn => Self::Message,
            RecordKind::DataOut => Self::Sent,
            RecordKind::Pause => Self::Paused,
            RecordKind::Error => Self::Error,
            RecordKind::Close => Self::Closed,
            RecordKind::Complete => Self::Completed,
            RecordKind::Cancel => Self::Cancelled,
        }
    }
}

/// A session event delivered to observers.
///
/// `is_replayed` is set when the event is re-emitted from the Message Log
/// for a reattaching observer rather than produced by live traffic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub session_id: SessionId,
    pub kind: EventKind,
    pub record: MessageRecord,
    pub is_replayed: bool,
}

impl ConnectionEvent {
    pub fn live(session_id: SessionId, record: MessageRecord) -> Self {
        Self {
            session_id,
            kind: record.kind.into(),
            record,
            is_replayed: false,
        }
    }

    pub fn replayed(session_id: SessionId, record: MessageRecord) -> Self {
        Self {
            session_id,
            kind: record.kind.into(),
            record,
            is_replayed: true,
        }
    }
}
