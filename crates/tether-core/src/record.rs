//! Message records: the immutable events stored in a session's log.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// WebSocket close code for a deliberate, user-initiated close.
pub const CLOSE_NORMAL: u16 = 1000;

/// WebSocket close code used when the manager itself is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Close code used when the sweeper reaps an idle session.
pub const CLOSE_INACTIVITY: u16 = 4000;

/// Close code used when a subscription is replaced by a newer one.
pub const CLOSE_REPLACED: u16 = 4001;

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
    Open,
    DataIn,
    DataOut,
    Error,
    Close,
    Pause,
    Complete,
    Cancel,
}

impl RecordKind {
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::DataIn => "data-in",
            Self::DataOut => "data-out",
            Self::Error => "error",
            Self::Close => "close",
            Self::Pause => "pause",
            Self::Complete => "complete",
            Self::Cancel => "cancel",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether a data record travelled towards the peer or came from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Request,
    Response,
}

/// Where a recorded failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSource {
    /// Socket or channel level failure
    Transport,
    /// Service status (RPC) or payload `errors` (GraphQL)
    Protocol,
    /// Channel readiness not reached within the connect timeout
    Timeout,
    /// Fault inside the manager itself
    Internal,
}

/// Structured error information carried by `error` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub source: ErrorSource,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorInfo {
    pub fn new(source: ErrorSource, message: impl Into<String>) -> Self {
        Self {
            source,
            message: message.into(),
            code: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = Some(code);
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} (code {code})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Protocol-specific record content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Payload {
    Empty,
    Text(String),
    Binary(Vec<u8>),
    Json(serde_json::Value),
    Reason {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<u16>,
        reason: String,
    },
    Error(ErrorInfo),
}

impl Payload {
    pub fn reason(reason: impl Into<String>) -> Self {
        Self::Reason {
            code: None,
            reason: reason.into(),
        }
    }

    /// Size of the carried data in bytes (zero for non-data payloads).
    #[must_use]
    pub fn data_len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) => b.len(),
            Self::Json(v) => v.to_string().len(),
            _ => 0,
        }
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(v: serde_json::Value) -> Self {
        Self::Json(v)
    }
}

/// One immutable event belonging to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub kind: RecordKind,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl MessageRecord {
    /// Creates a record stamped with the current time.
    pub fn new(kind: RecordKind, payload: Payload) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            payload,
            direction: None,
        }
    }

    pub fn open() -> Self {
        Self::new(RecordKind::Open, Payload::Empty)
    }

    pub fn data_in(payload: Payload) -> Self {
        Self::new(RecordKind::DataIn, payload).with_direction(Direction::Response)
    }

    pub fn data_out(payload: Payload) -> Self {
        Self::new(RecordKind::DataOut, payload).with_direction(Direction::Request)
    }

    pub fn error(info: ErrorInfo) -> Self {
        Self::new(RecordKind::Error, Payload::Error(info))
    }

    pub fn close(code: Option<u16>, reason: impl Into<String>) -> Self {
        Self::new(
            RecordKind::Close,
            Payload::Reason {
                code,
                reason: reason.into(),
            },
        )
    }

    pub fn pause(reason: impl Into<String>) -> Self {
        Self::new(RecordKind::Pause, Payload::reason(reason))
    }

    pub fn complete() -> Self {
        Self::new(RecordKind::Complete, Payload::Empty)
    }

    pub fn cancel(reason: impl Into<String>) -> Self {
        Self::new(RecordKind::Cancel, Payload::reason(reason))
    }

    #[must_use]
    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Returns the error info if this is an `error` record.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match &self.payload {
            Payload::Error(info) => Some(info),
            _ => None,
        }
    }
}
