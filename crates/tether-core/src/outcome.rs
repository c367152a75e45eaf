//! Tagged results of facade operations.
//!
//! Expected, non-failure conditions (duplicate suppression, no-op control
//! calls, replay instead of reconnect) are outcomes rather than errors.

use serde::{Deserialize, Serialize};

use crate::record::Payload;
use crate::session::{SessionId, SessionState};

/// Result of `configure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConfigureOutcome {
    /// A session was created (or replaced, for subscriptions).
    Created { session_id: SessionId },
    /// The same dedup key was accepted moments ago; nothing was created.
    Duplicate { key: String },
}

impl ConfigureOutcome {
    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::Created { session_id } => Some(session_id),
            Self::Duplicate { .. } => None,
        }
    }
}

/// Result of `activate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActivateOutcome {
    /// A fresh transport is being opened.
    Connecting,
    /// The session was already active (or needs no transport yet); its
    /// history was replayed to observers.
    Attached { state: SessionState, replayed: usize },
    /// The session was deliberately closed; its history was replayed and
    /// no transport was opened.
    ClosedWithHistory { replayed: usize },
}

/// Result of `send`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SendOutcome {
    /// The payload was recorded and handed to the transport.
    Sent,
    /// Unary call response.
    Response { payload: Payload },
}

/// Result of pause/resume/close/cancel/end/clear-closed-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ControlOutcome {
    Applied,
    /// The operation was not applicable in the current state.
    NoOp { state: SessionState },
}

impl ControlOutcome {
    #[must_use]
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configure_outcome_session_id() {
        let created = ConfigureOutcome::Created {
            session_id: SessionId::new("abc"),
        };
        assert_eq!(created.session_id().map(SessionId::as_str), Some("abc"));
        let dup = ConfigureOutcome::Duplicate {
            key: "k".to_string(),
        };
        assert!(dup.session_id().is_none());
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(ActivateOutcome::ClosedWithHistory { replayed: 2 }).unwrap();
        assert_eq!(json["status"], "closed_with_history");
        assert_eq!(json["replayed"], 2);

        let json = serde_json::to_value(ControlOutcome::NoOp {
            state: SessionState::Configured,
        })
        .unwrap();
        assert_eq!(json["status"], "no_op");
        assert_eq!(json["state"], "configured");
    }
}
