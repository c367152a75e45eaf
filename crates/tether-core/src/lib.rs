//! tether core - shared types for the connection manager
//!
//! This crate provides the domain types shared between the daemon
//! (tetherd) and its clients, plus the leaf components of the manager
//! that need no I/O:
//! - `log` - bounded per-session Message Log used for replay
//! - `dedup` - short-window duplicate request suppression
//! - `proxy` - proxy/TLS resolution for outbound targets
//! - `settings` - TOML settings with env overrides
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod dedup;
pub mod error;
pub mod event;
pub mod log;
pub mod outcome;
pub mod proxy;
pub mod record;
pub mod session;
pub mod settings;

// Re-exports for convenience
pub use dedup::{DedupGuard, DEFAULT_DEDUP_WINDOW};
pub use error::{DomainError, DomainResult};
pub use event::{ConnectionEvent, EventKind};
pub use log::MessageLog;
pub use outcome::{ActivateOutcome, ConfigureOutcome, ControlOutcome, SendOutcome};
pub use proxy::{resolve as resolve_proxy, ProxyInfo, ProxyResolution};
pub use record::{
    Direction, ErrorInfo, ErrorSource, MessageRecord, Payload, RecordKind, CLOSE_GOING_AWAY,
    CLOSE_INACTIVITY, CLOSE_NORMAL, CLOSE_REPLACED,
};
pub use session::{
    rpc_authority, CallDescriptor, ProtocolFamily, ProtocolKind, RpcCallType, Session,
    SessionConfig, SessionId, SessionSpec, SessionState, SessionView, SubscriptionQuery,
};
pub use settings::{
    ManagerSettings, NetworkSettings, ProxyAuth, ProxyProfile, ProxySettings, Settings,
    SettingsError,
};
