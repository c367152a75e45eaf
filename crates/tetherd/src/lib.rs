//! tether daemon - connection manager and event broadcast server
//!
//! This crate provides the runtime half of tether:
//! - `manager` - the connection manager actor and its handle
//! - `controllers` - per-protocol lifecycle state machines
//! - `registry` - session-id to session state plus live transport
//! - `sweeper` - inactivity reaping and delayed purge/re-create timers
//! - `transport` - stream and RPC connectors (WebSocket, JSON-lines RPC)
//! - `server` - Unix socket server for UI clients
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       tetherd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │  DaemonServer   │────▶│       ManagerActor          │   │
//! │  │ (Unix Socket)   │     │ registry · logs · sweeper   │   │
//! │  └────────┬────────┘     └──────┬───────────────▲──────┘   │
//! │           │                     │ spawn         │ TaskEvent │
//! │           │ connections         ▼               │           │
//! │           ▼              ┌─────────────────────────────┐   │
//! │  ┌─────────────────┐     │  transport tasks (ws / rpc) │   │
//! │  │ConnectionHandler│     └─────────────────────────────┘   │
//! │  │  (per client)   │◀──── broadcast::Sender<ConnectionEvent>│
//! │  └─────────────────┘                                       │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod controllers;
pub mod manager;
pub mod registry;
pub mod server;
pub mod sweeper;
pub mod transport;
