//! Connection manager using the Actor pattern.
//!
//! The manager is the single owner of every session: registry, Message
//! Logs, dedup keys and timers. It receives commands via a tokio mpsc
//! channel, callbacks from the transport tasks it spawns via a second
//! channel, and publishes records to observers via broadcast.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  ManagerCommand  ┌─────────────────┐  ConnectionEvent  ┌──────────────┐
//! │  ManagerHandle  │─────────────────▶│  ManagerActor   │──────────────────▶│  Observers   │
//! └─────────────────┘   (mpsc)         └────────┬────────┘   (broadcast)     └──────────────┘
//!                                          ▲    │ spawn
//!                               TaskEvent  │    ▼
//!                                     ┌────┴────────────┐
//!                                     │ transport tasks │
//!                                     │ sweeper timers  │
//!                                     └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All operations in this module follow the panic-free policy:
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use tether_core::Settings;

use crate::transport::Connectors;

mod actor;
mod commands;
mod context;
mod handle;

pub use actor::ManagerActor;
pub use commands::{ManagerCommand, ManagerError, Responder, TaskEvent};
pub use context::{error_info, ManagerContext, PendingResubscribe};
pub use handle::{ManagerHandle, DEFAULT_CLOSE_REASON};

/// Spawn the manager actor and return a handle for interaction.
///
/// This function:
/// 1. Creates the command, task-event and observer channels
/// 2. Spawns the ManagerActor on a tokio task
/// 3. Spawns the periodic sweep task
/// 4. Returns a ManagerHandle for client use
///
/// # Example
///
/// ```no_run
/// use tether_core::Settings;
/// use tetherd::manager::spawn_manager;
/// use tetherd::transport::Connectors;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_manager(Settings::default(), Connectors::default());
///     let sessions = handle.list().await;
/// }
/// ```
pub fn spawn_manager(settings: Settings, connectors: Connectors) -> ManagerHandle {
    let command_buffer = settings.manager.command_buffer.max(1);
    let event_buffer = settings.manager.event_buffer.max(1);
    let sweep_interval = settings.manager.sweep_interval();

    let (cmd_tx, cmd_rx) = mpsc::channel(command_buffer);
    let (task_tx, task_rx) = mpsc::channel(command_buffer);
    let (event_tx, _) = broadcast::channel(event_buffer);

    let ctx = ManagerContext::new(settings, connectors, task_tx, event_tx.clone());
    let actor = ManagerActor::new(cmd_rx, task_rx, ctx);
    tokio::spawn(actor.run());

    let handle = ManagerHandle::new(cmd_tx.clone(), event_tx);

    spawn_sweep_task(cmd_tx, sweep_interval);

    handle
}

/// Spawn a background task that triggers periodic inactivity sweeps.
fn spawn_sweep_task(sender: mpsc::Sender<ManagerCommand>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;

            // Fire-and-forget sweep command
            if sender.send(ManagerCommand::Sweep).await.is_err() {
                // Channel closed, actor stopped - exit sweep task
                debug!("Sweep task stopping: manager channel closed");
                break;
            }
        }
    });
}
