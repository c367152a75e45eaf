//! Manager actor - owns every session and processes commands.
//!
//! The ManagerActor is the single owner of manager state. It receives
//! commands from handles, callbacks from the transport and timer tasks it
//! spawned, and publishes records to observers via broadcast.
//!
//! # Panic-Free Guarantees
//!
//! This module follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations use `?`, pattern matching, or `unwrap_or`
//! - Response send failures are ignored (the caller went away)

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use tether_core::{ConfigureOutcome, ProtocolKind, SessionSpec, CLOSE_GOING_AWAY};

use super::commands::{ManagerCommand, ManagerError, Responder, TaskEvent};
use super::context::ManagerContext;
use crate::controllers::{self, subscription};

/// Whether the actor keeps running after a command.
enum Flow {
    Continue,
    Stop,
}

/// The manager actor.
///
/// Runs in a single task. Commands and task callbacks are processed one at
/// a time, so no state is ever shared or locked.
pub struct ManagerActor {
    receiver: mpsc::Receiver<ManagerCommand>,

    /// Callbacks from spawned transport and timer tasks
    task_events: mpsc::Receiver<TaskEvent>,

    ctx: ManagerContext,
}

impl ManagerActor {
    pub fn new(
        receiver: mpsc::Receiver<ManagerCommand>,
        task_events: mpsc::Receiver<TaskEvent>,
        ctx: ManagerContext,
    ) -> Self {
        Self {
            receiver,
            task_events,
            ctx,
        }
    }

    /// Runs the actor event loop until shutdown or until every handle is
    /// dropped.
    pub async fn run(mut self) {
        info!("Manager actor starting");

        loop {
            tokio::select! {
                biased;

                // The actor holds a sender itself, so this never yields None.
                Some(event) = self.task_events.recv() => {
                    controllers::on_task_event(&mut self.ctx, event);
                }

                cmd = self.receiver.recv() => {
                    let Some(cmd) = cmd else {
                        debug!("All manager handles dropped");
                        self.ctx.close_all(CLOSE_GOING_AWAY, "shutdown");
                        break;
                    };
                    if let Flow::Stop = self.handle_command(cmd) {
                        break;
                    }
                }
            }
        }

        info!(sessions = self.ctx.registry.len(), "Manager actor stopped");
    }

    /// Dispatches a command to the appropriate handler.
    fn handle_command(&mut self, cmd: ManagerCommand) -> Flow {
        let ctx = &mut self.ctx;
        match cmd {
            ManagerCommand::Configure { spec, respond_to } => {
                Self::handle_configure(ctx, *spec, respond_to);
            }
            ManagerCommand::Activate {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::activate(ctx, &session_id));
            }
            ManagerCommand::Send {
                session_id,
                payload,
                respond_to,
            } => {
                controllers::send(ctx, &session_id, payload, respond_to);
            }
            ManagerCommand::Pause {
                session_id,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::pause(ctx, &session_id, reason));
            }
            ManagerCommand::Resume {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::resume(ctx, &session_id));
            }
            ManagerCommand::Close {
                session_id,
                reason,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::close(ctx, &session_id, reason));
            }
            ManagerCommand::Cancel {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::cancel(ctx, &session_id));
            }
            ManagerCommand::End {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::end(ctx, &session_id));
            }
            ManagerCommand::ClearClosedState {
                session_id,
                respond_to,
            } => {
                let _ = respond_to.send(controllers::clear_closed_state(ctx, &session_id));
            }
            ManagerCommand::Status {
                session_id,
                respond_to,
            } => {
                let result = ctx
                    .view(&session_id)
                    .ok_or(ManagerError::NotFound(session_id));
                let _ = respond_to.send(result);
            }
            ManagerCommand::List { respond_to } => {
                let mut views: Vec<_> = ctx
                    .registry
                    .ids()
                    .iter()
                    .filter_map(|id| ctx.view(id))
                    .collect();
                views.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                let _ = respond_to.send(views);
            }
            ManagerCommand::Records {
                session_id,
                since,
                respond_to,
            } => {
                let result = if ctx.registry.contains(&session_id) || ctx.log.contains(&session_id) {
                    Ok(ctx.log.records_since(&session_id, since))
                } else {
                    Err(ManagerError::NotFound(session_id))
                };
                let _ = respond_to.send(result);
            }
            ManagerCommand::UpdateNetworkSettings {
                settings,
                respond_to,
            } => {
                info!(
                    proxy_enabled = settings.proxy.enabled,
                    validate_certificates = settings.validate_certificates,
                    "Network settings updated"
                );
                ctx.network = *settings;
                let _ = respond_to.send(());
            }
            ManagerCommand::Sweep => {
                Self::handle_sweep(ctx);
            }
            ManagerCommand::Shutdown { respond_to } => {
                info!(sessions = ctx.registry.len(), "Manager shutting down");
                ctx.close_all(CLOSE_GOING_AWAY, "shutdown");
                let _ = respond_to.send(());
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    // ========================================================================
    // Command Handlers
    // ========================================================================

    /// Validates and registers a session description.
    ///
    /// A repeated request with the same dedup key inside the window is
    /// answered as a duplicate without side effects. Subscriptions whose
    /// derived id already exists replace the existing session.
    fn handle_configure(
        ctx: &mut ManagerContext,
        spec: SessionSpec,
        respond_to: Responder<ConfigureOutcome>,
    ) {
        if let Err(e) = spec.validate() {
            warn!(kind = %spec.kind, target = %spec.target, error = %e, "Rejected configuration");
            let _ = respond_to.send(Err(e.into()));
            return;
        }

        if let Some(key) = spec.config.dedup_key.as_deref() {
            if !ctx.dedup.should_accept(key, Utc::now()) {
                debug!(key, "Duplicate configure suppressed");
                let _ = respond_to.send(Ok(ConfigureOutcome::Duplicate {
                    key: key.to_string(),
                }));
                return;
            }
        }

        let session_id = spec.derive_id();
        let replaces = spec.kind == ProtocolKind::Subscription
            && (ctx.registry.contains(&session_id)
                || ctx.pending_resubscribe.contains_key(&session_id));
        if replaces {
            subscription::resubscribe(ctx, session_id, spec, respond_to);
            return;
        }

        ctx.create_session(session_id.clone(), spec);
        let _ = respond_to.send(Ok(ConfigureOutcome::Created { session_id }));
    }

    /// Reaps sessions idle beyond the inactivity threshold and schedules
    /// their purge.
    fn handle_sweep(ctx: &mut ManagerContext) {
        let idle = ctx.sweeper.idle_sessions(&ctx.registry, &ctx.log, Utc::now());
        if idle.is_empty() {
            debug!(sessions = ctx.registry.len(), "Sweep found no idle sessions");
            return;
        }

        for session_id in &idle {
            warn!(session_id = %session_id, "Reaping idle session");
            controllers::reap(ctx, session_id);
            ctx.schedule_purge(session_id);
        }
        info!(reaped = idle.len(), remaining = ctx.registry.len(), "Sweep complete");
    }

    // ========================================================================
    // Test helpers
    // ========================================================================

    #[cfg(test)]
    pub fn context(&self) -> &ManagerContext {
        &self.ctx
    }

    #[cfg(test)]
    pub fn context_mut(&mut self) -> &mut ManagerContext {
        &mut self.ctx
    }
}
