//! The host's central dispatcher.
//!
//! ```text
//!   runtime events ──┐
//!   handshakes ──────┼──▶ run_event_loop ──▶ spawned handlers (tracker)
//!   subscriptions ───┘          │
//!                               └── shutdown token
//! ```
//!
//! The loop itself never blocks on slow work: every handler runs as a
//! tracked task so shutdown can wait for it.

use crate::context::HostContext;
use crate::error::{CoreError, Result};
use crate::handshake::HandshakeRequest;
use crate::mandelbox::Mandelbox;
use crate::spinup::{finish_spin_up, start_spin_up};
use crate::store::{MandelboxAssignment, SubscriptionEvent};
use crate::types::SessionId;
use futures::StreamExt;
use mandel_runtime::{ContainerId, EventStreamError, RuntimeEvent};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Why the event loop returned normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The shutdown token was cancelled.
    Shutdown,
    /// The scheduler is draining this instance; the host should exit and
    /// power the machine off.
    Draining,
}

/// Dispatch runtime events, client handshakes and state-store subscription
/// events until shutdown or draining.
///
/// # Errors
/// [`CoreError::Fatal`] if the runtime event stream is lost. The shutdown
/// token is cancelled before returning.
pub async fn run_event_loop(
    ctx: Arc<HostContext>,
    mut requests: mpsc::Receiver<HandshakeRequest>,
    mut subscriptions: mpsc::UnboundedReceiver<SubscriptionEvent>,
) -> Result<LoopExit> {
    let shutdown = ctx.shutdown_token().clone();
    let mut events = ctx.runtime().events();
    tracing::info!("Event loop started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Event loop received shutdown signal");
                return Ok(LoopExit::Shutdown);
            }

            event = events.next() => match event {
                Some(Ok(event)) => handle_runtime_event(&ctx, event),
                Some(Err(EventStreamError::Transient(reason))) => {
                    tracing::warn!(reason = %reason, "Runtime event stream error, resubscribing");
                    events = ctx.runtime().events();
                }
                Some(Err(EventStreamError::Fatal(reason))) => {
                    tracing::error!(reason = %reason, "Lost the runtime event stream");
                    shutdown.cancel();
                    return Err(CoreError::Fatal(reason));
                }
                None => {
                    tracing::error!("Runtime event stream ended");
                    shutdown.cancel();
                    return Err(CoreError::Fatal("runtime event stream ended".into()));
                }
            },

            Some(request) = requests.recv() => handle_handshake(&ctx, request),

            Some(event) = subscriptions.recv() => match event {
                SubscriptionEvent::MandelboxAssigned(assignment) => {
                    let task_ctx = Arc::clone(&ctx);
                    ctx.tracker().spawn(async move {
                        // Errors are logged inside.
                        let _ = finish_spin_up(&task_ctx, assignment).await;
                    });
                }
                SubscriptionEvent::InstanceDraining => {
                    tracing::info!(
                        instance = %ctx.config().instance_name,
                        "Instance is draining, shutting down"
                    );
                    return Ok(LoopExit::Draining);
                }
            },
        }
    }
}

fn handle_runtime_event(ctx: &Arc<HostContext>, event: RuntimeEvent) {
    tracing::trace!(container_id = %event.container_id, action = %event.action, "Runtime event");
    if event.action != "die" {
        return;
    }

    let task_ctx = Arc::clone(ctx);
    ctx.tracker().spawn(async move {
        handle_die(&task_ctx, &event.container_id).await;
    });
}

/// Tear down whatever mandelbox owned `container`. Unknown containers are
/// ignored.
pub async fn handle_die(ctx: &HostContext, container: &ContainerId) {
    let Some(mandelbox) = ctx.registry().lookup_by_container(container) else {
        tracing::debug!(container_id = %container, "Ignoring die event for unknown container");
        return;
    };

    let id = mandelbox.id();
    tracing::info!(mandelbox_id = %id, container_id = %container, "Mandelbox container died");
    ctx.handshakes().clear(id);

    if let Err(e) = ctx
        .runtime()
        .stop(container, ctx.config().stop_timeout)
        .await
    {
        tracing::warn!(mandelbox_id = %id, error = %e, "Failed to stop dead container");
    }
    mandelbox.close();
}

fn handle_handshake(ctx: &Arc<HostContext>, request: HandshakeRequest) {
    let id = request.body.mandelbox_id;
    tracing::info!(mandelbox_id = %id, "Received handshake request");

    if ctx.config().environment.is_local_without_db() {
        let task_ctx = Arc::clone(ctx);
        ctx.tracker().spawn(async move {
            local_handshake(&task_ctx, request).await;
        });
        return;
    }

    if let Err(e) = ctx.registry().lookup(id).and_then(|m| accepts_handshake(&m)) {
        request.fail(&e);
        return;
    }
    if let Err(e) = ctx.handshakes().deliver(request) {
        tracing::warn!(mandelbox_id = %id, error = %e, "Rejected handshake");
    }
}

/// Only mandelboxes still waiting for their client take a handshake.
fn accepts_handshake(mandelbox: &Mandelbox) -> Result<()> {
    let status = mandelbox.status();
    if mandelbox.is_connected() || mandelbox.is_closing() || !status.awaits_client() {
        return Err(CoreError::InvalidState {
            expected: "waiting for a client".into(),
            actual: status.to_string(),
        });
    }
    Ok(())
}

/// Without a state store nobody assigns users, so the handshake drives both
/// phases itself.
async fn local_handshake(ctx: &Arc<HostContext>, request: HandshakeRequest) {
    let id = request.body.mandelbox_id;
    let app = request
        .body
        .app_name
        .clone()
        .filter(|app| !app.is_empty())
        .unwrap_or_else(|| ctx.config().default_app.clone());

    match ctx.registry().lookup(id) {
        Ok(mandelbox) => {
            if let Err(e) = accepts_handshake(&mandelbox) {
                request.fail(&e);
                return;
            }
        }
        Err(_) => {
            tracing::info!(mandelbox_id = %id, app = %app, "Spinning up mandelbox on demand");
            if let Err(e) = start_spin_up(ctx, id, app.clone()).await {
                request.fail(&e);
                return;
            }
        }
    }

    if let Err(e) = ctx.handshakes().deliver(request) {
        tracing::warn!(mandelbox_id = %id, error = %e, "Rejected handshake");
        return;
    }

    let assignment = MandelboxAssignment {
        mandelbox_id: id,
        user_id: ctx.config().local_user_id.clone(),
        session_id: SessionId::new(chrono::Utc::now().timestamp_millis().to_string()),
        app_name: app,
        instance_name: ctx.config().instance_name.clone(),
    };
    let _ = finish_spin_up(ctx, assignment).await;
}
