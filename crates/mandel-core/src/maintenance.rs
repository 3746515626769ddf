//! Periodic state-store upkeep.

use crate::context::HostContext;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Base interval between maintenance passes.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

const MAX_JITTER_MS: u64 = 1000;

/// Remove stale mandelbox rows and heartbeat with the remaining capacity,
/// every `interval` plus up to a second of jitter, until shutdown.
pub async fn run_maintenance(ctx: Arc<HostContext>, interval: Duration) {
    let shutdown = ctx.shutdown_token().clone();
    tracing::debug!(interval_secs = interval.as_secs(), "Maintenance task started");

    loop {
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS));
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval + jitter) => {}
        }
        maintenance_pass(&ctx).await;
    }

    tracing::debug!("Maintenance task exited");
}

/// One maintenance pass. Store errors are logged and the pass continues.
pub async fn maintenance_pass(ctx: &HostContext) {
    let instance = &ctx.config().instance_name;

    match ctx.store().remove_stale_mandelboxes(instance).await {
        Ok(0) => {}
        Ok(removed) => tracing::info!(removed, "Removed stale mandelbox rows"),
        Err(e) => tracing::warn!(error = %e, "Failed to remove stale mandelboxes"),
    }

    let remaining = ctx.remaining_capacity();
    if let Err(e) = ctx.store().heartbeat(instance, remaining).await {
        tracing::warn!(error = %e, remaining, "Instance heartbeat failed");
    } else {
        tracing::trace!(remaining, "Sent instance heartbeat");
    }
}
