//! Runtime warm-up.
//!
//! The first containers on a fresh host start slowly while images and
//! kernel caches are cold. Before accepting work, deployed hosts run a few
//! throwaway mandelboxes under the placeholder id, which never touch the
//! state store.

use crate::context::HostContext;
use crate::error::Result;
use crate::spinup::start_spin_up;
use crate::types::MandelboxId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// How a warm-up pass runs.
#[derive(Debug, Clone)]
pub struct WarmupOptions {
    /// Throwaway mandelboxes started one after another.
    pub iterations: usize,
    /// How long to wait for the in-container app each time.
    pub app_ready_timeout: Duration,
    /// Pause after the app is up before the container is stopped.
    pub settle: Duration,
}

impl Default for WarmupOptions {
    fn default() -> Self {
        Self {
            iterations: 2,
            app_ready_timeout: Duration::from_secs(300),
            settle: Duration::from_secs(5),
        }
    }
}

/// Start and tear down `options.iterations` placeholder mandelboxes running
/// the default app.
///
/// # Errors
/// Fails if a placeholder cannot be spun up. An app that never reports
/// ready is only logged.
pub async fn warm_up_runtime(ctx: &Arc<HostContext>, options: &WarmupOptions) -> Result<()> {
    let app = ctx.config().default_app.clone();

    for iteration in 0..options.iterations {
        let started = Instant::now();
        let mandelbox = start_spin_up(ctx, MandelboxId::placeholder(), app.clone()).await?;
        let mappings = mandelbox.mappings();

        let ready = async {
            mappings.mark_params_ready().await?;
            mappings.mark_config_ready().await?;
            mappings
                .wait_for_app_ready(options.app_ready_timeout, mandelbox.lifetime())
                .await
        };
        if let Err(e) = ready.await {
            tracing::warn!(iteration, error = %e, "Warm-up app did not become ready");
        } else if !options.settle.is_zero() {
            tokio::time::sleep(options.settle).await;
        }

        if let Some(container) = mandelbox.container_id() {
            if let Err(e) = ctx
                .runtime()
                .stop(&container, ctx.config().stop_timeout)
                .await
            {
                tracing::warn!(iteration, error = %e, "Failed to stop warm-up container");
            }
        }
        mandelbox.close();
        mandelbox.closed().await;

        tracing::info!(
            iteration,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished warm-up iteration"
        );
    }
    Ok(())
}
