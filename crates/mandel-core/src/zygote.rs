//! Warm mandelbox pool.
//!
//! A filler task keeps a number of unassigned mandelboxes in `WAITING` so the
//! scheduler can hand one to a user without paying for Phase 1. Warm
//! mandelboxes are ordinary registry entries; the pool only decides when to
//! create more.
//!
//! # Example
//!
//! ```ignore
//! let mut pool = WarmPool::new(ctx.clone());
//! pool.start();
//! // ...
//! pool.shutdown().await;
//! ```

use crate::context::HostContext;
use crate::spinup::start_spin_up;
use crate::types::{MandelboxId, MandelboxStatus};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

// ============================================================================
// Statistics
// ============================================================================

/// Warm pool counters.
#[derive(Debug, Default)]
pub struct WarmPoolStats {
    /// Warm mandelboxes that reached `WAITING`.
    pub created: AtomicU64,
    /// Warm spin-ups that failed.
    pub failed: AtomicU64,
}

impl WarmPoolStats {
    /// Warm mandelboxes created so far.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Failed warm spin-ups so far.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Keeps `warm_pool_size` unassigned mandelboxes ready.
pub struct WarmPool {
    ctx: Arc<HostContext>,
    booting: Arc<Mutex<HashSet<MandelboxId>>>,
    boot_semaphore: Arc<Semaphore>,
    stats: Arc<WarmPoolStats>,
    filler_handle: Option<JoinHandle<()>>,
}

impl WarmPool {
    /// Create a pool for `ctx`. Nothing is booted until [`WarmPool::start`].
    pub fn new(ctx: Arc<HostContext>) -> Self {
        let boots = ctx.config().max_concurrent_boots.max(1);
        Self {
            ctx,
            booting: Arc::new(Mutex::new(HashSet::new())),
            boot_semaphore: Arc::new(Semaphore::new(boots)),
            stats: Arc::new(WarmPoolStats::default()),
            filler_handle: None,
        }
    }

    /// Spawn the filler task. It stops with the context's shutdown token.
    pub fn start(&mut self) {
        if self.filler_handle.is_some() {
            tracing::warn!("Warm pool filler already started");
            return;
        }

        let target = self.ctx.config().warm_pool_size;
        let handle = tokio::spawn(filler_loop(
            Arc::clone(&self.ctx),
            Arc::clone(&self.booting),
            Arc::clone(&self.boot_semaphore),
            Arc::clone(&self.stats),
        ));
        self.filler_handle = Some(handle);
        tracing::info!(target, "Warm pool filler started");
    }

    /// Unassigned `WAITING` mandelboxes plus those still booting.
    pub fn warm_count(&self) -> usize {
        warm_count(&self.ctx, &self.booting.lock())
    }

    /// Pool counters.
    pub fn stats(&self) -> &WarmPoolStats {
        &self.stats
    }

    /// Whether the filler task is running.
    pub fn is_running(&self) -> bool {
        self.filler_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the filler to exit. The caller cancels the shutdown token;
    /// warm mandelboxes are torn down through their own lifetimes.
    pub async fn shutdown(&mut self) {
        if let Some(handle) = self.filler_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Warm pool filler panicked");
            }
        }
        tracing::info!(
            created = self.stats.created(),
            failed = self.stats.failed(),
            "Warm pool stopped"
        );
    }
}

fn warm_count(ctx: &HostContext, booting: &HashSet<MandelboxId>) -> usize {
    let ready = ctx
        .registry()
        .all()
        .into_iter()
        .filter(|m| !booting.contains(&m.id()))
        .filter(|m| {
            m.status() == MandelboxStatus::Waiting && m.user_id().is_empty() && !m.is_closing()
        })
        .count();
    ready + booting.len()
}

async fn filler_loop(
    ctx: Arc<HostContext>,
    booting: Arc<Mutex<HashSet<MandelboxId>>>,
    semaphore: Arc<Semaphore>,
    stats: Arc<WarmPoolStats>,
) {
    let target = ctx.config().warm_pool_size;
    let fill_interval = ctx.config().warm_fill_interval;
    let shutdown = ctx.shutdown_token().clone();
    tracing::debug!("Warm pool filler loop started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                tracing::info!("Warm pool filler received shutdown signal");
                break;
            }
            _ = ctx.capacity_changed() => {}
            _ = tokio::time::sleep(fill_interval) => {}
        }

        let (current, in_flight) = {
            let booting = booting.lock();
            (warm_count(&ctx, &booting), booting.len())
        };
        if current >= target {
            continue;
        }

        // Booting entries may already be tracked; counting them twice only
        // makes the capacity check stricter.
        let room = ctx.remaining_capacity().saturating_sub(in_flight);
        let needed = (target - current).min(room);
        if needed == 0 {
            tracing::trace!(current, target, "Warm pool below target but host is full");
            continue;
        }
        tracing::debug!(current, target, needed, "Warm pool below target, filling");

        for _ in 0..needed {
            let permit = match semaphore.clone().try_acquire_owned() {
                Ok(p) => p,
                Err(_) => {
                    tracing::trace!("Boot semaphore full, skipping");
                    continue;
                }
            };

            let id = MandelboxId::new();
            booting.lock().insert(id);
            let tracker = ctx.tracker().clone();
            let ctx = Arc::clone(&ctx);
            let booting = Arc::clone(&booting);
            let stats = Arc::clone(&stats);
            let app = ctx.config().default_app.clone();

            tracker.spawn(async move {
                let _permit = permit;
                if ctx.shutdown_token().is_cancelled() {
                    booting.lock().remove(&id);
                    return;
                }

                match start_spin_up(&ctx, id, app).await {
                    Ok(_) => {
                        stats.created.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(mandelbox_id = %id, "Warm mandelbox ready");
                    }
                    Err(e) => {
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(mandelbox_id = %id, error = %e, "Failed to create warm mandelbox");
                    }
                }
                booting.lock().remove(&id);
            });
        }
    }

    tracing::debug!("Warm pool filler loop exited");
}
