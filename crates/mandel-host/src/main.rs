//! Mandelbox host service entry point.
//!
//! Start-up:
//! 1. Load and validate configuration
//! 2. Create the working directories (refusing to reuse an existing one)
//! 3. Connect to Docker and the object store, register the instance
//! 4. Warm up the runtime on deployed hosts
//! 5. Start the handshake server, event loop, warm pool and maintenance
//!
//! Shutdown happens on SIGINT, SIGTERM, a lost runtime connection, or the
//! scheduler draining this instance.

use anyhow::Context;
use mandel_core::{
    run_event_loop, run_maintenance, warm_up_runtime, DisabledStateStore, HostContext, LoopExit,
    MemoryStateStore, ServiceConfig, StateStore, SubscriptionEvent, UinputFactory, WarmPool,
    WarmupOptions, MAINTENANCE_INTERVAL,
};
use mandel_host::http::{self, AppState};
use mandel_host::{HostConfig, ObjectStoreKind};
use mandel_runtime::DockerRuntime;
use mandel_storage::{MemoryStore, ObjectStore, S3Store};
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long shutdown waits for mandelboxes to finish tearing down.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(120);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("mandel_host=info".parse()?)
                .add_directive("mandel_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting mandelbox host service");

    let config = HostConfig::from_env();
    tracing::info!(?config, "Configuration loaded");
    config.validate_warn();
    config.validate()?;

    init_directories(&config.service)?;
    let result = run(&config).await;
    remove_directories(&config.service);

    match result {
        Ok(true) => {
            tracing::info!("Instance drained, powering off");
            let status = tokio::process::Command::new("shutdown")
                .arg("now")
                .status()
                .await
                .context("failed to run shutdown")?;
            if !status.success() {
                anyhow::bail!("shutdown exited with {status}");
            }
            Ok(())
        }
        Ok(false) => {
            tracing::info!("Host service shutdown complete");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Host service failed");
            Err(e)
        }
    }
}

/// Run the service until shutdown. Returns whether the instance was
/// drained and should power off.
async fn run(config: &HostConfig) -> anyhow::Result<bool> {
    let service = config.service.clone();
    let instance = service.instance_name.clone();
    let environment = service.environment;

    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("failed to connect to Docker")?,
    );

    let objects: Arc<dyn ObjectStore> = match config.object_store {
        ObjectStoreKind::S3 => Arc::new(
            S3Store::from_env(service.config_bucket.clone(), Some(config.aws_region.clone()))
                .await,
        ),
        ObjectStoreKind::Memory => Arc::new(MemoryStore::new()),
    };

    let (store, subscriptions) = build_state_store(config);
    store
        .register_instance(&instance, service.mandelbox_capacity)
        .await
        .context("failed to register instance")?;
    tracing::info!(instance = %instance, environment = %environment, "Registered instance");

    let ctx = HostContext::new(
        service,
        runtime,
        objects,
        Arc::clone(&store),
        Arc::new(UinputFactory::default()),
    )?;

    if !environment.is_local() && config.warmup_iterations > 0 {
        let options = WarmupOptions {
            iterations: config.warmup_iterations,
            ..Default::default()
        };
        if let Err(e) = warm_up_runtime(&ctx, &options).await {
            unregister(store.as_ref(), &instance).await;
            return Err(e).context("runtime warm-up failed");
        }
    }

    let (requests_tx, requests_rx) = mpsc::channel(64);

    let http_handle = {
        let token = ctx.shutdown_token().clone();
        let addr = config.http_addr;
        tokio::spawn(async move {
            let shutdown = async move { token.cancelled().await };
            if let Err(e) = http::serve(AppState::new(requests_tx), addr, shutdown).await {
                tracing::error!(error = %e, "Handshake server error");
            }
        })
    };

    let mut event_loop = tokio::spawn(run_event_loop(ctx.clone(), requests_rx, subscriptions));

    let mut pool = WarmPool::new(ctx.clone());
    if ctx.config().warm_pool_size > 0 {
        pool.start();
    }

    let maintenance = (!environment.is_local_without_db())
        .then(|| tokio::spawn(run_maintenance(ctx.clone(), MAINTENANCE_INTERVAL)));

    tracing::info!(http_addr = %config.http_addr, "Host service ready");

    let mut sigterm = unix_signal(SignalKind::terminate())?;
    let mut loop_finished = false;
    let draining = tokio::select! {
        _ = signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down");
            false
        }
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, shutting down");
            false
        }
        _ = ctx.shutdown_token().cancelled() => false,
        exit = &mut event_loop => {
            loop_finished = true;
            match exit {
                Ok(Ok(LoopExit::Draining)) => true,
                Ok(Ok(LoopExit::Shutdown)) => false,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "Event loop failed");
                    false
                }
                Err(e) => {
                    tracing::error!(error = %e, "Event loop panicked");
                    false
                }
            }
        }
    };

    if !ctx.shutdown(SHUTDOWN_TIMEOUT).await {
        tracing::warn!("Some mandelboxes did not finish tearing down");
    }
    pool.shutdown().await;
    if !loop_finished {
        if let Err(e) = event_loop.await {
            tracing::error!(error = %e, "Event loop panicked");
        }
    }
    let _ = http_handle.await;
    if let Some(handle) = maintenance {
        let _ = handle.await;
    }

    unregister(store.as_ref(), &instance).await;
    Ok(draining)
}

fn build_state_store(
    config: &HostConfig,
) -> (
    Arc<dyn StateStore>,
    mpsc::UnboundedReceiver<SubscriptionEvent>,
) {
    if config.uses_in_process_state_store() {
        // The SQL-backed store lives outside this service; the in-memory
        // one stands in for it and never assigns users.
        let memory = Arc::new(MemoryStateStore::new());
        let rx = memory.subscribe();
        let store: Arc<dyn StateStore> = memory;
        (store, rx)
    } else {
        let store: Arc<dyn StateStore> = Arc::new(DisabledStateStore);
        let (_tx, rx) = mpsc::unbounded_channel();
        (store, rx)
    }
}

async fn unregister(store: &dyn StateStore, instance: &str) {
    if let Err(e) = store.unregister_instance(instance).await {
        tracing::error!(instance = %instance, error = %e, "Failed to unregister instance");
    } else {
        tracing::info!(instance = %instance, "Unregistered instance");
    }
}

fn init_directories(service: &ServiceConfig) -> anyhow::Result<()> {
    if service.whist_dir.exists() {
        anyhow::bail!(
            "{} already exists; is another host service running?",
            service.whist_dir.display()
        );
    }
    for dir in service.owned_dirs() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o777))?;
    }
    Ok(())
}

fn remove_directories(service: &ServiceConfig) {
    for dir in service.owned_dirs().iter().rev() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %dir.display(), error = %e, "Failed to remove directory");
            }
        }
    }
}
