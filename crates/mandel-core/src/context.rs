//! Shared state of one host process.

use crate::config::ServiceConfig;
use crate::error::Result;
use crate::handshake::HandshakeMap;
use crate::registry::Registry;
use crate::resources::{InputDeviceFactory, ResourcePools};
use crate::store::StateStore;
use mandel_runtime::ContainerRuntime;
use mandel_storage::ObjectStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Everything a mandelbox needs from its surroundings.
///
/// Every mandelbox lifetime is a child of [`HostContext::shutdown_token`];
/// every teardown watcher runs on [`HostContext::tracker`].
pub struct HostContext {
    config: ServiceConfig,
    runtime: Arc<dyn ContainerRuntime>,
    objects: Arc<dyn ObjectStore>,
    store: Arc<dyn StateStore>,
    registry: Registry,
    pools: ResourcePools,
    handshakes: HandshakeMap,
    shutdown: CancellationToken,
    tasks: TaskTracker,
    capacity_changed: Notify,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("instance", &self.config.instance_name)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl HostContext {
    /// Validate `config` and build the pools.
    pub fn new(
        config: ServiceConfig,
        runtime: Arc<dyn ContainerRuntime>,
        objects: Arc<dyn ObjectStore>,
        store: Arc<dyn StateStore>,
        input_devices: Arc<dyn InputDeviceFactory>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let pools = ResourcePools::new(&config, input_devices);

        tracing::info!(
            instance = %config.instance_name,
            environment = %config.environment,
            capacity = config.mandelbox_capacity,
            gpus = config.gpu_count,
            "Creating host context"
        );

        Ok(Arc::new(Self {
            config,
            runtime,
            objects,
            store,
            registry: Registry::new(),
            pools,
            handshakes: HandshakeMap::new(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            capacity_changed: Notify::new(),
        }))
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub fn objects(&self) -> &Arc<dyn ObjectStore> {
        &self.objects
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn pools(&self) -> &ResourcePools {
        &self.pools
    }

    pub fn handshakes(&self) -> &HandshakeMap {
        &self.handshakes
    }

    /// Process-wide lifetime. Cancelling it tears down every mandelbox.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Tracker of background tasks that must finish before exit.
    pub fn tracker(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Mandelboxes this instance can still take.
    pub fn remaining_capacity(&self) -> usize {
        self.config
            .mandelbox_capacity
            .saturating_sub(self.registry.len())
    }

    /// Wake whoever waits for capacity changes.
    pub fn notify_capacity_changed(&self) {
        self.capacity_changed.notify_one();
    }

    /// Wait until capacity may have changed.
    pub async fn capacity_changed(&self) {
        self.capacity_changed.notified().await;
    }

    /// Close unconnected mandelboxes, cancel everything else, and wait up to
    /// `timeout` for tracked tasks. Returns whether they all finished.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let closed = self.registry.close_unconnected();
        tracing::info!(closed, "Shutting down host context");

        self.shutdown.cancel();
        self.tasks.close();
        match tokio::time::timeout(timeout, self.tasks.wait()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(
                    timeout_secs = timeout.as_secs(),
                    remaining = self.tasks.len(),
                    "Timed out waiting for tasks to finish"
                );
                false
            }
        }
    }
}
