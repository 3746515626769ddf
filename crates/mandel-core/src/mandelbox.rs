//! The mandelbox entity.
//!
//! A [`Mandelbox`] records what one container was given: identity, user,
//! session, resources and status. Fields live behind one lock that is taken
//! for a single read or write and never held across an await or a call into
//! a pool.
//!
//! Each entity owns a lifetime token derived from the process token. A
//! watcher task waits on it and runs the teardown exactly once, whether the
//! token was cancelled by [`Mandelbox::close`] or by process shutdown.
//! Teardown first waits for an in-flight Phase 1 to unwind, so everything
//! Phase 1 recorded is released.

use crate::context::HostContext;
use crate::error::{CoreError, Result};
use crate::params::ResourceMappings;
use crate::resources::{PortBinding, Tty, UinputDevices};
use crate::types::{
    AppName, ConfigEncryptionToken, MandelboxId, MandelboxStatus, SessionId, SessionKey, UserId,
};
use crate::user_configs;
use mandel_runtime::{ContainerId, DeviceMapping};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio_util::sync::CancellationToken;

/// Device every container gets for its FUSE mounts.
const FUSE_DEVICE: &str = "/dev/fuse";

#[derive(Debug)]
struct MandelboxData {
    status: MandelboxStatus,
    container_id: Option<ContainerId>,
    app_name: AppName,
    user_id: UserId,
    session_id: SessionId,
    client_connected: bool,
    tty: Option<Tty>,
    gpu: Option<u32>,
    port_bindings: Vec<PortBinding>,
    uinput: Option<Arc<UinputDevices>>,
    devices: Vec<DeviceMapping>,
    config_token: ConfigEncryptionToken,
    session_key: SessionKey,
}

/// One mandelbox and the resources it holds.
pub struct Mandelbox {
    id: MandelboxId,
    ctx: Arc<HostContext>,
    lifetime: CancellationToken,
    torn_down: CancellationToken,
    phase_one: AsyncMutex<()>,
    mappings: ResourceMappings,
    data: RwLock<MandelboxData>,
}

impl std::fmt::Debug for Mandelbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mandelbox")
            .field("id", &self.id)
            .field("data", &*self.data.read())
            .finish_non_exhaustive()
    }
}

impl Mandelbox {
    /// Create and track a mandelbox, and start its teardown watcher.
    ///
    /// # Errors
    /// [`CoreError::AlreadyExists`] if `id` is already tracked.
    pub fn new(ctx: &Arc<HostContext>, id: MandelboxId, app_name: AppName) -> Result<Arc<Self>> {
        let mandelbox = Arc::new(Self {
            id,
            ctx: Arc::clone(ctx),
            lifetime: ctx.shutdown_token().child_token(),
            torn_down: CancellationToken::new(),
            phase_one: AsyncMutex::new(()),
            mappings: ResourceMappings::new(
                ctx.config()
                    .mandelbox_dir(id)
                    .join("mandelboxResourceMappings"),
            ),
            data: RwLock::new(MandelboxData {
                status: MandelboxStatus::Waiting,
                container_id: None,
                app_name,
                user_id: UserId::default(),
                session_id: SessionId::default(),
                client_connected: false,
                tty: None,
                gpu: None,
                port_bindings: Vec::new(),
                uinput: None,
                devices: vec![DeviceMapping::same_path(FUSE_DEVICE, "rwm")],
                config_token: ConfigEncryptionToken::default(),
                session_key: SessionKey::default(),
            }),
        });

        ctx.registry().track(Arc::clone(&mandelbox))?;

        let watcher = Arc::clone(&mandelbox);
        ctx.tracker().spawn(async move {
            watcher.lifetime.cancelled().await;
            watcher.teardown().await;
            watcher.torn_down.cancel();
        });

        tracing::debug!(mandelbox_id = %id, "Created mandelbox");
        Ok(mandelbox)
    }

    pub fn id(&self) -> MandelboxId {
        self.id
    }

    pub(crate) fn context(&self) -> &Arc<HostContext> {
        &self.ctx
    }

    /// Lifetime token, cancelled when the mandelbox is closing.
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Held by Phase 1 while it creates things; teardown waits for it.
    pub(crate) async fn phase_one_guard(&self) -> AsyncMutexGuard<'_, ()> {
        self.phase_one.lock().await
    }

    /// Resource-identification files.
    pub fn mappings(&self) -> &ResourceMappings {
        &self.mappings
    }

    /// `{whist_dir}/{id}/userConfigs`
    pub fn config_dir(&self) -> PathBuf {
        self.ctx.config().mandelbox_dir(self.id).join("userConfigs")
    }

    /// `{whist_dir}/{id}/userConfigs/unpacked_configs`
    pub fn unpacked_config_dir(&self) -> PathBuf {
        self.config_dir().join("unpacked_configs")
    }

    /// Socket the container reads its input devices from.
    pub fn uinput_socket(&self) -> PathBuf {
        self.ctx.config().sockets_dir(self.id).join("uinput.sock")
    }

    // ------------------------------------------------------------------
    // Field access
    // ------------------------------------------------------------------

    pub fn status(&self) -> MandelboxStatus {
        self.data.read().status
    }

    /// Record `status` locally and in the state store. The placeholder
    /// never touches the store.
    pub async fn write_status(&self, status: MandelboxStatus) -> Result<()> {
        self.data.write().status = status;
        if self.id.is_placeholder() {
            return Ok(());
        }
        self.ctx.store().write_mandelbox_status(self.id, status).await
    }

    pub(crate) fn set_status(&self, status: MandelboxStatus) {
        self.data.write().status = status;
    }

    pub fn container_id(&self) -> Option<ContainerId> {
        self.data.read().container_id.clone()
    }

    /// Bind the runtime container id.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] for an empty id,
    /// [`CoreError::Cancelled`] once the mandelbox is closing (the caller
    /// still owns the container), [`CoreError::InvalidState`] if an id is
    /// already bound.
    pub fn register_creation(&self, container: ContainerId) -> Result<()> {
        if container.is_empty() {
            return Err(CoreError::InvalidArgument(
                "empty runtime container id".into(),
            ));
        }
        {
            let mut data = self.data.write();
            // Checked under the lock: teardown reads the id only after the
            // lifetime is cancelled.
            if self.lifetime.is_cancelled() {
                return Err(CoreError::Cancelled(format!(
                    "mandelbox {} closed before container {container} was registered",
                    self.id
                )));
            }
            if let Some(existing) = &data.container_id {
                return Err(CoreError::InvalidState {
                    expected: "no container".into(),
                    actual: format!("container {existing}"),
                });
            }
            data.container_id = Some(container.clone());
        }
        self.ctx.registry().register_container(self.id, container);
        Ok(())
    }

    pub fn app_name(&self) -> AppName {
        self.data.read().app_name.clone()
    }

    pub fn set_app_name(&self, app: AppName) {
        self.data.write().app_name = app;
    }

    pub fn user_id(&self) -> UserId {
        self.data.read().user_id.clone()
    }

    pub fn set_user_id(&self, user: UserId) {
        self.data.write().user_id = user;
    }

    pub fn session_id(&self) -> SessionId {
        self.data.read().session_id.clone()
    }

    pub fn set_session_id(&self, session: SessionId) {
        self.data.write().session_id = session;
    }

    /// Whether a client ever completed the handshake.
    pub fn is_connected(&self) -> bool {
        self.data.read().client_connected
    }

    pub fn set_connected(&self, connected: bool) {
        self.data.write().client_connected = connected;
    }

    pub fn config_token(&self) -> ConfigEncryptionToken {
        self.data.read().config_token.clone()
    }

    pub fn set_config_token(&self, token: ConfigEncryptionToken) {
        self.data.write().config_token = token;
    }

    pub fn session_key(&self) -> SessionKey {
        self.data.read().session_key.clone()
    }

    pub fn set_session_key(&self, key: SessionKey) {
        self.data.write().session_key = key;
    }

    pub fn tty(&self) -> Option<Tty> {
        self.data.read().tty
    }

    /// Record the TTY handed out for this mandelbox.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] if one is already recorded; the caller
    /// still owns `tty`.
    pub fn set_tty(&self, tty: Tty) -> Result<()> {
        let mut data = self.data.write();
        if let Some(existing) = data.tty {
            return Err(already_allocated("tty", existing));
        }
        data.tty = Some(tty);
        Ok(())
    }

    pub fn gpu(&self) -> Option<u32> {
        self.data.read().gpu
    }

    /// Record the GPU index. Same contract as [`Mandelbox::set_tty`].
    pub fn set_gpu(&self, index: u32) -> Result<()> {
        let mut data = self.data.write();
        if let Some(existing) = data.gpu {
            return Err(already_allocated("gpu", existing));
        }
        data.gpu = Some(index);
        Ok(())
    }

    pub fn port_bindings(&self) -> Vec<PortBinding> {
        self.data.read().port_bindings.clone()
    }

    /// Record the port bindings. Same contract as [`Mandelbox::set_tty`].
    pub fn set_port_bindings(&self, bindings: Vec<PortBinding>) -> Result<()> {
        let mut data = self.data.write();
        if !data.port_bindings.is_empty() {
            return Err(already_allocated("port bindings", data.port_bindings.len()));
        }
        data.port_bindings = bindings;
        Ok(())
    }

    pub fn uinput_devices(&self) -> Option<Arc<UinputDevices>> {
        self.data.read().uinput.clone()
    }

    /// Record the input devices and their container mappings. Same contract
    /// as [`Mandelbox::set_tty`].
    pub fn set_uinput_devices(
        &self,
        devices: Arc<UinputDevices>,
        mappings: Vec<DeviceMapping>,
    ) -> Result<()> {
        let mut data = self.data.write();
        if data.uinput.is_some() {
            return Err(already_allocated("uinput devices", "set"));
        }
        data.uinput = Some(devices);
        data.devices.extend(mappings);
        Ok(())
    }

    /// Devices to map into the container.
    pub fn devices(&self) -> Vec<DeviceMapping> {
        self.data.read().devices.clone()
    }

    // ------------------------------------------------------------------
    // Lifetime
    // ------------------------------------------------------------------

    /// Start teardown. Safe to call any number of times.
    pub fn close(&self) {
        self.lifetime.cancel();
    }

    /// Whether teardown has been requested.
    pub fn is_closing(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Wait until teardown has finished.
    pub async fn closed(&self) {
        self.torn_down.cancelled().await;
    }

    async fn teardown(&self) {
        let id = self.id;
        let started = Instant::now();
        let placeholder = id.is_placeholder();
        let _phase_one = self.phase_one.lock().await;
        tracing::info!(mandelbox_id = %id, "Tearing down mandelbox");

        self.set_status(MandelboxStatus::Dying);
        if !placeholder {
            if let Err(e) = self
                .ctx
                .store()
                .write_mandelbox_status(id, MandelboxStatus::Dying)
                .await
            {
                tracing::warn!(mandelbox_id = %id, error = %e, "Failed to mark mandelbox dying");
            }
        }

        self.ctx.registry().untrack(id);
        self.ctx.handshakes().clear(id);

        if let Some(container) = self.container_id() {
            if let Err(e) = self.ctx.runtime().remove(&container).await {
                tracing::warn!(
                    mandelbox_id = %id,
                    container_id = %container,
                    error = %e,
                    "Failed to remove container"
                );
            }
        }

        let (bindings, uinput, tty, gpu) = {
            let mut data = self.data.write();
            (
                std::mem::take(&mut data.port_bindings),
                data.uinput.take(),
                data.tty.take(),
                data.gpu.take(),
            )
        };
        let pools = self.ctx.pools();
        pools.ports.free(&bindings);
        drop(uinput);
        if let Some(tty) = tty {
            pools.tty.free(tty);
        }
        if gpu.is_some() && !self.ctx.config().running_in_ci {
            pools.gpu.free(id);
        }

        if let Err(e) = self.mappings.remove().await {
            tracing::warn!(mandelbox_id = %id, error = %e, "Failed to remove resource mappings");
        }

        if self.is_connected() {
            if let Err(e) = user_configs::backup_user_configs(self).await {
                tracing::error!(mandelbox_id = %id, error = %e, "Failed to back up user configs");
            }
        } else {
            tracing::debug!(mandelbox_id = %id, "Client never connected, skipping config backup");
        }

        for dir in [
            self.config_dir(),
            self.ctx.config().mandelbox_dir(id),
            self.ctx.config().temp_dir.join(id.to_string()),
        ] {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(mandelbox_id = %id, path = %dir.display(), error = %e, "Failed to remove directory");
                }
            }
        }

        if !placeholder {
            if let Err(e) = self.ctx.store().remove_mandelbox(id).await {
                tracing::warn!(mandelbox_id = %id, error = %e, "Failed to remove mandelbox row");
            }
        }

        self.ctx.notify_capacity_changed();
        tracing::info!(
            mandelbox_id = %id,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Mandelbox torn down"
        );
    }
}

fn already_allocated(resource: &str, existing: impl std::fmt::Display) -> CoreError {
    CoreError::InvalidState {
        expected: format!("no {resource}"),
        actual: format!("{resource} {existing}"),
    }
}
