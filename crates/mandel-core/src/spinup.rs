//! Two-phase spin-up.
//!
//! Phase 1 ([`start_spin_up`]) does everything that needs no user: it
//! allocates resources, creates and starts the container and writes the
//! resource-identification files. The mandelbox then sits in `WAITING`.
//!
//! Phase 2 ([`finish_spin_up`]) runs once the scheduler assigns a user. It
//! restores the user's configs while waiting for the client handshake, hands
//! the container everything it needs and marks the mandelbox `RUNNING`.
//!
//! Any failure closes the mandelbox, which releases everything it holds.

use crate::config::ServiceConfig;
use crate::context::HostContext;
use crate::configutils::{update_saved_extensions, write_browser_data};
use crate::error::{CoreError, Result};
use crate::handshake::{HandshakeRequest, JsonTransportResult};
use crate::mandelbox::Mandelbox;
use crate::resources::{send_device_fds, PortBinding};
use crate::store::{MandelboxAssignment, MandelboxRecord};
use crate::types::{AppName, MandelboxId, MandelboxStatus, SessionId, SessionKey};
use crate::user_configs::{ConfigEncryptionInfo, UserConfigs};
use mandel_runtime::{ContainerSpec, Protocol};
use rand::RngCore;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tokio::sync::oneshot;

/// Container ports every mandelbox exposes.
pub const EXPOSED_PORTS: [(u16, Protocol); 4] = [
    (32261, Protocol::Tcp),
    (32262, Protocol::Tcp),
    (32263, Protocol::Udp),
    (32273, Protocol::Tcp),
];

const CAP_ADD: [&str; 16] = [
    "SETPCAP",
    "MKNOD",
    "AUDIT_WRITE",
    "CHOWN",
    "NET_RAW",
    "DAC_OVERRIDE",
    "FOWNER",
    "FSETID",
    "KILL",
    "SETGID",
    "SETUID",
    "NET_BIND_SERVICE",
    "SYS_CHROOT",
    "SETFCAP",
    // not granted by Docker by default
    "SYS_NICE",
    "IPC_LOCK",
];

const SHM_SIZE: i64 = 2_147_483_648;
const MEMORY_LIMIT: i64 = 6_552_550_944;
const CPU_SHARES: i64 = 2;
const RUN_TMPFS: &str = "size=52428800";
const APPARMOR_PROFILE: &str = "apparmor:mandelbox-apparmor-profile";
const INITIAL_BROWSER_DATA_PATH: &str =
    "/whist/userConfigs/user-initial-browser-data.json";

// ============================================================================
// Phase 1
// ============================================================================

/// Create mandelbox `id` running `app`, up to the point where it waits for
/// a user.
///
/// # Errors
/// Any allocation, runtime or file error. The mandelbox is fully torn down
/// before this returns.
pub async fn start_spin_up(
    ctx: &Arc<HostContext>,
    id: MandelboxId,
    app: AppName,
) -> Result<Arc<Mandelbox>> {
    let started = Instant::now();
    let mandelbox = Mandelbox::new(ctx, id, app)?;

    match prepare(ctx, &mandelbox).await {
        Ok(()) => {
            tracing::info!(
                mandelbox_id = %id,
                app = %mandelbox.app_name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Mandelbox waiting for assignment"
            );
            Ok(mandelbox)
        }
        Err(e) => {
            tracing::error!(mandelbox_id = %id, error = %e, "Mandelbox spin-up failed");
            mandelbox.close();
            mandelbox.closed().await;
            Err(e)
        }
    }
}

async fn prepare(ctx: &Arc<HostContext>, mandelbox: &Arc<Mandelbox>) -> Result<()> {
    let id = mandelbox.id();
    let lifetime = mandelbox.lifetime().clone();
    let _phase_one = mandelbox.phase_one_guard().await;
    ensure_open(mandelbox, "allocation")?;
    mandelbox.set_session_key(SessionKey::generate());
    mandelbox.set_session_id(server_session_id());

    tokio::select! {
        _ = lifetime.cancelled() => {
            return Err(CoreError::Cancelled(format!("mandelbox {id} closed during allocation")));
        }
        res = allocate_resources(ctx, mandelbox) => res?,
    }

    let app = mandelbox.app_name();
    let image = resolve_image(ctx, &app).await?;
    prepare_directories(ctx, mandelbox).await?;
    ensure_open(mandelbox, "container creation")?;

    let spec = container_spec(ctx.config(), mandelbox, &image);
    let container = ctx.runtime().create(&spec).await?;
    tracing::debug!(mandelbox_id = %id, container_id = %container, image = %image, "Created container");

    if let Err(e) = mandelbox.register_creation(container.clone()) {
        // Teardown never saw this container.
        if let Err(remove) = ctx.runtime().remove(&container).await {
            tracing::warn!(
                mandelbox_id = %id,
                container_id = %container,
                error = %remove,
                "Failed to remove unregistered container"
            );
        }
        return Err(e);
    }
    ensure_open(mandelbox, "container start")?;

    let params = async {
        let mappings = mandelbox.mappings();
        let tty = mandelbox
            .tty()
            .ok_or_else(|| CoreError::Fatal(format!("mandelbox {id} has no TTY")))?;
        mappings
            .write_params(&mandelbox.port_bindings(), tty, mandelbox.gpu())
            .await?;
        mappings
            .write_protocol_timeout(ctx.config().protocol_timeout())
            .await?;
        mappings.write_session_id(&mandelbox.session_id()).await
    };
    let start = async {
        ctx.runtime().start(&container).await?;
        Ok::<_, CoreError>(())
    };
    tokio::try_join!(params, start)?;

    if let Some(devices) = mandelbox.uinput_devices() {
        let socket = mandelbox.uinput_socket();
        ctx.tracker().spawn(async move {
            if let Err(e) = send_device_fds(devices, &socket, lifetime).await {
                tracing::warn!(mandelbox_id = %id, error = %e, "Failed to send input devices");
            }
        });
    }

    ensure_open(mandelbox, "store registration")?;
    if !id.is_placeholder() {
        ctx.store()
            .create_mandelbox(&MandelboxRecord::waiting(
                id,
                app,
                ctx.config().instance_name.clone(),
            ))
            .await?;
    }

    mandelbox.set_status(MandelboxStatus::Waiting);
    ctx.notify_capacity_changed();
    Ok(())
}

fn ensure_open(mandelbox: &Mandelbox, stage: &str) -> Result<()> {
    if mandelbox.is_closing() {
        return Err(CoreError::Cancelled(format!(
            "mandelbox {} closed before {stage}",
            mandelbox.id()
        )));
    }
    Ok(())
}

/// Ports, input devices, TTY and GPU, acquired concurrently. The first
/// failure abandons the rest; whatever was recorded on the mandelbox is
/// released by its teardown.
async fn allocate_resources(ctx: &Arc<HostContext>, mandelbox: &Arc<Mandelbox>) -> Result<()> {
    let pools = ctx.pools();
    let id = mandelbox.id();

    let ports = async {
        let request: Vec<_> = EXPOSED_PORTS
            .iter()
            .map(|(port, protocol)| PortBinding::any(*port, *protocol))
            .collect();
        let bound = pools.ports.allocate(&request)?;
        if let Err(e) = mandelbox.set_port_bindings(bound.clone()) {
            pools.ports.free(&bound);
            return Err(e);
        }
        Ok(())
    };

    let uinput = async {
        let (devices, mappings) = pools.uinput.allocate().await?;
        mandelbox.set_uinput_devices(devices, mappings)
    };

    let tty_and_gpu = async {
        let tty = pools.tty.allocate()?;
        if let Err(e) = mandelbox.set_tty(tty) {
            pools.tty.free(tty);
            return Err(e);
        }
        if let Some(index) = pools.gpu.allocate(id)? {
            if let Err(e) = mandelbox.set_gpu(index) {
                pools.gpu.free(id);
                return Err(e);
            }
        }
        Ok(())
    };

    tokio::try_join!(ports, uinput, tty_and_gpu)?;
    tracing::debug!(
        mandelbox_id = %id,
        tty = ?mandelbox.tty(),
        gpu = ?mandelbox.gpu(),
        "Allocated mandelbox resources"
    );
    Ok(())
}

/// 20 random bytes, hex encoded. Names the log directory until a client
/// session replaces it.
fn server_session_id() -> SessionId {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    SessionId::new(hex::encode(bytes))
}

/// Image for `app`. Deployed environments use the registry naming scheme;
/// local ones take any local tag matching the app.
async fn resolve_image(ctx: &HostContext, app: &AppName) -> Result<String> {
    let config = ctx.config();
    if !config.environment.is_local() {
        return Ok(format!(
            "{}/{}/{}:current-build",
            config.image_registry,
            config.environment.lowercase(),
            app
        ));
    }

    let escaped = regex::escape(app.as_str());
    let patterns = [format!("{escaped}:current-build"), escaped];
    ctx.runtime()
        .find_image(&patterns)
        .await?
        .ok_or_else(|| {
            CoreError::Runtime(mandel_runtime::RuntimeError::Image(format!(
                "no local image for {app}"
            )))
        })
}

/// `{app}-{id}` with everything Docker rejects replaced by `-`.
pub fn container_name(app: &AppName, id: MandelboxId) -> String {
    static INVALID: OnceLock<Option<Regex>> = OnceLock::new();
    let raw = format!("{app}-{id}");
    match INVALID.get_or_init(|| Regex::new(r"[^a-zA-Z0-9_.-]").ok()) {
        Some(re) => re.replace_all(&raw, "-").into_owned(),
        None => raw,
    }
}

async fn prepare_directories(ctx: &HostContext, mandelbox: &Mandelbox) -> Result<()> {
    let config = ctx.config();
    let id = mandelbox.id();
    UserConfigs::for_mandelbox(mandelbox).ensure_dir().await?;
    tokio::fs::create_dir_all(mandelbox.mappings().dir()).await?;
    tokio::fs::create_dir_all(config.sockets_dir(id)).await?;
    tokio::fs::create_dir_all(config.log_dir(id, mandelbox.session_id().as_str())).await?;
    Ok(())
}

/// Container configuration for `mandelbox`.
pub fn container_spec(config: &ServiceConfig, mandelbox: &Mandelbox, image: &str) -> ContainerSpec {
    let id = mandelbox.id();
    let mut builder = ContainerSpec::builder(container_name(&mandelbox.app_name(), id), image)
        .env("WHIST_AES_KEY", mandelbox.session_key().as_str())
        .env("SENTRY_ENV", config.environment.to_string())
        .env("KIOSK_MODE", config.kiosk_mode.to_string())
        .env("LOAD_EXTENSION", config.load_extension.to_string())
        .env("LOCAL_CLIENT", config.local_client.to_string())
        .env("WHIST_INITIAL_USER_DATA_FILE", INITIAL_BROWSER_DATA_PATH)
        .bind("/sys/fs/cgroup:/sys/fs/cgroup:ro")
        .bind(format!(
            "{}:/whist/resourceMappings",
            mandelbox.mappings().dir().display()
        ))
        .bind(format!(
            "{}:/whist/userConfigs:rshared",
            mandelbox.unpacked_config_dir().display()
        ))
        .bind(format!("{}:/tmp/sockets", config.sockets_dir(id).display()))
        .bind(format!(
            "{}:/var/log/whist",
            config
                .log_dir(id, mandelbox.session_id().as_str())
                .display()
        ))
        .bind("/run/udev/data:/run/udev/data:ro")
        .tmpfs("/run", RUN_TMPFS)
        .tmpfs("/run/lock", RUN_TMPFS)
        .cap_drop("ALL")
        .security_opt(APPARMOR_PROFILE)
        .shm_size(SHM_SIZE)
        .cpu_shares(CPU_SHARES)
        .memory(MEMORY_LIMIT)
        .tty(true);

    if config.gpu_enabled() {
        builder = builder
            .env("NVIDIA_VISIBLE_DEVICES", "all")
            .env("NVIDIA_DRIVER_CAPABILITIES", "all");
    }
    for cap in CAP_ADD {
        builder = builder.cap_add(cap);
    }
    for binding in mandelbox.port_bindings() {
        builder = builder.port(binding.into());
    }
    for device in mandelbox.devices() {
        builder = builder.device(device);
    }
    builder.build()
}

// ============================================================================
// Phase 2
// ============================================================================

/// Finish spinning up the mandelbox the scheduler assigned, and answer the
/// client handshake with the connection material.
///
/// # Errors
/// Fails without touching the mandelbox if the state store does not confirm
/// the assignment. Any later failure closes the mandelbox; its config is
/// backed up only if the client had connected.
pub async fn finish_spin_up(
    ctx: &Arc<HostContext>,
    mut assignment: MandelboxAssignment,
) -> Result<JsonTransportResult> {
    let id = assignment.mandelbox_id;
    let started = Instant::now();
    tracing::info!(
        mandelbox_id = %id,
        user_id = %assignment.user_id,
        session_id = %assignment.session_id,
        app = %assignment.app_name,
        "Finishing mandelbox spin-up"
    );

    if !id.is_placeholder() {
        ctx.store()
            .verify_allocated_mandelbox(&ctx.config().instance_name, id, &assignment.user_id)
            .await?;
    }

    let mandelbox = ctx.registry().lookup(id)?;
    let status = mandelbox.status();
    if status != MandelboxStatus::Waiting {
        return Err(CoreError::InvalidState {
            expected: MandelboxStatus::Waiting.to_string(),
            actual: status.to_string(),
        });
    }

    if ctx.config().environment.is_local() && assignment.session_id.as_str().parse::<i64>().is_err()
    {
        let replacement = SessionId::new(chrono::Utc::now().timestamp_millis().to_string());
        tracing::warn!(
            mandelbox_id = %id,
            session_id = %assignment.session_id,
            replacement = %replacement,
            "Malformed session id, using current time"
        );
        assignment.session_id = replacement;
    }

    let mut pending = None;
    let result = assign(ctx, &mandelbox, &assignment, &mut pending).await;
    ctx.handshakes().clear(id);

    match result {
        Ok(reply) => {
            if let Some(request) = pending {
                request.respond(Ok(reply.clone()));
            }
            tracing::info!(
                mandelbox_id = %id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Mandelbox running"
            );
            Ok(reply)
        }
        Err(e) => {
            tracing::error!(
                mandelbox_id = %id,
                connected = mandelbox.is_connected(),
                error = %e,
                "Mandelbox assignment failed"
            );
            if let Some(request) = pending {
                request.fail(&e);
            }
            mandelbox.close();
            Err(e)
        }
    }
}

async fn assign(
    ctx: &Arc<HostContext>,
    mandelbox: &Arc<Mandelbox>,
    assignment: &MandelboxAssignment,
    pending: &mut Option<HandshakeRequest>,
) -> Result<JsonTransportResult> {
    let id = mandelbox.id();
    let config = ctx.config();
    let lifetime = mandelbox.lifetime().clone();

    mandelbox.set_status(MandelboxStatus::Allocated);
    mandelbox.set_user_id(assignment.user_id.clone());
    mandelbox.set_session_id(assignment.session_id.clone());
    if let Err(e) = mandelbox.mappings().write_session_id(&assignment.session_id).await {
        tracing::error!(mandelbox_id = %id, error = %e, "Failed to write session id");
    }

    let bindings = mandelbox.port_bindings();
    let port = |container_port: u16, protocol: Protocol| {
        bindings
            .iter()
            .find(|b| b.container_port == container_port && b.protocol == protocol)
            .map(|b| b.host_port)
            .ok_or_else(|| CoreError::InvalidState {
                expected: format!("host port for {container_port}/{protocol}"),
                actual: "no binding".into(),
            })
    };
    let reply = JsonTransportResult {
        port_32261: port(32261, Protocol::Tcp)?,
        port_32262: port(32262, Protocol::Tcp)?,
        port_32263: port(32263, Protocol::Udp)?,
        port_32273: port(32273, Protocol::Tcp)?,
        aes_key: mandelbox.session_key().as_str().to_string(),
    };

    let (token_tx, token_rx) = oneshot::channel();
    let mut config_errors = UserConfigs::for_mandelbox(mandelbox).start_restore(
        token_rx,
        lifetime.clone(),
        ctx.tracker(),
    );

    mandelbox.mappings().mark_params_ready().await?;

    let receiver = ctx
        .handshakes()
        .take_receiver(id)
        .ok_or_else(|| CoreError::InvalidState {
            expected: "no handshake waiter".into(),
            actual: "already waiting".into(),
        })?;

    let timeout = config.handshake_timeout;
    let request = tokio::select! {
        _ = lifetime.cancelled() => {
            return Err(CoreError::Cancelled(format!("mandelbox {id} closed before handshake")));
        }
        received = tokio::time::timeout(timeout, receiver) => match received {
            Ok(Ok(request)) => request,
            Ok(Err(_)) => return Err(CoreError::Cancelled("handshake slot dropped".into())),
            Err(_) => {
                mandelbox.set_connected(false);
                return Err(CoreError::HandshakeTimeout(timeout));
            }
        },
    };

    let body = pending.insert(request).body.clone();
    mandelbox.set_connected(true);
    mandelbox.set_status(MandelboxStatus::Connecting);
    tracing::info!(mandelbox_id = %id, "Received client handshake");

    let info = ConfigEncryptionInfo {
        token: body.config_encryption_token.clone(),
        is_new_token: body.is_new_config_encryption_token,
    };
    if info.is_acceptable() {
        mandelbox.set_config_token(info.token.clone());
    } else {
        tracing::warn!(
            mandelbox_id = %id,
            "Rejected config encryption token, configs will not be backed up"
        );
    }
    if token_tx.send(info).is_err() {
        tracing::warn!(mandelbox_id = %id, "Config restore stopped before the token arrived");
    }

    mandelbox.mappings().write_json_data(&body.json_data).await?;

    while let Some(e) = config_errors.recv().await {
        tracing::error!(mandelbox_id = %id, error = %e, "User config restore error");
    }

    let config_dir = mandelbox.unpacked_config_dir();
    let extensions = match update_saved_extensions(&config_dir, &body.extensions) {
        Ok(merged) => merged,
        Err(e) => {
            tracing::error!(mandelbox_id = %id, error = %e, "Failed to merge saved extensions");
            body.extensions.clone()
        }
    };
    if let Err(e) = write_browser_data(&config_dir, &body.browser_data(extensions)) {
        tracing::error!(mandelbox_id = %id, error = %e, "Failed to write initial browser data");
    }

    mandelbox.mappings().mark_config_ready().await?;

    if !config.environment.is_local() {
        mandelbox
            .mappings()
            .wait_for_app_ready(config.app_ready_timeout, &lifetime)
            .await?;
    }

    mandelbox.write_status(MandelboxStatus::Running).await?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_name() {
        let id: MandelboxId = "6f2a4c1e-0f59-4b7f-9a0e-3d5b6c7d8e9f".parse().unwrap();
        assert_eq!(
            container_name(&AppName::new("browsers/chrome"), id),
            "browsers-chrome-6f2a4c1e-0f59-4b7f-9a0e-3d5b6c7d8e9f"
        );
        assert_eq!(
            container_name(&AppName::new("my app:v1"), id),
            "my-app-v1-6f2a4c1e-0f59-4b7f-9a0e-3d5b6c7d8e9f"
        );
    }

    #[test]
    fn test_server_session_id_shape() {
        let session = server_session_id();
        assert_eq!(session.as_str().len(), 40);
        assert!(session.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
