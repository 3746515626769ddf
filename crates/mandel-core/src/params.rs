//! Resource-identification files shared with the container.
//!
//! The directory is bind mounted at `/whist/resourceMappings`. Processes
//! inside the container block on the marker files before starting.

use crate::configutils::gzip_inflate_string;
use crate::error::{CoreError, Result};
use crate::resources::{PortBinding, Tty};
use crate::types::SessionId;
use mandel_runtime::Protocol;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Container port whose host mapping identifies the mandelbox.
pub const IDENTIFYING_PORT: u16 = 32262;

/// Created by the in-container app once it is ready for clients.
pub const APP_READY_FILENAME: &str = "done_sleeping_until_X_clients";

const PARAMS_READY: &str = ".paramsReady";
const CONFIG_READY: &str = ".configReady";
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The `mandelboxResourceMappings` directory of one mandelbox.
#[derive(Debug, Clone)]
pub struct ResourceMappings {
    dir: PathBuf,
}

impl ResourceMappings {
    /// Wrap the directory at `dir`. Nothing is created yet.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory path.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o777)).await?;

        let path = self.dir.join(name);
        tokio::fs::write(&path, contents).await?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777)).await?;
        Ok(())
    }

    /// Write host port, TTY and GPU index.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] if no host port is bound for 32262/tcp.
    pub async fn write_params(
        &self,
        bindings: &[PortBinding],
        tty: Tty,
        gpu_index: Option<u32>,
    ) -> Result<()> {
        let host_port = bindings
            .iter()
            .find(|b| b.container_port == IDENTIFYING_PORT && b.protocol == Protocol::Tcp)
            .map(|b| b.host_port)
            .ok_or_else(|| CoreError::InvalidState {
                expected: format!("host port bound for {IDENTIFYING_PORT}/tcp"),
                actual: "no binding".into(),
            })?;

        self.write(
            &format!("hostPort_for_my_{IDENTIFYING_PORT}_tcp"),
            host_port.to_string(),
        )
        .await?;
        self.write("tty", tty.to_string()).await?;
        self.write("gpu_index", gpu_index.unwrap_or(0).to_string())
            .await?;
        Ok(())
    }

    /// Seconds the protocol waits for a client; `-1` waits forever.
    pub async fn write_protocol_timeout(&self, seconds: i64) -> Result<()> {
        self.write("timeout", seconds.to_string()).await
    }

    /// Session id used for log paths inside the container.
    pub async fn write_session_id(&self, session: &SessionId) -> Result<()> {
        self.write("session_id", session.as_str()).await
    }

    /// Inflate the handshake JSON payload into `config.json`.
    ///
    /// # Errors
    /// [`CoreError::InvalidArgument`] if the payload is not gzip + base64.
    pub async fn write_json_data(&self, compressed: &str) -> Result<()> {
        let json = gzip_inflate_string(compressed)?;
        self.write("config.json", json).await
    }

    /// Unblock container services that do not need user configs.
    pub async fn mark_params_ready(&self) -> Result<()> {
        self.write(PARAMS_READY, PARAMS_READY).await
    }

    /// Unblock container services that need user configs.
    pub async fn mark_config_ready(&self) -> Result<()> {
        self.write(CONFIG_READY, CONFIG_READY).await
    }

    /// Wait for the in-container app to report it is up.
    pub async fn wait_for_app_ready(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        wait_for_file_creation(&self.dir, APP_READY_FILENAME, timeout, cancel).await
    }

    /// Delete the directory and everything in it. A missing directory is fine.
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Poll until `dir/name` exists.
///
/// # Errors
/// [`CoreError::Timeout`] after `timeout`, [`CoreError::Cancelled`] if
/// `cancel` fires first.
pub async fn wait_for_file_creation(
    dir: &Path,
    name: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let path = dir.join(name);
    let poll = async {
        loop {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(CoreError::Cancelled(format!("waiting for {}", path.display()))),
        res = tokio::time::timeout(timeout, poll) => res.map_err(|_| {
            CoreError::Timeout(timeout, format!("waiting for {}", path.display()))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configutils::gzip_deflate_string;

    fn bindings() -> Vec<PortBinding> {
        vec![
            PortBinding {
                container_port: 32262,
                host_port: 40001,
                protocol: Protocol::Tcp,
            },
            PortBinding {
                container_port: 32263,
                host_port: 40002,
                protocol: Protocol::Udp,
            },
        ]
    }

    async fn read(dir: &Path, name: &str) -> String {
        tokio::fs::read_to_string(dir.join(name)).await.unwrap()
    }

    #[tokio::test]
    async fn test_write_params() {
        let root = tempfile::tempdir().unwrap();
        let mappings = ResourceMappings::new(root.path().join("mandelboxResourceMappings"));

        mappings.write_params(&bindings(), Tty::new(17), Some(2)).await.unwrap();
        mappings.write_protocol_timeout(-1).await.unwrap();

        let dir = mappings.dir();
        assert_eq!(read(dir, "hostPort_for_my_32262_tcp").await, "40001");
        assert_eq!(read(dir, "tty").await, "17");
        assert_eq!(read(dir, "gpu_index").await, "2");
        assert_eq!(read(dir, "timeout").await, "-1");

        let mode = std::fs::metadata(dir.join("tty")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);
    }

    #[tokio::test]
    async fn test_write_params_needs_identifying_port() {
        let root = tempfile::tempdir().unwrap();
        let mappings = ResourceMappings::new(root.path());
        let err = mappings
            .write_params(&bindings()[1..], Tty::new(10), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_markers_and_json() {
        let root = tempfile::tempdir().unwrap();
        let mappings = ResourceMappings::new(root.path());

        mappings.mark_params_ready().await.unwrap();
        mappings.mark_config_ready().await.unwrap();
        assert_eq!(read(root.path(), ".paramsReady").await, ".paramsReady");
        assert_eq!(read(root.path(), ".configReady").await, ".configReady");

        let json = r#"{"desired_timezone":"UTC"}"#;
        mappings
            .write_json_data(&gzip_deflate_string(json).unwrap())
            .await
            .unwrap();
        assert_eq!(read(root.path(), "config.json").await, json);

        assert!(mappings.write_json_data(json).await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_file_creation() {
        let root = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();

        let err = wait_for_file_creation(root.path(), "never", Duration::from_millis(150), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Timeout(..)));

        let dir = root.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::fs::write(dir.join(APP_READY_FILENAME), b"").await.unwrap();
        });
        let mappings = ResourceMappings::new(root.path());
        mappings
            .wait_for_app_ready(Duration::from_secs(5), &cancel)
            .await
            .unwrap();

        cancel.cancel();
        let err = wait_for_file_creation(root.path(), "never", Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_remove_missing_dir() {
        let root = tempfile::tempdir().unwrap();
        ResourceMappings::new(root.path().join("gone")).remove().await.unwrap();
    }
}
