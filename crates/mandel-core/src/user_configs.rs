//! User config backup and restore.
//!
//! Backup packs the unpacked config directory, encrypts it with the user's
//! config-encryption token and uploads it under a key namespaced by user,
//! environment, app and token hash.
//!
//! Restore starts as soon as the container does, long before the client
//! hands over its token. It predicts the object to fetch (the most recently
//! modified one under the user's prefix) and downloads it while waiting.
//! Once the token arrives the real key is computed; if the prediction was
//! wrong the right object is downloaded instead.
//!
//! Restore never fails the spin-up. Errors go to a channel the caller
//! drains, and every failure path leaves an empty config directory behind
//! so the container always finds one.

use crate::config::AppEnvironment;
use crate::configutils::{compress_dir, decrypt, encrypt, extract_archive};
use crate::error::{CoreError, Result};
use crate::mandelbox::Mandelbox;
use crate::types::{AppName, ConfigEncryptionToken, UserId};
use bytes::Bytes;
use mandel_storage::{sha256_base64, ObjectStore};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// File name of every stored config archive.
pub const ENCRYPTED_ARCHIVE_FILENAME: &str = "whist-app-config.tar.gz.enc";

/// Shortest token accepted from a client.
pub const MIN_TOKEN_LEN: usize = 20;

/// Token handed over by the client handshake.
#[derive(Debug, Clone)]
pub struct ConfigEncryptionInfo {
    pub token: ConfigEncryptionToken,
    /// The client has never saved a config under this token.
    pub is_new_token: bool,
}

impl ConfigEncryptionInfo {
    /// Long enough to encrypt with. Empty tokens never are.
    pub fn is_acceptable(&self) -> bool {
        self.token.as_str().len() >= MIN_TOKEN_LEN
    }
}

/// Where one mandelbox's configs live, locally and in storage.
#[derive(Clone)]
pub struct UserConfigs {
    objects: Arc<dyn ObjectStore>,
    environment: AppEnvironment,
    user: UserId,
    app: AppName,
    dir: PathBuf,
    download_attempts: u32,
}

impl std::fmt::Debug for UserConfigs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UserConfigs")
            .field("user", &self.user)
            .field("app", &self.app)
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl UserConfigs {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        environment: AppEnvironment,
        user: UserId,
        app: AppName,
        dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            objects,
            environment,
            user,
            app,
            dir: dir.into(),
            download_attempts: 3,
        }
    }

    /// Configs of the user currently assigned to `mandelbox`.
    pub fn for_mandelbox(mandelbox: &Mandelbox) -> Self {
        let ctx = mandelbox.context();
        Self {
            download_attempts: ctx.config().config_download_attempts,
            ..Self::new(
                Arc::clone(ctx.objects()),
                ctx.config().environment,
                mandelbox.user_id(),
                mandelbox.app_name(),
                mandelbox.unpacked_config_dir(),
            )
        }
    }

    /// Set how many times a corrupted download is retried.
    pub fn with_download_attempts(mut self, attempts: u32) -> Self {
        self.download_attempts = attempts.max(1);
        self
    }

    /// Unpacked config directory.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    /// `{user}/{env}/{app}`
    pub fn key_prefix(&self) -> String {
        format!(
            "{}/{}/{}",
            self.user,
            self.environment.lowercase(),
            self.app
        )
    }

    /// `{user}/{env}/{app}/{sha256(token)}/whist-app-config.tar.gz.enc`
    pub fn object_key(&self, token: &ConfigEncryptionToken) -> String {
        format!(
            "{}/{}/{ENCRYPTED_ARCHIVE_FILENAME}",
            self.key_prefix(),
            token.hash()
        )
    }

    /// Whether `key` has one of the shapes a config archive is stored under.
    fn is_config_key(&self, key: &str) -> bool {
        let Some(rest) = key.strip_prefix(&self.key_prefix()) else {
            return false;
        };
        let Some(rest) = rest.strip_prefix('/') else {
            return false;
        };
        match rest.split_once('/') {
            None => rest == ENCRYPTED_ARCHIVE_FILENAME,
            Some((hash, file)) => {
                file == ENCRYPTED_ARCHIVE_FILENAME
                    && !hash.is_empty()
                    && hash.chars().all(|c| c.is_ascii_hexdigit())
            }
        }
    }

    /// Create an empty config directory if none exists.
    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o777)).await?;
        Ok(())
    }

    /// Replace whatever is in the config directory with an empty one.
    pub async fn reset_dir(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.ensure_dir().await
    }

    // ------------------------------------------------------------------
    // Backup
    // ------------------------------------------------------------------

    /// Pack, encrypt and upload the config directory. Returns the key written,
    /// or `None` when no user is assigned.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] if a user is assigned but `token` is empty.
    pub async fn backup(&self, token: &ConfigEncryptionToken) -> Result<Option<String>> {
        if self.user.is_empty() {
            tracing::debug!("No user assigned, skipping config backup");
            return Ok(None);
        }
        if token.is_empty() {
            return Err(CoreError::InvalidState {
                expected: "config encryption token".into(),
                actual: format!("no token for user {}", self.user),
            });
        }

        let started = Instant::now();
        let dir = self.dir.clone();
        let password = token.as_str().to_string();
        let sealed = tokio::task::spawn_blocking(move || {
            let archive = compress_dir(&dir)?;
            encrypt(&archive, &password)
        })
        .await
        .map_err(|e| CoreError::Io(std::io::Error::other(e)))??;

        let key = self.object_key(token);
        let size = sealed.len();
        let outcome = self.objects.put(&key, Bytes::from(sealed)).await?;

        tracing::info!(
            user_id = %self.user,
            key = %key,
            size,
            version = outcome.version.as_deref().unwrap_or("-"),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Uploaded user configs"
        );
        Ok(Some(key))
    }

    // ------------------------------------------------------------------
    // Restore
    // ------------------------------------------------------------------

    /// Download `key`, retrying while the bytes do not match the provider
    /// checksum or the provider fails the body read.
    pub async fn download_verified(&self, key: &str) -> Result<Bytes> {
        let mut last_error = None;
        for attempt in 1..=self.download_attempts {
            let object = match self.objects.get(key).await {
                Ok(object) => object,
                Err(e) if e.is_retryable() => {
                    tracing::warn!(key, attempt, error = %e, "Config download failed, retrying");
                    last_error = Some(CoreError::Storage(e));
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            match object.checksum_sha256.as_deref() {
                // composite multipart checksums are not comparable
                Some(expected) if !expected.contains('-') => {
                    let actual = sha256_base64(&object.bytes);
                    if actual == expected {
                        return Ok(object.bytes);
                    }
                    tracing::warn!(key, attempt, "Config download failed checksum verification");
                    last_error = Some(CoreError::ChecksumMismatch {
                        key: key.to_string(),
                        expected: expected.to_string(),
                        actual,
                    });
                }
                _ => return Ok(object.bytes),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            CoreError::InvalidArgument("download attempts must be > 0".into())
        }))
    }

    async fn predict(&self) -> Result<Option<(String, Bytes)>> {
        let prefix = format!("{}/", self.key_prefix());
        let Some(meta) = self
            .objects
            .most_recent_matching(&prefix, ENCRYPTED_ARCHIVE_FILENAME)
            .await?
        else {
            tracing::debug!(prefix = %prefix, "No saved config to predict");
            return Ok(None);
        };
        if !self.is_config_key(&meta.key) {
            tracing::warn!(key = %meta.key, "Ignoring unexpected object under config prefix");
            return Ok(None);
        }

        tracing::debug!(key = %meta.key, size = meta.size, "Downloading predicted config");
        let bytes = self.download_verified(&meta.key).await?;
        Ok(Some((meta.key, bytes)))
    }

    /// Start restoring configs in the background.
    ///
    /// The returned channel yields every error hit along the way and closes
    /// once both the token check and the restore itself are done.
    pub fn start_restore(
        self,
        token: oneshot::Receiver<ConfigEncryptionInfo>,
        cancel: CancellationToken,
        tracker: &TaskTracker,
    ) -> mpsc::UnboundedReceiver<CoreError> {
        let (errors, rx) = mpsc::unbounded_channel();
        let (verified_tx, verified_rx) = oneshot::channel::<Option<ConfigEncryptionInfo>>();

        let verify_errors = errors.clone();
        let verify_cancel = cancel.clone();
        tracker.spawn(async move {
            let received = tokio::select! {
                _ = verify_cancel.cancelled() => None,
                info = token => info.ok(),
            };
            let verified = match received {
                Some(info) if info.is_acceptable() => Some(info),
                Some(_) => {
                    let _ = verify_errors.send(CoreError::InvalidArgument(format!(
                        "config encryption token shorter than {MIN_TOKEN_LEN} characters"
                    )));
                    None
                }
                None => {
                    let _ = verify_errors.send(CoreError::Cancelled(
                        "no config encryption token received".into(),
                    ));
                    None
                }
            };
            let _ = verified_tx.send(verified);
        });

        let tracker_inner = tracker.clone();
        tracker.spawn(async move {
            let started = Instant::now();
            if let Err(e) = self.restore(verified_rx, &errors, &tracker_inner).await {
                let _ = errors.send(e);
                if let Err(e) = self.reset_dir().await {
                    let _ = errors.send(e);
                }
            }
            tracing::debug!(
                user_id = %self.user,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Config restore finished"
            );
        });

        rx
    }

    async fn restore(
        &self,
        verified: oneshot::Receiver<Option<ConfigEncryptionInfo>>,
        errors: &mpsc::UnboundedSender<CoreError>,
        tracker: &TaskTracker,
    ) -> Result<()> {
        self.ensure_dir().await?;

        let predictor = self.clone();
        let prediction = tracker.spawn(async move { predictor.predict().await });

        let Some(info) = verified.await.ok().flatten() else {
            prediction.abort();
            return self.reset_dir().await;
        };

        if info.is_new_token {
            prediction.abort();
            tracing::info!(user_id = %self.user, "New config token, nothing to restore");
            return self.reset_dir().await;
        }

        let predicted = match prediction.await {
            Ok(Ok(predicted)) => predicted,
            Ok(Err(e)) => {
                let _ = errors.send(e);
                None
            }
            Err(e) => {
                let _ = errors.send(CoreError::Io(std::io::Error::other(e)));
                None
            }
        };

        let correct_key = self.object_key(&info.token);
        let data = match predicted {
            Some((key, bytes)) if key == correct_key => bytes,
            predicted => {
                if self.objects.head(&correct_key).await?.is_some() {
                    if let Some((key, _)) = &predicted {
                        tracing::info!(predicted = %key, actual = %correct_key, "Config prediction missed");
                    }
                    self.download_verified(&correct_key).await?
                } else if let Some((key, bytes)) = predicted {
                    tracing::warn!(
                        predicted = %key,
                        expected = %correct_key,
                        "No config under the token key, using predicted config"
                    );
                    bytes
                } else {
                    tracing::info!(user_id = %self.user, "No saved config");
                    return Ok(());
                }
            }
        };

        let dir = self.dir.clone();
        let password = info.token.as_str().to_string();
        let written = tokio::task::spawn_blocking(move || {
            let archive = decrypt(&data, &password)?;
            extract_archive(&archive, &dir)
        })
        .await
        .map_err(|e| CoreError::Io(std::io::Error::other(e)))??;

        tracing::info!(user_id = %self.user, bytes = written, "Restored user configs");
        Ok(())
    }
}

/// Back up the configs of `mandelbox`'s user with its token. Skipped when
/// the handshake never delivered an acceptable token.
pub async fn backup_user_configs(mandelbox: &Mandelbox) -> Result<Option<String>> {
    let token = mandelbox.config_token();
    if token.is_empty() {
        tracing::debug!(mandelbox_id = %mandelbox.id(), "No config token, skipping config backup");
        return Ok(None);
    }
    UserConfigs::for_mandelbox(mandelbox).backup(&token).await
}
