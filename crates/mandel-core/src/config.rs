//! Orchestrator configuration types.

use crate::error::CoreError;
use crate::types::{AppName, UserId};
use mandel_runtime::Protocol;
use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Deployment environment of this host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppEnvironment {
    /// Developer machine with no state store.
    #[default]
    LocalDev,
    /// Developer machine talking to a real state store.
    LocalDevWithDb,
    /// Shared development deployment.
    Dev,
    /// Staging deployment.
    Staging,
    /// Production deployment.
    Prod,
}

impl AppEnvironment {
    /// Whether this is a developer machine.
    pub fn is_local(&self) -> bool {
        matches!(self, Self::LocalDev | Self::LocalDevWithDb)
    }

    /// Whether this is a developer machine without a state store.
    pub fn is_local_without_db(&self) -> bool {
        matches!(self, Self::LocalDev)
    }

    /// Lowercase name used in storage keys and image references.
    pub fn lowercase(&self) -> &'static str {
        match self {
            Self::LocalDev => "localdev",
            Self::LocalDevWithDb => "localdevwithdb",
            Self::Dev => "dev",
            Self::Staging => "staging",
            Self::Prod => "prod",
        }
    }
}

impl fmt::Display for AppEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalDev => write!(f, "LOCALDEV"),
            Self::LocalDevWithDb => write!(f, "LOCALDEVWITHDB"),
            Self::Dev => write!(f, "DEV"),
            Self::Staging => write!(f, "STAGING"),
            Self::Prod => write!(f, "PROD"),
        }
    }
}

impl FromStr for AppEnvironment {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "localdev" | "local" | "" => Ok(Self::LocalDev),
            "localdevwithdb" | "localdev_with_db" | "localdev_with_database" => {
                Ok(Self::LocalDevWithDb)
            }
            "dev" | "development" => Ok(Self::Dev),
            "staging" => Ok(Self::Staging),
            "prod" | "production" => Ok(Self::Prod),
            other => Err(CoreError::Config(format!("unknown app environment: {other}"))),
        }
    }
}

/// Configuration for the orchestrator.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Root of per-mandelbox resource and config directories.
    pub whist_dir: PathBuf,
    /// Root of per-mandelbox sockets and logs.
    pub temp_dir: PathBuf,
    /// Deployment environment.
    pub environment: AppEnvironment,
    /// Name of this instance in the state store.
    pub instance_name: String,
    /// Number of GPUs on the host; `0` disables GPU allocation.
    pub gpu_count: u32,
    /// How many mandelboxes may share one GPU.
    pub max_per_gpu: u32,
    /// Running in CI, where GPUs are never touched.
    pub running_in_ci: bool,
    /// Bucket holding encrypted user configs.
    pub config_bucket: String,
    /// Registry prefix of deployed images.
    pub image_registry: String,
    /// App launched when a request names none.
    pub default_app: AppName,
    /// User synthesized for local handshakes without a state store.
    pub local_user_id: UserId,
    /// Maximum simultaneous mandelboxes on this host.
    pub mandelbox_capacity: usize,
    /// Warm mandelboxes kept ready for assignment.
    pub warm_pool_size: usize,
    /// Maximum warm mandelboxes booting at once.
    pub max_concurrent_boots: usize,
    /// Interval between warm pool fill attempts.
    pub warm_fill_interval: Duration,
    /// TTY numbers handed to containers. Lower numbers stay with the host.
    pub tty_range: Range<u32>,
    /// Host ports available for bindings.
    pub port_range: Range<u16>,
    /// Host ports never handed out.
    pub reserved_ports: Vec<(Protocol, u16)>,
    /// How long Phase 2 waits for the client handshake.
    pub handshake_timeout: Duration,
    /// How long Phase 2 waits for the in-container app to come up.
    pub app_ready_timeout: Duration,
    /// Grace period before a dying container is killed.
    pub stop_timeout: Duration,
    /// Protocol timeout override for local environments.
    pub localdev_protocol_timeout: Option<i64>,
    /// Download attempts on checksum mismatch.
    pub config_download_attempts: u32,
    /// Browser runs without tabs or an address bar.
    pub kiosk_mode: bool,
    /// Browser loads the client extension.
    pub load_extension: bool,
    /// Clients connect from the host's own machine.
    pub local_client: bool,
}

/// Port the handshake server listens on, reserved from the binding pool.
pub const HANDSHAKE_PORT: u16 = 4678;

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            whist_dir: PathBuf::from("/whist"),
            temp_dir: PathBuf::from("/whist/temp"),
            environment: AppEnvironment::LocalDev,
            instance_name: "local-instance".to_string(),
            gpu_count: 0,
            max_per_gpu: 3,
            running_in_ci: false,
            config_bucket: "whist-user-app-configs".to_string(),
            image_registry: "ghcr.io/whisthq".to_string(),
            default_app: AppName::new("browsers/chrome"),
            local_user_id: UserId::new("localdev_host_service_user"),
            mandelbox_capacity: 8,
            warm_pool_size: 0,
            max_concurrent_boots: 2,
            warm_fill_interval: Duration::from_secs(1),
            tty_range: 10..64,
            port_range: 1025..49150,
            reserved_ports: vec![(Protocol::Tcp, HANDSHAKE_PORT)],
            handshake_timeout: Duration::from_secs(60),
            app_ready_timeout: Duration::from_secs(20),
            stop_timeout: Duration::from_secs(30),
            localdev_protocol_timeout: None,
            config_download_attempts: 3,
            kiosk_mode: false,
            load_extension: true,
            local_client: false,
        }
    }
}

impl ServiceConfig {
    /// Create a new config builder.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.whist_dir.as_os_str().is_empty() {
            return Err(CoreError::Config("whist_dir is required".into()));
        }
        if self.temp_dir.as_os_str().is_empty() {
            return Err(CoreError::Config("temp_dir is required".into()));
        }
        if self.instance_name.is_empty() {
            return Err(CoreError::Config("instance_name is required".into()));
        }
        if self.tty_range.is_empty() {
            return Err(CoreError::Config("tty_range must not be empty".into()));
        }
        if self.port_range.is_empty() {
            return Err(CoreError::Config("port_range must not be empty".into()));
        }
        if self.gpu_count > 0 && self.max_per_gpu == 0 {
            return Err(CoreError::Config("max_per_gpu must be > 0".into()));
        }
        if self.mandelbox_capacity == 0 {
            return Err(CoreError::Config("mandelbox_capacity must be > 0".into()));
        }
        if self.warm_pool_size > self.mandelbox_capacity {
            return Err(CoreError::Config(
                "warm_pool_size must not exceed mandelbox_capacity".into(),
            ));
        }
        if self.max_concurrent_boots == 0 {
            return Err(CoreError::Config("max_concurrent_boots must be > 0".into()));
        }
        if self.config_download_attempts == 0 {
            return Err(CoreError::Config(
                "config_download_attempts must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Whether GPUs are allocated at all.
    pub fn gpu_enabled(&self) -> bool {
        self.gpu_count > 0 && !self.running_in_ci
    }

    /// Protocol timeout written for every mandelbox, in seconds.
    ///
    /// Local environments wait forever (`-1`) unless overridden.
    pub fn protocol_timeout(&self) -> i64 {
        if self.environment.is_local() {
            self.localdev_protocol_timeout.unwrap_or(-1)
        } else {
            30
        }
    }

    /// `{whist_dir}/{id}`
    pub fn mandelbox_dir(&self, id: impl fmt::Display) -> PathBuf {
        self.whist_dir.join(id.to_string())
    }

    /// `{temp_dir}/{id}/sockets`
    pub fn sockets_dir(&self, id: impl fmt::Display) -> PathBuf {
        self.temp_dir.join(id.to_string()).join("sockets")
    }

    /// `{temp_dir}/logs/{id}/{session}`
    pub fn log_dir(&self, id: impl fmt::Display, session: &str) -> PathBuf {
        self.temp_dir.join("logs").join(id.to_string()).join(session)
    }

    /// Root directories this process owns.
    pub fn owned_dirs(&self) -> [&Path; 2] {
        [&self.whist_dir, &self.temp_dir]
    }
}

/// Builder for ServiceConfig.
#[derive(Debug, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Set the resource root directory.
    pub fn whist_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.whist_dir = path.into();
        self
    }

    /// Set the sockets and logs root directory.
    pub fn temp_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.temp_dir = path.into();
        self
    }

    /// Set the deployment environment.
    pub fn environment(mut self, environment: AppEnvironment) -> Self {
        self.config.environment = environment;
        self
    }

    /// Set the instance name.
    pub fn instance_name(mut self, name: impl Into<String>) -> Self {
        self.config.instance_name = name.into();
        self
    }

    /// Set the GPU count and sharing factor.
    pub fn gpus(mut self, count: u32, max_per_gpu: u32) -> Self {
        self.config.gpu_count = count;
        self.config.max_per_gpu = max_per_gpu;
        self
    }

    /// Mark the host as a CI runner.
    pub fn running_in_ci(mut self, ci: bool) -> Self {
        self.config.running_in_ci = ci;
        self
    }

    /// Set the config bucket.
    pub fn config_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.config.config_bucket = bucket.into();
        self
    }

    /// Set the image registry prefix.
    pub fn image_registry(mut self, registry: impl Into<String>) -> Self {
        self.config.image_registry = registry.into();
        self
    }

    /// Set the default app.
    pub fn default_app(mut self, app: impl Into<AppName>) -> Self {
        self.config.default_app = app.into();
        self
    }

    /// Set the local user id.
    pub fn local_user_id(mut self, user: impl Into<UserId>) -> Self {
        self.config.local_user_id = user.into();
        self
    }

    /// Set the instance capacity.
    pub fn mandelbox_capacity(mut self, capacity: usize) -> Self {
        self.config.mandelbox_capacity = capacity;
        self
    }

    /// Set the warm pool size.
    pub fn warm_pool_size(mut self, size: usize) -> Self {
        self.config.warm_pool_size = size;
        self
    }

    /// Set the TTY range.
    pub fn tty_range(mut self, range: Range<u32>) -> Self {
        self.config.tty_range = range;
        self
    }

    /// Set the host port range.
    pub fn port_range(mut self, range: Range<u16>) -> Self {
        self.config.port_range = range;
        self
    }

    /// Set the browser flags passed to every container.
    pub fn browser_flags(mut self, kiosk_mode: bool, load_extension: bool, local_client: bool) -> Self {
        self.config.kiosk_mode = kiosk_mode;
        self.config.load_extension = load_extension;
        self.config.local_client = local_client;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.config.handshake_timeout = timeout;
        self
    }

    /// Set the app-ready timeout.
    pub fn app_ready_timeout(mut self, timeout: Duration) -> Self {
        self.config.app_ready_timeout = timeout;
        self
    }

    /// Set the container stop timeout.
    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.stop_timeout = timeout;
        self
    }

    /// Override the protocol timeout in local environments.
    pub fn localdev_protocol_timeout(mut self, timeout: Option<i64>) -> Self {
        self.config.localdev_protocol_timeout = timeout;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ServiceConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ServiceConfig::default();
        assert_eq!(config.whist_dir, PathBuf::from("/whist"));
        assert_eq!(config.tty_range, 10..64);
        assert_eq!(config.handshake_timeout, Duration::from_secs(60));
        assert!(config.reserved_ports.contains(&(Protocol::Tcp, 4678)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_protocol_timeout_by_environment() {
        let mut config = ServiceConfig::default();
        assert_eq!(config.protocol_timeout(), -1);

        config.localdev_protocol_timeout = Some(120);
        assert_eq!(config.protocol_timeout(), 120);

        config.environment = AppEnvironment::Prod;
        assert_eq!(config.protocol_timeout(), 30);
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("dev".parse::<AppEnvironment>().unwrap(), AppEnvironment::Dev);
        assert_eq!(
            "LOCALDEVWITHDB".parse::<AppEnvironment>().unwrap(),
            AppEnvironment::LocalDevWithDb
        );
        assert!("moon".parse::<AppEnvironment>().is_err());
        assert!(AppEnvironment::LocalDevWithDb.is_local());
        assert!(!AppEnvironment::LocalDevWithDb.is_local_without_db());
        assert_eq!(AppEnvironment::Staging.lowercase(), "staging");
    }

    #[test]
    fn test_builder_validation() {
        assert!(ServiceConfig::builder().instance_name("").build().is_err());
        assert!(ServiceConfig::builder()
            .mandelbox_capacity(2)
            .warm_pool_size(3)
            .build()
            .is_err());
        assert!(ServiceConfig::builder().tty_range(10..10).build().is_err());
    }

    #[test]
    fn test_gpu_enabled() {
        let config = ServiceConfig::builder().gpus(2, 3).build().unwrap();
        assert!(config.gpu_enabled());

        let ci = ServiceConfig::builder()
            .gpus(2, 3)
            .running_in_ci(true)
            .build()
            .unwrap();
        assert!(!ci.gpu_enabled());
    }

    #[test]
    fn test_paths() {
        let config = ServiceConfig::builder()
            .whist_dir("/w")
            .temp_dir("/t")
            .build()
            .unwrap();
        assert_eq!(config.mandelbox_dir("abc"), PathBuf::from("/w/abc"));
        assert_eq!(config.sockets_dir("abc"), PathBuf::from("/t/abc/sockets"));
        assert_eq!(config.log_dir("abc", "42"), PathBuf::from("/t/logs/abc/42"));
    }
}
