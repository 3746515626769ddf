//! Configuration for the host service.
//!
//! Configuration is loaded from environment variables with defaults that
//! suit a developer machine.

use mandel_core::{AppEnvironment, AppName, CoreError, ServiceConfig, UserId};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Default handshake server port.
pub const DEFAULT_HTTP_PORT: u16 = mandel_core::HANDSHAKE_PORT;

/// Where user config archives are stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreKind {
    /// Amazon S3.
    S3,
    /// Process memory; configs are lost on exit.
    Memory,
}

impl ObjectStoreKind {
    /// Parse from string (case-insensitive). Anything unknown means S3.
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" | "mem" | "local" => Self::Memory,
            _ => Self::S3,
        }
    }
}

/// Configuration for the host service.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Orchestrator settings handed to `mandel-core`.
    pub service: ServiceConfig,

    /// Handshake server bind address.
    pub http_addr: SocketAddr,

    /// Region of the S3 client.
    pub aws_region: String,

    /// Object store backend.
    pub object_store: ObjectStoreKind,

    /// Throwaway mandelboxes started before accepting work. Local
    /// environments skip the warm-up entirely.
    pub warmup_iterations: usize,
}

/// Configuration validation error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0}")]
    Service(#[from] CoreError),

    #[error("path must be absolute: {0}")]
    RelativePath(PathBuf),

    #[error("http port must not be 0")]
    InvalidPort,

    #[error("S3 object store requires MANDEL_CONFIG_BUCKET")]
    MissingBucket,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            http_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_HTTP_PORT),
            aws_region: "us-east-1".to_string(),
            object_store: ObjectStoreKind::Memory,
            warmup_iterations: 2,
        }
    }
}

impl HostConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `APP_ENV` | `localdev` |
    /// | `MANDEL_WHIST_DIR` | `/whist` |
    /// | `MANDEL_TEMP_DIR` | `/whist/temp` |
    /// | `MANDEL_INSTANCE_NAME` | hostname, else `local-instance` |
    /// | `MANDEL_HTTP_HOST` | `0.0.0.0` |
    /// | `MANDEL_HTTP_PORT` | `4678` |
    /// | `MANDEL_CONFIG_BUCKET` | `whist-user-app-configs` |
    /// | `MANDEL_AWS_REGION` | `us-east-1` |
    /// | `MANDEL_OBJECT_STORE` | `memory` in localdev, else `s3` |
    /// | `MANDEL_GPU_COUNT` | number of `/dev/nvidiaN` devices |
    /// | `MANDEL_MANDELBOXES_PER_GPU` | `3` |
    /// | `MANDEL_CAPACITY` | `8` |
    /// | `MANDEL_WARM_POOL_SIZE` | `0` in localdev, else `2` |
    /// | `MANDEL_WARMUP_ITERATIONS` | `2` |
    /// | `MANDEL_DEFAULT_APP` | `browsers/chrome` |
    /// | `MANDEL_USER_ID` | `localdev_host_service_user` |
    /// | `MANDEL_KIOSK_MODE` | `false` |
    /// | `MANDEL_LOAD_EXTENSION` | `true` |
    /// | `MANDEL_LOCAL_CLIENT` | `false` |
    /// | `CI` | unset |
    /// | `LOCALDEV_PROTOCOL_TIMEOUT` | unset |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process
    /// environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();
        let base = default.service.clone();
        let parse = |key: &str| lookup(key).and_then(|v| v.trim().parse::<usize>().ok());
        let flag = |key: &str| lookup(key).map(|v| v.eq_ignore_ascii_case("true") || v == "1");

        let environment = match lookup("APP_ENV").map(|v| v.parse::<AppEnvironment>()) {
            Some(Ok(env)) => env,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Unknown APP_ENV, using localdev");
                AppEnvironment::LocalDev
            }
            None => AppEnvironment::LocalDev,
        };
        let local = environment.is_local();

        let localdev_protocol_timeout = lookup("LOCALDEV_PROTOCOL_TIMEOUT").and_then(|v| {
            match v.trim().parse::<i64>() {
                Ok(timeout) => Some(timeout),
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "Ignoring unparsable LOCALDEV_PROTOCOL_TIMEOUT");
                    None
                }
            }
        });

        let http_host: IpAddr = lookup("MANDEL_HTTP_HOST")
            .and_then(|v| v.parse().ok())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let http_port: u16 = lookup("MANDEL_HTTP_PORT")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_HTTP_PORT);

        let service = ServiceConfig {
            whist_dir: lookup("MANDEL_WHIST_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.whist_dir.clone()),
            temp_dir: lookup("MANDEL_TEMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(base.temp_dir.clone()),
            environment,
            instance_name: lookup("MANDEL_INSTANCE_NAME")
                .or_else(read_hostname)
                .unwrap_or(base.instance_name.clone()),
            gpu_count: parse("MANDEL_GPU_COUNT")
                .map(|n| n as u32)
                .unwrap_or_else(|| detect_gpus(Path::new("/dev"))),
            max_per_gpu: parse("MANDEL_MANDELBOXES_PER_GPU")
                .map(|n| n as u32)
                .unwrap_or(base.max_per_gpu),
            running_in_ci: flag("CI").unwrap_or(false),
            config_bucket: lookup("MANDEL_CONFIG_BUCKET").unwrap_or(base.config_bucket.clone()),
            default_app: lookup("MANDEL_DEFAULT_APP")
                .map(AppName::new)
                .unwrap_or(base.default_app.clone()),
            local_user_id: lookup("MANDEL_USER_ID")
                .map(UserId::new)
                .unwrap_or(base.local_user_id.clone()),
            mandelbox_capacity: parse("MANDEL_CAPACITY").unwrap_or(base.mandelbox_capacity),
            warm_pool_size: parse("MANDEL_WARM_POOL_SIZE").unwrap_or(if local { 0 } else { 2 }),
            localdev_protocol_timeout,
            kiosk_mode: flag("MANDEL_KIOSK_MODE").unwrap_or(base.kiosk_mode),
            load_extension: flag("MANDEL_LOAD_EXTENSION").unwrap_or(base.load_extension),
            local_client: flag("MANDEL_LOCAL_CLIENT").unwrap_or(base.local_client),
            ..base
        };

        Self {
            service,
            http_addr: SocketAddr::new(http_host, http_port),
            aws_region: lookup("MANDEL_AWS_REGION").unwrap_or(default.aws_region),
            object_store: lookup("MANDEL_OBJECT_STORE")
                .map(|v| ObjectStoreKind::parse(&v))
                .unwrap_or(if local {
                    ObjectStoreKind::Memory
                } else {
                    ObjectStoreKind::S3
                }),
            warmup_iterations: parse("MANDEL_WARMUP_ITERATIONS")
                .unwrap_or(default.warmup_iterations),
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.service.validate()?;

        for dir in self.service.owned_dirs() {
            if !dir.is_absolute() {
                return Err(ConfigError::RelativePath(dir.to_path_buf()));
            }
        }

        if self.http_addr.port() == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.object_store == ObjectStoreKind::S3 && self.service.config_bucket.is_empty() {
            return Err(ConfigError::MissingBucket);
        }

        Ok(())
    }

    /// Whether the host keeps its state in the in-process store, which
    /// never assigns users on its own. Only localdev runs without any.
    pub fn uses_in_process_state_store(&self) -> bool {
        !self.service.environment.is_local_without_db()
    }

    /// Log likely host problems without failing.
    pub fn validate_warn(&self) {
        if !Path::new("/dev/uinput").exists() {
            tracing::warn!("/dev/uinput not found, input devices cannot be created");
        }

        if !Path::new("/var/run/docker.sock").exists() {
            tracing::warn!("Docker socket not found at /var/run/docker.sock");
        }

        if !self.service.environment.is_local() && self.service.gpu_count == 0 {
            tracing::warn!("No GPUs configured on a deployed host");
        }

        if self.object_store == ObjectStoreKind::Memory && !self.service.environment.is_local() {
            tracing::warn!("In-memory object store outside local development, configs will not persist");
        }

        if self.uses_in_process_state_store() && !self.service.environment.is_local() {
            tracing::warn!(
                "In-process state store on a deployed host, no users will be assigned and handshakes will time out"
            );
        }
    }
}

fn read_hostname() -> Option<String> {
    std::fs::read_to_string("/etc/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Count `nvidiaN` device nodes under `dev`.
pub fn detect_gpus(dev: &Path) -> u32 {
    let Ok(entries) = std::fs::read_dir(dev) else {
        return 0;
    };
    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix("nvidia"))
                .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
        })
        .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = HostConfig::default();
        assert_eq!(config.http_addr.port(), 4678);
        assert_eq!(config.aws_region, "us-east-1");
        assert_eq!(config.service.whist_dir, PathBuf::from("/whist"));
    }

    #[test]
    fn test_localdev_defaults() {
        let config = HostConfig::from_lookup(lookup(&[("MANDEL_GPU_COUNT", "0")]));
        assert_eq!(config.service.environment, AppEnvironment::LocalDev);
        assert_eq!(config.service.warm_pool_size, 0);
        assert_eq!(config.object_store, ObjectStoreKind::Memory);
        assert_eq!(config.service.protocol_timeout(), -1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deployed_overrides() {
        let config = HostConfig::from_lookup(lookup(&[
            ("APP_ENV", "staging"),
            ("MANDEL_INSTANCE_NAME", "i-0abc"),
            ("MANDEL_HTTP_PORT", "9000"),
            ("MANDEL_GPU_COUNT", "2"),
            ("MANDEL_CAPACITY", "6"),
            ("MANDEL_DEFAULT_APP", "browsers/brave"),
            ("CI", "true"),
        ]));
        assert_eq!(config.service.environment, AppEnvironment::Staging);
        assert_eq!(config.service.instance_name, "i-0abc");
        assert_eq!(config.http_addr.port(), 9000);
        assert_eq!(config.service.gpu_count, 2);
        assert!(!config.service.gpu_enabled());
        assert_eq!(config.service.mandelbox_capacity, 6);
        assert_eq!(config.service.warm_pool_size, 2);
        assert_eq!(config.service.default_app.as_str(), "browsers/brave");
        assert_eq!(config.object_store, ObjectStoreKind::S3);
        assert_eq!(config.service.protocol_timeout(), 30);
        assert!(config.uses_in_process_state_store());
    }

    #[test]
    fn test_browser_flags() {
        let config = HostConfig::from_lookup(lookup(&[]));
        assert!(!config.service.kiosk_mode);
        assert!(config.service.load_extension);
        assert!(!config.service.local_client);
        assert!(!config.uses_in_process_state_store());

        let config = HostConfig::from_lookup(lookup(&[
            ("MANDEL_KIOSK_MODE", "TRUE"),
            ("MANDEL_LOAD_EXTENSION", "false"),
            ("MANDEL_LOCAL_CLIENT", "1"),
        ]));
        assert!(config.service.kiosk_mode);
        assert!(!config.service.load_extension);
        assert!(config.service.local_client);
    }

    #[test]
    fn test_protocol_timeout_override() {
        let config = HostConfig::from_lookup(lookup(&[("LOCALDEV_PROTOCOL_TIMEOUT", "45")]));
        assert_eq!(config.service.protocol_timeout(), 45);

        let config = HostConfig::from_lookup(lookup(&[("LOCALDEV_PROTOCOL_TIMEOUT", "soon")]));
        assert_eq!(config.service.protocol_timeout(), -1);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = HostConfig::default();
        config.service.whist_dir = PathBuf::from("relative/whist");
        assert!(matches!(config.validate(), Err(ConfigError::RelativePath(_))));

        let mut config = HostConfig::default();
        config.object_store = ObjectStoreKind::S3;
        config.service.config_bucket.clear();
        assert!(matches!(config.validate(), Err(ConfigError::MissingBucket)));

        let mut config = HostConfig::default();
        config.service.warm_pool_size = config.service.mandelbox_capacity + 1;
        assert!(matches!(config.validate(), Err(ConfigError::Service(_))));
    }

    #[test]
    fn test_detect_gpus() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["nvidia0", "nvidia1", "nvidiactl", "nvidia-uvm", "null"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        assert_eq!(detect_gpus(dir.path()), 2);
        assert_eq!(detect_gpus(&dir.path().join("missing")), 0);
    }

    #[test]
    fn test_object_store_parsing() {
        assert_eq!(ObjectStoreKind::parse("memory"), ObjectStoreKind::Memory);
        assert_eq!(ObjectStoreKind::parse("S3"), ObjectStoreKind::S3);
        assert_eq!(ObjectStoreKind::parse("anything"), ObjectStoreKind::S3);
    }
}
