//! Runtime-neutral container description.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RuntimeError;

/// Runtime-assigned container identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContainerId(String);

impl ContainerId {
    /// Wrap a runtime container id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id is empty (never issued by a runtime).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ContainerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for ContainerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Transport protocol of a port mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    /// TCP
    Tcp,
    /// UDP
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for Protocol {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(RuntimeError::InvalidSpec(format!(
                "unknown protocol: {other}"
            ))),
        }
    }
}

/// Publishes a container port on a host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMapping {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host.
    pub host_port: u16,
    /// Protocol of both ports.
    pub protocol: Protocol,
}

impl PortMapping {
    /// Key used by the runtime for this mapping, e.g. `32262/tcp`.
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol)
    }
}

/// Host device exposed inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceMapping {
    /// Device path on the host.
    pub path_on_host: String,
    /// Device path inside the container.
    pub path_in_container: String,
    /// Cgroup permissions, e.g. `rwm`.
    pub cgroup_permissions: String,
}

impl DeviceMapping {
    /// Map a host device to the same path inside the container.
    pub fn same_path(path: impl Into<String>, permissions: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            path_in_container: path.clone(),
            path_on_host: path,
            cgroup_permissions: permissions.into(),
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone, Default)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Published ports.
    pub port_mappings: Vec<PortMapping>,
    /// Host devices.
    pub devices: Vec<DeviceMapping>,
    /// Bind mounts in `host:container[:opts]` form.
    pub binds: Vec<String>,
    /// tmpfs mounts and their options.
    pub tmpfs: BTreeMap<String, String>,
    /// Capabilities to add.
    pub cap_add: Vec<String>,
    /// Capabilities to drop.
    pub cap_drop: Vec<String>,
    /// Security options, e.g. an AppArmor profile.
    pub security_opt: Vec<String>,
    /// `/dev/shm` size in bytes.
    pub shm_size: Option<i64>,
    /// Relative CPU weight.
    pub cpu_shares: Option<i64>,
    /// Memory limit in bytes.
    pub memory: Option<i64>,
    /// Attach a pseudo-TTY.
    pub tty: bool,
}

impl ContainerSpec {
    /// Start building a spec for the given name and image.
    pub fn builder(name: impl Into<String>, image: impl Into<String>) -> ContainerSpecBuilder {
        ContainerSpecBuilder {
            spec: ContainerSpec {
                name: name.into(),
                image: image.into(),
                ..Default::default()
            },
        }
    }

    /// Environment in `KEY=value` form.
    pub fn env_list(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{k}={v}")).collect()
    }
}

/// Builder for [`ContainerSpec`].
#[derive(Debug)]
pub struct ContainerSpecBuilder {
    spec: ContainerSpec,
}

impl ContainerSpecBuilder {
    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.spec.env.insert(key.into(), value.into());
        self
    }

    /// Publish a port.
    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.spec.port_mappings.push(mapping);
        self
    }

    /// Expose a host device.
    pub fn device(mut self, device: DeviceMapping) -> Self {
        self.spec.devices.push(device);
        self
    }

    /// Add a bind mount.
    pub fn bind(mut self, bind: impl Into<String>) -> Self {
        self.spec.binds.push(bind.into());
        self
    }

    /// Add a tmpfs mount.
    pub fn tmpfs(mut self, path: impl Into<String>, options: impl Into<String>) -> Self {
        self.spec.tmpfs.insert(path.into(), options.into());
        self
    }

    /// Add a capability.
    pub fn cap_add(mut self, cap: impl Into<String>) -> Self {
        self.spec.cap_add.push(cap.into());
        self
    }

    /// Drop a capability.
    pub fn cap_drop(mut self, cap: impl Into<String>) -> Self {
        self.spec.cap_drop.push(cap.into());
        self
    }

    /// Add a security option.
    pub fn security_opt(mut self, opt: impl Into<String>) -> Self {
        self.spec.security_opt.push(opt.into());
        self
    }

    /// Set the shared memory size in bytes.
    pub fn shm_size(mut self, bytes: i64) -> Self {
        self.spec.shm_size = Some(bytes);
        self
    }

    /// Set the CPU shares.
    pub fn cpu_shares(mut self, shares: i64) -> Self {
        self.spec.cpu_shares = Some(shares);
        self
    }

    /// Set the memory limit in bytes.
    pub fn memory(mut self, bytes: i64) -> Self {
        self.spec.memory = Some(bytes);
        self
    }

    /// Attach a pseudo-TTY.
    pub fn tty(mut self, tty: bool) -> Self {
        self.spec.tty = tty;
        self
    }

    /// Finish the spec.
    pub fn build(self) -> ContainerSpec {
        self.spec
    }
}
