//! # mandel-runtime
//!
//! Container runtime layer for mandelboxes.
//! Provides the [`ContainerRuntime`] abstraction the orchestrator drives and a
//! Docker implementation over bollard.
//!
//! ## Quick Start
//!
//! ```no_run
//! use mandel_runtime::{ContainerRuntime, ContainerSpec, DockerRuntime};
//! use std::time::Duration;
//!
//! # async fn example() -> mandel_runtime::Result<()> {
//! let runtime = DockerRuntime::connect().await?;
//!
//! let spec = ContainerSpec::builder("browsers-chrome-1234", "ghcr.io/whisthq/dev/browsers/chrome:current-build")
//!     .env("SENTRY_ENV", "dev")
//!     .cap_drop("ALL")
//!     .build();
//!
//! let id = runtime.create(&spec).await?;
//! runtime.start(&id).await?;
//! runtime.stop(&id, Duration::from_secs(30)).await?;
//! runtime.remove(&id).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle**: create, start, stop and force-remove containers
//! - **Image lookup**: resolve locally built images by tag pattern
//! - **Events**: a container lifecycle event stream with transient/fatal error classification

mod docker;
mod error;
mod spec;

pub use docker::DockerRuntime;
pub use error::{Result, RuntimeError};
pub use spec::{
    ContainerId, ContainerSpec, ContainerSpecBuilder, DeviceMapping, PortMapping, Protocol,
};

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::time::Duration;

/// One container lifecycle event from the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Runtime id of the container the event is about.
    pub container_id: ContainerId,
    /// Event action, e.g. `create`, `start`, `die`.
    pub action: String,
}

/// Error yielded by the event stream.
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventStreamError {
    /// The stream hit a recoverable error; resubscribing is expected to work.
    #[error("transient event stream error: {0}")]
    Transient(String),

    /// The connection to the runtime is gone.
    #[error("fatal event stream error: {0}")]
    Fatal(String),
}

/// Stream of container lifecycle events.
pub type EventStream = BoxStream<'static, std::result::Result<RuntimeEvent, EventStreamError>>;

/// Operations the orchestrator needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create (but do not start) a container and return its runtime id.
    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId>;

    /// Start a created container.
    async fn start(&self, id: &ContainerId) -> Result<()>;

    /// Stop a container, killing it after `timeout`.
    async fn stop(&self, id: &ContainerId, timeout: Duration) -> Result<()>;

    /// Force-remove a container, running or not.
    async fn remove(&self, id: &ContainerId) -> Result<()>;

    /// Return the first local image tag matching the patterns, tried in order.
    async fn find_image(&self, patterns: &[String]) -> Result<Option<String>>;

    /// Subscribe to container lifecycle events.
    fn events(&self) -> EventStream;
}
