//! # mandel-core
//!
//! Per-host orchestration of mandelboxes: containerized application
//! sessions, each bound to host resources and, once assigned, to one user.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      mandel-core (host)                      │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌────────────────┐   handshakes   ┌──────────────────────┐  │
//! │  │ run_event_loop │◀───────────────│ HTTP (mandel-host)   │  │
//! │  │                │◀── runtime events / subscriptions      │  │
//! │  └────────────────┘                └──────────────────────┘  │
//! │          │ spawns                                            │
//! │          ▼                                                   │
//! │  ┌────────────────┐     ┌──────────────────────────────────┐ │
//! │  │ start_spin_up  │────▶│ Mandelbox                        │ │
//! │  │ finish_spin_up │     │  - tty / gpu / ports / uinput    │ │
//! │  └────────────────┘     │  - container (mandel-runtime)    │ │
//! │          │              │  - lifetime token → teardown     │ │
//! │          ▼              └──────────────────────────────────┘ │
//! │  ┌────────────────┐     ┌──────────────────────────────────┐ │
//! │  │ UserConfigs    │────▶│ ObjectStore (mandel-storage)     │ │
//! │  └────────────────┘     └──────────────────────────────────┘ │
//! │                                                              │
//! │  HostContext: config, pools, registry, state store, tracker  │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use mandel_core::{
//!     start_spin_up, DisabledStateStore, HostContext, MandelboxId, ServiceConfig, UinputFactory,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> mandel_core::Result<()> {
//! let ctx = HostContext::new(
//!     ServiceConfig::default(),
//!     Arc::new(mandel_runtime::DockerRuntime::connect().await?),
//!     Arc::new(mandel_storage::MemoryStore::new()),
//!     Arc::new(DisabledStateStore),
//!     Arc::new(UinputFactory::default()),
//! )?;
//!
//! let mandelbox = start_spin_up(&ctx, MandelboxId::new(), "browsers/chrome".into()).await?;
//! mandelbox.close();
//! mandelbox.closed().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Resource pools**: TTY numbers, GPU slots, host ports and virtual input devices
//! - **Two-phase spin-up**: containers boot before a user is known, then get assigned
//! - **User configs**: encrypted, checksummed config archives restored and backed up
//! - **Teardown**: one cancellation releases everything a mandelbox holds, exactly once
//! - **Warm pool**: unassigned mandelboxes kept ready for the scheduler

mod config;
mod context;
mod error;
mod event_loop;
mod handshake;
mod maintenance;
mod mandelbox;
mod params;
mod registry;
mod spinup;
mod store;
mod types;
mod user_configs;
mod warmup;
mod zygote;

pub mod configutils;
pub mod resources;

pub use config::{AppEnvironment, ServiceConfig, ServiceConfigBuilder, HANDSHAKE_PORT};
pub use context::HostContext;
pub use error::{CoreError, Result};
pub use event_loop::{handle_die, run_event_loop, LoopExit};
pub use handshake::{
    HandshakeMap, HandshakeReply, HandshakeRequest, JsonTransportRequest, JsonTransportResult,
};
pub use maintenance::{maintenance_pass, run_maintenance, MAINTENANCE_INTERVAL};
pub use mandelbox::Mandelbox;
pub use params::{
    wait_for_file_creation, ResourceMappings, APP_READY_FILENAME, IDENTIFYING_PORT,
};
pub use registry::Registry;
pub use resources::{InputDeviceFactory, UinputFactory};
pub use spinup::{container_name, container_spec, finish_spin_up, start_spin_up, EXPOSED_PORTS};
pub use store::{
    DisabledStateStore, InstanceRecord, InstanceStatus, MandelboxAssignment, MandelboxRecord,
    MemoryStateStore, StateStore, SubscriptionEvent, STALE_ALLOCATED_AGE, STALE_CONNECTING_AGE,
};
pub use types::{
    AppName, ConfigEncryptionToken, MandelboxId, MandelboxStatus, SessionId, SessionKey, UserId,
};
pub use user_configs::{
    backup_user_configs, ConfigEncryptionInfo, UserConfigs, ENCRYPTED_ARCHIVE_FILENAME,
    MIN_TOKEN_LEN,
};
pub use warmup::{warm_up_runtime, WarmupOptions};
pub use zygote::{WarmPool, WarmPoolStats};
