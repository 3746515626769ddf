//! # mandel-host
//!
//! The per-host service: environment configuration and the client-facing
//! handshake endpoint. The binary in `main.rs` wires these to
//! [`mandel_core`] and owns the process lifecycle.

pub mod config;
pub mod http;

pub use config::{ConfigError, HostConfig, ObjectStoreKind};
