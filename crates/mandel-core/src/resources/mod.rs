//! Bounded host resource pools.
//!
//! Each pool guards its own state with its own lock, held only for the
//! duration of a single allocate or free. Freeing something that was never
//! allocated, or was already freed, is always a no-op.

mod gpu;
mod ports;
mod tty;
mod uinput;

pub use gpu::GpuPool;
pub use ports::{PortBinding, PortPool};
pub use tty::{Tty, TtyPool, MAX_DRAWS};
pub use uinput::{
    send_device_fds, InputDevice, InputDeviceFactory, InputDeviceKind, UinputDevices,
    UinputFactory, UinputPool,
};

use crate::config::ServiceConfig;
use std::sync::Arc;

/// All host resource pools shared by the mandelboxes of one process.
#[derive(Debug)]
pub struct ResourcePools {
    /// TTY numbers.
    pub tty: TtyPool,
    /// GPU indices.
    pub gpu: GpuPool,
    /// Host port bindings.
    pub ports: PortPool,
    /// Virtual input devices.
    pub uinput: UinputPool,
}

impl ResourcePools {
    /// Build the pools described by `config`, creating input devices with
    /// `factory`.
    pub fn new(config: &ServiceConfig, factory: Arc<dyn InputDeviceFactory>) -> Self {
        let gpu = if config.gpu_enabled() {
            GpuPool::new(config.gpu_count, config.max_per_gpu)
        } else {
            GpuPool::disabled()
        };

        Self {
            tty: TtyPool::new(config.tty_range.clone()),
            gpu,
            ports: PortPool::new(config.port_range.clone(), &config.reserved_ports),
            uinput: UinputPool::new(factory),
        }
    }
}
