//! Host port binding allocation.

use crate::error::{CoreError, Result};
use mandel_runtime::{PortMapping, Protocol};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::ops::Range;

/// Random candidates tried per requested binding.
const MAX_DRAWS: usize = 100;

/// A requested or assigned port binding.
///
/// `host_port == 0` in a request means "any free port".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortBinding {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host.
    pub host_port: u16,
    /// Transport protocol.
    pub protocol: Protocol,
}

impl PortBinding {
    /// Request any free host port for `container_port`.
    pub fn any(container_port: u16, protocol: Protocol) -> Self {
        Self {
            container_port,
            host_port: 0,
            protocol,
        }
    }
}

impl From<PortBinding> for PortMapping {
    fn from(b: PortBinding) -> Self {
        PortMapping {
            container_port: b.container_port,
            host_port: b.host_port,
            protocol: b.protocol,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Reserved,
    InUse,
}

/// Host ports handed out to containers, keyed by protocol and port.
#[derive(Debug)]
pub struct PortPool {
    range: Range<u16>,
    slots: Mutex<HashMap<(Protocol, u16), Slot>>,
}

impl PortPool {
    /// Create a pool over `range` with `reserved` ports never handed out.
    pub fn new(range: Range<u16>, reserved: &[(Protocol, u16)]) -> Self {
        let slots = reserved.iter().map(|key| (*key, Slot::Reserved)).collect();
        Self {
            range,
            slots: Mutex::new(slots),
        }
    }

    /// Reserve a host port for every requested binding.
    ///
    /// Either every binding is satisfied or none is: a failure releases the
    /// ports taken earlier in the same call.
    ///
    /// # Errors
    /// [`CoreError::Capacity`] if some binding cannot be satisfied.
    pub fn allocate(&self, desired: &[PortBinding]) -> Result<Vec<PortBinding>> {
        let mut slots = self.slots.lock();
        let mut assigned: Vec<PortBinding> = Vec::with_capacity(desired.len());

        for request in desired {
            match self.reserve_one(&mut slots, request) {
                Some(host_port) => assigned.push(PortBinding {
                    host_port,
                    ..*request
                }),
                None => {
                    for done in &assigned {
                        slots.remove(&(done.protocol, done.host_port));
                    }
                    return Err(CoreError::capacity(
                        "port",
                        format!(
                            "could not bind {}/{} (host port {})",
                            request.container_port, request.protocol, request.host_port
                        ),
                    ));
                }
            }
        }

        tracing::trace!(count = assigned.len(), "Allocated port bindings");
        Ok(assigned)
    }

    fn reserve_one(
        &self,
        slots: &mut HashMap<(Protocol, u16), Slot>,
        request: &PortBinding,
    ) -> Option<u16> {
        if request.host_port != 0 {
            let key = (request.protocol, request.host_port);
            if self.range.contains(&request.host_port) && !slots.contains_key(&key) {
                slots.insert(key, Slot::InUse);
                return Some(request.host_port);
            }
            return None;
        }

        let mut rng = rand::thread_rng();
        for _ in 0..MAX_DRAWS {
            let port = rng.gen_range(self.range.clone());
            let key = (request.protocol, port);
            if !slots.contains_key(&key) {
                slots.insert(key, Slot::InUse);
                return Some(port);
            }
        }
        None
    }

    /// Release bindings. Reserved and unknown ports are ignored.
    pub fn free(&self, bindings: &[PortBinding]) {
        let mut slots = self.slots.lock();
        for b in bindings {
            let key = (b.protocol, b.host_port);
            if slots.get(&key) == Some(&Slot::InUse) {
                slots.remove(&key);
            }
        }
    }

    /// Number of ports currently bound.
    pub fn in_use(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|s| **s == Slot::InUse)
            .count()
    }
}
