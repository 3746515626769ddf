//! GPU index assignment.

use crate::error::{CoreError, Result};
use crate::types::MandelboxId;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Default)]
struct GpuState {
    load: Vec<u32>,
    owners: HashMap<MandelboxId, u32>,
}

/// Least-loaded GPU assignment with a per-GPU sharing limit.
///
/// A pool with zero GPUs is disabled: allocation trivially succeeds with no
/// index.
#[derive(Debug)]
pub struct GpuPool {
    max_per_gpu: u32,
    state: Mutex<GpuState>,
}

impl GpuPool {
    /// Create a pool over `count` GPUs, each shared by at most `max_per_gpu`
    /// mandelboxes.
    pub fn new(count: u32, max_per_gpu: u32) -> Self {
        Self {
            max_per_gpu,
            state: Mutex::new(GpuState {
                load: vec![0; count as usize],
                owners: HashMap::new(),
            }),
        }
    }

    /// A pool that never assigns a GPU.
    pub fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Whether any GPU can be assigned.
    pub fn is_enabled(&self) -> bool {
        !self.state.lock().load.is_empty()
    }

    /// Assign the least-loaded GPU to `owner`.
    ///
    /// Returns the already assigned index if `owner` has one.
    ///
    /// # Errors
    /// [`CoreError::Capacity`] if every GPU is at its sharing limit.
    pub fn allocate(&self, owner: MandelboxId) -> Result<Option<u32>> {
        let mut state = self.state.lock();
        if state.load.is_empty() {
            return Ok(None);
        }
        if let Some(index) = state.owners.get(&owner) {
            return Ok(Some(*index));
        }

        let (index, load) = state
            .load
            .iter()
            .enumerate()
            .min_by_key(|(_, load)| **load)
            .map(|(i, l)| (i, *l))
            .ok_or_else(|| CoreError::capacity("gpu", "no GPUs"))?;

        if load >= self.max_per_gpu {
            return Err(CoreError::capacity(
                "gpu",
                format!("all GPUs at {} mandelboxes", self.max_per_gpu),
            ));
        }

        state.load[index] += 1;
        state.owners.insert(owner, index as u32);
        tracing::trace!(mandelbox_id = %owner, gpu = index, "Assigned GPU");
        Ok(Some(index as u32))
    }

    /// Release `owner`'s GPU. Unknown owners are ignored.
    pub fn free(&self, owner: MandelboxId) {
        let mut state = self.state.lock();
        if let Some(index) = state.owners.remove(&owner) {
            if let Some(load) = state.load.get_mut(index as usize) {
                *load = load.saturating_sub(1);
            }
            tracing::trace!(mandelbox_id = %owner, gpu = index, "Freed GPU");
        }
    }

    /// Current number of mandelboxes on each GPU.
    pub fn loads(&self) -> Vec<u32> {
        self.state.lock().load.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_pool_always_succeeds() {
        let pool = GpuPool::disabled();
        assert!(!pool.is_enabled());
        for _ in 0..10 {
            assert_eq!(pool.allocate(MandelboxId::new()).unwrap(), None);
        }
    }

    #[test]
    fn test_least_loaded_spread() {
        let pool = GpuPool::new(2, 2);
        let ids: Vec<_> = (0..4).map(|_| MandelboxId::new()).collect();
        for id in &ids {
            pool.allocate(*id).unwrap().unwrap();
        }
        assert_eq!(pool.loads(), vec![2, 2]);
        assert!(pool.allocate(MandelboxId::new()).unwrap_err().is_capacity());

        pool.free(ids[0]);
        let next = pool.allocate(MandelboxId::new()).unwrap();
        assert!(next.is_some());
        assert_eq!(pool.loads(), vec![2, 2]);
    }

    #[test]
    fn test_repeat_allocation_and_unknown_free() {
        let pool = GpuPool::new(3, 1);
        let id = MandelboxId::new();
        let first = pool.allocate(id).unwrap();
        assert_eq!(pool.allocate(id).unwrap(), first);
        assert_eq!(pool.loads().iter().sum::<u32>(), 1);

        pool.free(MandelboxId::new());
        pool.free(id);
        pool.free(id);
        assert_eq!(pool.loads(), vec![0, 0, 0]);
    }
}
