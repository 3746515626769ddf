//! Process-wide index of live mandelboxes.

use crate::error::{CoreError, Result};
use crate::mandelbox::Mandelbox;
use crate::types::MandelboxId;
use mandel_runtime::ContainerId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    by_id: HashMap<MandelboxId, Arc<Mandelbox>>,
    by_container: HashMap<ContainerId, MandelboxId>,
}

/// Concurrent map from mandelbox id, and runtime container id once the
/// container exists, to the entity.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Inner>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("tracked", &self.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `mandelbox`.
    ///
    /// # Errors
    /// [`CoreError::AlreadyExists`] if its id is already tracked.
    pub fn track(&self, mandelbox: Arc<Mandelbox>) -> Result<()> {
        let id = mandelbox.id();
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&id) {
            return Err(CoreError::AlreadyExists(id));
        }
        inner.by_id.insert(id, mandelbox);
        Ok(())
    }

    /// Stop tracking `id`. Returns the entity if it was tracked.
    pub fn untrack(&self, id: MandelboxId) -> Option<Arc<Mandelbox>> {
        let mut inner = self.inner.write();
        inner.by_container.retain(|_, tracked| *tracked != id);
        inner.by_id.remove(&id)
    }

    /// Index `id` by its runtime container id.
    pub(crate) fn register_container(&self, id: MandelboxId, container: ContainerId) {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&id) {
            inner.by_container.insert(container, id);
        }
    }

    /// Look up by mandelbox id.
    ///
    /// # Errors
    /// [`CoreError::NotFound`] if `id` is not tracked.
    pub fn lookup(&self, id: MandelboxId) -> Result<Arc<Mandelbox>> {
        self.inner
            .read()
            .by_id
            .get(&id)
            .cloned()
            .ok_or(CoreError::NotFound(id))
    }

    /// Look up by runtime container id.
    pub fn lookup_by_container(&self, container: &ContainerId) -> Option<Arc<Mandelbox>> {
        let inner = self.inner.read();
        inner
            .by_container
            .get(container)
            .and_then(|id| inner.by_id.get(id))
            .cloned()
    }

    /// Snapshot of every tracked mandelbox.
    pub fn all(&self) -> Vec<Arc<Mandelbox>> {
        self.inner.read().by_id.values().cloned().collect()
    }

    /// Number of tracked mandelboxes.
    pub fn len(&self) -> usize {
        self.inner.read().by_id.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.inner.read().by_id.is_empty()
    }

    /// Close every mandelbox no client has connected to. Returns how many
    /// were closed.
    pub fn close_unconnected(&self) -> usize {
        let targets: Vec<_> = self
            .all()
            .into_iter()
            .filter(|m| !m.is_connected())
            .collect();
        for mandelbox in &targets {
            tracing::info!(mandelbox_id = %mandelbox.id(), "Closing unconnected mandelbox");
            mandelbox.close();
        }
        targets.len()
    }
}
