//! External state store.
//!
//! The scheduler above this host reads and writes instance and mandelbox
//! rows. [`StateStore`] names the operations the orchestrator needs;
//! [`MemoryStateStore`] keeps the rows in process and can play the
//! scheduler, [`DisabledStateStore`] accepts everything for local
//! development without a database.

use crate::error::{CoreError, Result};
use crate::types::{AppName, MandelboxId, MandelboxStatus, SessionId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc;

/// ALLOCATED rows older than this are stale.
pub const STALE_ALLOCATED_AGE: Duration = Duration::from_secs(10);

/// CONNECTING rows older than this are stale.
pub const STALE_CONNECTING_AGE: Duration = Duration::from_secs(90);

/// Status of an instance row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Accepting mandelboxes.
    Active,
    /// Finishing its sessions before shutting down.
    Draining,
    /// Missed its heartbeats.
    Unresponsive,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "ACTIVE"),
            Self::Draining => write!(f, "DRAINING"),
            Self::Unresponsive => write!(f, "UNRESPONSIVE"),
        }
    }
}

/// One instance row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub name: String,
    pub capacity: usize,
    pub remaining_capacity: usize,
    pub status: InstanceStatus,
    pub last_heartbeat: DateTime<Utc>,
}

/// One mandelbox row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MandelboxRecord {
    pub id: MandelboxId,
    pub app_name: AppName,
    pub instance_name: String,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub status: MandelboxStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MandelboxRecord {
    /// A fresh WAITING row.
    pub fn waiting(id: MandelboxId, app_name: AppName, instance_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            app_name,
            instance_name: instance_name.into(),
            user_id: UserId::default(),
            session_id: SessionId::default(),
            status: MandelboxStatus::Waiting,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A user matched to a mandelbox by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MandelboxAssignment {
    pub mandelbox_id: MandelboxId,
    pub user_id: UserId,
    pub session_id: SessionId,
    pub app_name: AppName,
    pub instance_name: String,
}

/// Events pushed by the state store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A mandelbox on this instance was assigned to a user.
    MandelboxAssigned(MandelboxAssignment),
    /// This instance was asked to drain and shut down.
    InstanceDraining,
}

/// Operations on the external state store.
///
/// Writes that match no row return [`CoreError::NoRowsAffected`] (or
/// [`CoreError::Store`] for instance rows), distinct from query failures.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Register this instance as active.
    ///
    /// # Errors
    /// [`CoreError::InvalidState`] if the row exists and is draining or
    /// unresponsive; the process should exit.
    async fn register_instance(&self, name: &str, capacity: usize) -> Result<()>;

    /// Delete this instance's row.
    async fn unregister_instance(&self, name: &str) -> Result<()>;

    /// Refresh the instance heartbeat and remaining capacity.
    async fn heartbeat(&self, name: &str, remaining_capacity: usize) -> Result<()>;

    /// Insert a mandelbox row.
    async fn create_mandelbox(&self, record: &MandelboxRecord) -> Result<()>;

    /// In one transaction: check the row is ALLOCATED to `user` on
    /// `instance`, then move it to CONNECTING.
    async fn verify_allocated_mandelbox(
        &self,
        instance: &str,
        id: MandelboxId,
        user: &UserId,
    ) -> Result<()>;

    /// Update a mandelbox status.
    async fn write_mandelbox_status(&self, id: MandelboxId, status: MandelboxStatus) -> Result<()>;

    /// Delete a mandelbox row.
    async fn remove_mandelbox(&self, id: MandelboxId) -> Result<()>;

    /// Delete this instance's rows stuck in ALLOCATED or CONNECTING.
    /// Returns how many were removed.
    async fn remove_stale_mandelboxes(&self, instance: &str) -> Result<u64>;
}

// ============================================================================
// In-memory store
// ============================================================================

#[derive(Debug, Default)]
struct Tables {
    instances: HashMap<String, InstanceRecord>,
    mandelboxes: HashMap<MandelboxId, MandelboxRecord>,
}

/// State store kept in process memory. Every operation runs under one lock,
/// which makes each of them a transaction.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<SubscriptionEvent>>>,
}

impl MemoryStateStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive assignment and draining events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SubscriptionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn publish(&self, event: SubscriptionEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Act as the scheduler: assign the oldest WAITING mandelbox for `app` on
    /// `instance` to `user`, and publish the assignment.
    ///
    /// # Errors
    /// [`CoreError::Capacity`] if no mandelbox is waiting.
    pub fn allocate(
        &self,
        instance: &str,
        app: &AppName,
        user: UserId,
        session: SessionId,
    ) -> Result<MandelboxAssignment> {
        let assignment = {
            let mut tables = self.tables.lock();
            let record = tables
                .mandelboxes
                .values_mut()
                .filter(|r| {
                    r.instance_name == instance
                        && &r.app_name == app
                        && r.status == MandelboxStatus::Waiting
                })
                .min_by_key(|r| r.created_at)
                .ok_or_else(|| {
                    CoreError::capacity("mandelbox", format!("no waiting {app} on {instance}"))
                })?;

            record.status = MandelboxStatus::Allocated;
            record.user_id = user;
            record.session_id = session;
            record.updated_at = Utc::now();

            MandelboxAssignment {
                mandelbox_id: record.id,
                user_id: record.user_id.clone(),
                session_id: record.session_id.clone(),
                app_name: record.app_name.clone(),
                instance_name: record.instance_name.clone(),
            }
        };

        self.publish(SubscriptionEvent::MandelboxAssigned(assignment.clone()));
        Ok(assignment)
    }

    /// Mark `instance` as draining and publish the event.
    pub fn set_draining(&self, instance: &str) {
        if let Some(row) = self.tables.lock().instances.get_mut(instance) {
            row.status = InstanceStatus::Draining;
        }
        self.publish(SubscriptionEvent::InstanceDraining);
    }

    /// Snapshot of a mandelbox row.
    pub fn mandelbox(&self, id: MandelboxId) -> Option<MandelboxRecord> {
        self.tables.lock().mandelboxes.get(&id).cloned()
    }

    /// Snapshot of an instance row.
    pub fn instance(&self, name: &str) -> Option<InstanceRecord> {
        self.tables.lock().instances.get(name).cloned()
    }

    /// Number of mandelbox rows.
    pub fn mandelbox_count(&self) -> usize {
        self.tables.lock().mandelboxes.len()
    }
}

fn age_exceeds(now: DateTime<Utc>, then: DateTime<Utc>, limit: Duration) -> bool {
    (now - then)
        .to_std()
        .map(|age| age > limit)
        .unwrap_or(false)
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn register_instance(&self, name: &str, capacity: usize) -> Result<()> {
        let mut tables = self.tables.lock();
        let now = Utc::now();
        match tables.instances.get_mut(name) {
            Some(row) if row.status != InstanceStatus::Active => Err(CoreError::InvalidState {
                expected: InstanceStatus::Active.to_string(),
                actual: row.status.to_string(),
            }),
            Some(row) => {
                row.capacity = capacity;
                row.remaining_capacity = capacity;
                row.last_heartbeat = now;
                Ok(())
            }
            None => {
                tables.instances.insert(
                    name.to_string(),
                    InstanceRecord {
                        name: name.to_string(),
                        capacity,
                        remaining_capacity: capacity,
                        status: InstanceStatus::Active,
                        last_heartbeat: now,
                    },
                );
                Ok(())
            }
        }
    }

    async fn unregister_instance(&self, name: &str) -> Result<()> {
        match self.tables.lock().instances.remove(name) {
            Some(_) => Ok(()),
            None => Err(CoreError::InstanceNoRowsAffected {
                operation: "unregister_instance",
                instance: name.to_string(),
            }),
        }
    }

    async fn heartbeat(&self, name: &str, remaining_capacity: usize) -> Result<()> {
        let mut tables = self.tables.lock();
        let row = tables
            .instances
            .get_mut(name)
            .ok_or_else(|| CoreError::InstanceNoRowsAffected {
                operation: "heartbeat",
                instance: name.to_string(),
            })?;
        row.remaining_capacity = remaining_capacity;
        row.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn create_mandelbox(&self, record: &MandelboxRecord) -> Result<()> {
        let mut tables = self.tables.lock();
        if tables.mandelboxes.contains_key(&record.id) {
            return Err(CoreError::AlreadyExists(record.id));
        }
        tables.mandelboxes.insert(record.id, record.clone());
        Ok(())
    }

    async fn verify_allocated_mandelbox(
        &self,
        instance: &str,
        id: MandelboxId,
        user: &UserId,
    ) -> Result<()> {
        let mut tables = self.tables.lock();
        let row = tables
            .mandelboxes
            .get_mut(&id)
            .ok_or(CoreError::NotFound(id))?;

        if row.status != MandelboxStatus::Allocated {
            return Err(CoreError::InvalidState {
                expected: MandelboxStatus::Allocated.to_string(),
                actual: row.status.to_string(),
            });
        }
        if row.instance_name != instance {
            return Err(CoreError::InvalidState {
                expected: format!("instance {instance}"),
                actual: format!("instance {}", row.instance_name),
            });
        }
        if &row.user_id != user {
            return Err(CoreError::InvalidState {
                expected: format!("user {user}"),
                actual: format!("user {}", row.user_id),
            });
        }

        row.status = MandelboxStatus::Connecting;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn write_mandelbox_status(&self, id: MandelboxId, status: MandelboxStatus) -> Result<()> {
        let mut tables = self.tables.lock();
        let row = tables
            .mandelboxes
            .get_mut(&id)
            .ok_or(CoreError::NoRowsAffected {
                operation: "write_mandelbox_status",
                id,
            })?;
        row.status = status;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn remove_mandelbox(&self, id: MandelboxId) -> Result<()> {
        match self.tables.lock().mandelboxes.remove(&id) {
            Some(_) => Ok(()),
            None => Err(CoreError::NoRowsAffected {
                operation: "remove_mandelbox",
                id,
            }),
        }
    }

    async fn remove_stale_mandelboxes(&self, instance: &str) -> Result<u64> {
        let now = Utc::now();
        let mut tables = self.tables.lock();
        let before = tables.mandelboxes.len();
        tables.mandelboxes.retain(|_, r| {
            if r.instance_name != instance {
                return true;
            }
            let stale = match r.status {
                MandelboxStatus::Allocated => age_exceeds(now, r.updated_at, STALE_ALLOCATED_AGE),
                MandelboxStatus::Connecting => {
                    age_exceeds(now, r.updated_at, STALE_CONNECTING_AGE)
                }
                _ => false,
            };
            !stale
        });
        Ok((before - tables.mandelboxes.len()) as u64)
    }
}

// ============================================================================
// Disabled store
// ============================================================================

/// Store used without a database: every operation succeeds and does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStateStore;

#[async_trait]
impl StateStore for DisabledStateStore {
    async fn register_instance(&self, _name: &str, _capacity: usize) -> Result<()> {
        Ok(())
    }

    async fn unregister_instance(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn heartbeat(&self, _name: &str, _remaining_capacity: usize) -> Result<()> {
        Ok(())
    }

    async fn create_mandelbox(&self, _record: &MandelboxRecord) -> Result<()> {
        Ok(())
    }

    async fn verify_allocated_mandelbox(
        &self,
        _instance: &str,
        _id: MandelboxId,
        _user: &UserId,
    ) -> Result<()> {
        Ok(())
    }

    async fn write_mandelbox_status(
        &self,
        _id: MandelboxId,
        _status: MandelboxStatus,
    ) -> Result<()> {
        Ok(())
    }

    async fn remove_mandelbox(&self, _id: MandelboxId) -> Result<()> {
        Ok(())
    }

    async fn remove_stale_mandelboxes(&self, _instance: &str) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chrome() -> AppName {
        AppName::new("browsers/chrome")
    }

    #[tokio::test]
    async fn test_allocate_then_verify() {
        let store = MemoryStateStore::new();
        let mut events = store.subscribe();
        store.register_instance("i-1", 4).await.unwrap();

        let id = MandelboxId::new();
        store
            .create_mandelbox(&MandelboxRecord::waiting(id, chrome(), "i-1"))
            .await
            .unwrap();

        let user = UserId::new("user-1");
        let assignment = store
            .allocate("i-1", &chrome(), user.clone(), SessionId::new("1700000000000"))
            .unwrap();
        assert_eq!(assignment.mandelbox_id, id);
        assert_eq!(
            events.recv().await.unwrap(),
            SubscriptionEvent::MandelboxAssigned(assignment)
        );

        let wrong = store
            .verify_allocated_mandelbox("i-1", id, &UserId::new("someone-else"))
            .await;
        assert!(matches!(wrong, Err(CoreError::InvalidState { .. })));

        store.verify_allocated_mandelbox("i-1", id, &user).await.unwrap();
        assert_eq!(store.mandelbox(id).unwrap().status, MandelboxStatus::Connecting);

        // second verification sees CONNECTING
        assert!(store.verify_allocated_mandelbox("i-1", id, &user).await.is_err());
    }

    #[tokio::test]
    async fn test_allocate_without_waiting_rows() {
        let store = MemoryStateStore::new();
        let err = store
            .allocate("i-1", &chrome(), UserId::new("u"), SessionId::new("1"))
            .unwrap_err();
        assert!(err.is_capacity());
    }

    #[tokio::test]
    async fn test_zero_rows_affected() {
        let store = MemoryStateStore::new();
        let id = MandelboxId::new();
        assert!(matches!(
            store.write_mandelbox_status(id, MandelboxStatus::Running).await,
            Err(CoreError::NoRowsAffected { .. })
        ));
        assert!(matches!(
            store.remove_mandelbox(id).await,
            Err(CoreError::NoRowsAffected { .. })
        ));
        assert!(matches!(
            store.heartbeat("missing", 1).await,
            Err(CoreError::InstanceNoRowsAffected { operation: "heartbeat", ref instance })
                if instance == "missing"
        ));
        assert!(matches!(
            store.unregister_instance("missing").await,
            Err(CoreError::InstanceNoRowsAffected { operation: "unregister_instance", .. })
        ));
        store.register_instance("present", 1).await.unwrap();
        store.unregister_instance("present").await.unwrap();
    }

    #[tokio::test]
    async fn test_draining_instance_cannot_register() {
        let store = MemoryStateStore::new();
        let mut events = store.subscribe();
        store.register_instance("i-1", 2).await.unwrap();
        store.set_draining("i-1");
        assert_eq!(events.recv().await.unwrap(), SubscriptionEvent::InstanceDraining);
        assert!(matches!(
            store.register_instance("i-1", 2).await,
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_stale() {
        let store = MemoryStateStore::new();
        let old = Utc::now() - chrono::Duration::seconds(120);

        let mut stuck_allocated = MandelboxRecord::waiting(MandelboxId::new(), chrome(), "i-1");
        stuck_allocated.status = MandelboxStatus::Allocated;
        stuck_allocated.updated_at = old;

        let mut stuck_connecting = MandelboxRecord::waiting(MandelboxId::new(), chrome(), "i-1");
        stuck_connecting.status = MandelboxStatus::Connecting;
        stuck_connecting.updated_at = old;

        let mut fresh = MandelboxRecord::waiting(MandelboxId::new(), chrome(), "i-1");
        fresh.status = MandelboxStatus::Allocated;

        let mut old_running = MandelboxRecord::waiting(MandelboxId::new(), chrome(), "i-1");
        old_running.status = MandelboxStatus::Running;
        old_running.updated_at = old;

        let mut other_instance = stuck_allocated.clone();
        other_instance.id = MandelboxId::new();
        other_instance.instance_name = "i-2".into();

        for r in [&stuck_allocated, &stuck_connecting, &fresh, &old_running, &other_instance] {
            store.create_mandelbox(r).await.unwrap();
        }

        assert_eq!(store.remove_stale_mandelboxes("i-1").await.unwrap(), 2);
        assert!(store.mandelbox(fresh.id).is_some());
        assert!(store.mandelbox(old_running.id).is_some());
        assert!(store.mandelbox(other_instance.id).is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_updates_capacity() {
        let store = MemoryStateStore::new();
        store.register_instance("i-1", 8).await.unwrap();
        store.heartbeat("i-1", 5).await.unwrap();
        assert_eq!(store.instance("i-1").unwrap().remaining_capacity, 5);
        store.unregister_instance("i-1").await.unwrap();
        assert!(store.instance("i-1").is_none());
    }
}
