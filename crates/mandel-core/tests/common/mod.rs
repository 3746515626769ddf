//! Shared fakes for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use mandel_core::resources::{InputDevice, InputDeviceFactory, InputDeviceKind};
use mandel_core::{
    AppEnvironment, HostContext, MemoryStateStore, ServiceConfig, StateStore,
};
use mandel_runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, EventStream, EventStreamError, RuntimeError,
    RuntimeEvent,
};
use mandel_storage::MemoryStore;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

type EventResult = Result<RuntimeEvent, EventStreamError>;

/// Records every call and never touches a real daemon.
#[derive(Default)]
pub struct FakeRuntime {
    pub created: Mutex<Vec<ContainerSpec>>,
    pub started: Mutex<Vec<ContainerId>>,
    pub stopped: Mutex<Vec<ContainerId>>,
    pub removed: Mutex<Vec<ContainerId>>,
    pub fail_start: AtomicBool,
    /// When set, `create` signals `create_entered` and blocks until
    /// `create_release` is notified.
    pub hold_create: AtomicBool,
    pub create_entered: Notify,
    pub create_release: Notify,
    next_id: AtomicU64,
    subscriber: Mutex<Option<mpsc::UnboundedSender<EventResult>>>,
}

impl FakeRuntime {
    /// Push an event to the current subscriber, if any.
    pub fn emit(&self, event: EventResult) -> bool {
        match self.subscriber.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn die(&self, container: &ContainerId) -> bool {
        self.emit(Ok(RuntimeEvent {
            container_id: container.clone(),
            action: "die".into(),
        }))
    }

    pub fn has_subscriber(&self) -> bool {
        self.subscriber.lock().is_some()
    }

    pub fn last_spec(&self) -> ContainerSpec {
        self.created.lock().last().cloned().expect("no container created")
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create(&self, spec: &ContainerSpec) -> mandel_runtime::Result<ContainerId> {
        if self.hold_create.load(Ordering::Relaxed) {
            self.create_entered.notify_one();
            self.create_release.notified().await;
        }
        self.created.lock().push(spec.clone());
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(ContainerId::new(format!("container-{n}")))
    }

    async fn start(&self, id: &ContainerId) -> mandel_runtime::Result<()> {
        if self.fail_start.load(Ordering::Relaxed) {
            return Err(RuntimeError::Start {
                id: id.to_string(),
                reason: "injected failure".into(),
            });
        }
        self.started.lock().push(id.clone());
        Ok(())
    }

    async fn stop(&self, id: &ContainerId, _timeout: Duration) -> mandel_runtime::Result<()> {
        self.stopped.lock().push(id.clone());
        Ok(())
    }

    async fn remove(&self, id: &ContainerId) -> mandel_runtime::Result<()> {
        self.removed.lock().push(id.clone());
        Ok(())
    }

    async fn find_image(&self, patterns: &[String]) -> mandel_runtime::Result<Option<String>> {
        Ok(patterns.first().map(|p| format!("{}:local", p.replace('\\', ""))))
    }

    fn events(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.subscriber.lock() = Some(tx);
        futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })
        .boxed()
    }
}

/// Temp files standing in for kernel uinput devices.
#[derive(Default)]
pub struct FakeInputDevices {
    pub destroyed: AtomicU64,
}

impl InputDeviceFactory for FakeInputDevices {
    fn create(&self, kind: InputDeviceKind) -> mandel_core::Result<InputDevice> {
        Ok(InputDevice {
            kind,
            file: tempfile::tempfile()?,
            event_path: PathBuf::from(format!("/dev/input/fake-{kind:?}")),
        })
    }

    fn destroy(&self, _device: &InputDevice) {
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A host context wired to fakes and scratch directories.
pub struct TestHost {
    pub ctx: Arc<HostContext>,
    pub runtime: Arc<FakeRuntime>,
    pub objects: Arc<MemoryStore>,
    pub store: Arc<MemoryStateStore>,
    pub inputs: Arc<FakeInputDevices>,
    _dir: tempfile::TempDir,
}

impl TestHost {
    pub async fn new(environment: AppEnvironment) -> Self {
        Self::with_config(environment, |_| {}).await
    }

    pub async fn with_config(
        environment: AppEnvironment,
        customize: impl FnOnce(&mut ServiceConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServiceConfig {
            whist_dir: dir.path().join("whist"),
            temp_dir: dir.path().join("temp"),
            environment,
            instance_name: "test-instance".into(),
            handshake_timeout: Duration::from_secs(5),
            app_ready_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        customize(&mut config);

        let runtime = Arc::new(FakeRuntime::default());
        let objects = Arc::new(MemoryStore::new());
        let store = Arc::new(MemoryStateStore::new());
        let inputs = Arc::new(FakeInputDevices::default());
        store
            .register_instance(&config.instance_name, config.mandelbox_capacity)
            .await
            .unwrap();

        let ctx = HostContext::new(
            config,
            runtime.clone(),
            objects.clone(),
            store.clone(),
            inputs.clone(),
        )
        .unwrap();

        Self {
            ctx,
            runtime,
            objects,
            store,
            inputs,
            _dir: dir,
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
