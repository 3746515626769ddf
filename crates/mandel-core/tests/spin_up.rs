//! Spin-up and teardown scenarios against fake adapters.

mod common;

use common::{eventually, TestHost};
use mandel_core::configutils::{gzip_deflate_string, BROWSER_DATA_FILENAME};
use mandel_core::{
    finish_spin_up, start_spin_up, AppEnvironment, AppName, ConfigEncryptionToken, CoreError,
    HandshakeRequest, JsonTransportRequest, MandelboxId, MandelboxStatus, SessionId, UserId,
    ENCRYPTED_ARCHIVE_FILENAME,
};
use mandel_runtime::Protocol;
use std::sync::atomic::Ordering;
use std::time::Duration;

const TOKEN: &str = "a-config-token-of-reasonable-length";

fn chrome() -> AppName {
    AppName::new("browsers/chrome")
}

fn handshake(id: MandelboxId, is_new_token: bool) -> JsonTransportRequest {
    JsonTransportRequest {
        mandelbox_id: id,
        config_encryption_token: ConfigEncryptionToken::new(TOKEN),
        is_new_config_encryption_token: is_new_token,
        json_data: gzip_deflate_string(r#"{"dark_mode":true}"#).unwrap(),
        extensions: "ext_a,ext_b".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_phase_one_leaves_mandelbox_waiting() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let id = MandelboxId::new();

    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();
    assert_eq!(mandelbox.status(), MandelboxStatus::Waiting);
    assert_eq!(host.store.mandelbox(id).unwrap().status, MandelboxStatus::Waiting);
    assert_eq!(host.ctx.remaining_capacity(), host.ctx.config().mandelbox_capacity - 1);

    let tty = mandelbox.tty().unwrap();
    assert!(host.ctx.config().tty_range.contains(&tty.get()));
    let bindings = mandelbox.port_bindings();
    assert_eq!(bindings.len(), 4);
    assert!(bindings
        .iter()
        .all(|b| host.ctx.config().port_range.contains(&b.host_port)));

    let spec = host.runtime.last_spec();
    assert_eq!(spec.name, format!("browsers-chrome-{id}"));
    assert_eq!(spec.image, "browsers/chrome:current-build:local");
    assert_eq!(spec.devices.len(), 4);
    assert_eq!(spec.env["WHIST_AES_KEY"], mandelbox.session_key().as_str());
    assert_eq!(spec.env["KIOSK_MODE"], "false");
    assert_eq!(spec.env["LOAD_EXTENSION"], "true");
    assert_eq!(spec.env["LOCAL_CLIENT"], "false");
    assert!(!spec.env.contains_key("NVIDIA_VISIBLE_DEVICES"));
    assert_eq!(spec.cap_drop, vec!["ALL".to_string()]);
    assert_eq!(spec.cap_add.len(), 16);
    assert!(spec.tty);
    assert_eq!(host.runtime.started.lock().len(), 1);

    let dir = mandelbox.mappings().dir().to_path_buf();
    let identifying = bindings
        .iter()
        .find(|b| b.container_port == 32262 && b.protocol == Protocol::Tcp)
        .unwrap();
    let read = |name: &str| std::fs::read_to_string(dir.join(name)).unwrap();
    assert_eq!(read("hostPort_for_my_32262_tcp"), identifying.host_port.to_string());
    assert_eq!(read("tty"), tty.to_string());
    assert_eq!(read("gpu_index"), "0");
    assert_eq!(read("timeout"), "-1");
    assert_eq!(read("session_id").len(), 40);
    assert!(!dir.join(".paramsReady").exists());

    mandelbox.close();
    mandelbox.closed().await;
}

#[tokio::test]
async fn test_close_releases_everything() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let id = MandelboxId::new();
    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();
    let container = mandelbox.container_id().unwrap();
    let mandelbox_dir = host.ctx.config().mandelbox_dir(id);
    assert!(mandelbox_dir.exists());

    mandelbox.close();
    mandelbox.close();
    mandelbox.closed().await;
    mandelbox.close();

    assert_eq!(mandelbox.status(), MandelboxStatus::Dying);
    assert!(host.ctx.registry().is_empty());
    assert_eq!(host.ctx.pools().tty.in_use(), 0);
    assert_eq!(host.ctx.pools().ports.in_use(), 0);
    assert!(
        eventually(Duration::from_secs(2), || host.inputs.destroyed.load(Ordering::Relaxed) == 3)
            .await
    );
    assert_eq!(*host.runtime.removed.lock(), vec![container]);
    assert!(!mandelbox_dir.exists());
    assert!(host.store.mandelbox(id).is_none());
    assert!(host.objects.is_empty());
    assert_eq!(host.ctx.remaining_capacity(), host.ctx.config().mandelbox_capacity);
}

#[tokio::test]
async fn test_failed_start_rolls_back() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    host.runtime.fail_start.store(true, Ordering::Relaxed);

    let err = start_spin_up(&host.ctx, MandelboxId::new(), chrome())
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Runtime(_)));
    assert!(host.ctx.registry().is_empty());
    assert_eq!(host.ctx.pools().tty.in_use(), 0);
    assert_eq!(host.ctx.pools().ports.in_use(), 0);
    assert_eq!(host.runtime.removed.lock().len(), 1);
    assert_eq!(host.store.mandelbox_count(), 0);
}

#[tokio::test]
async fn test_close_during_create_removes_container() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    host.runtime.hold_create.store(true, Ordering::Relaxed);
    let id = MandelboxId::new();

    let ctx = host.ctx.clone();
    let spin_up = tokio::spawn(async move { start_spin_up(&ctx, id, chrome()).await });
    host.runtime.create_entered.notified().await;

    let mandelbox = host.ctx.registry().lookup(id).unwrap();
    mandelbox.close();
    host.runtime.create_release.notify_one();

    let err = spin_up.await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::Cancelled(_)), "{err:?}");
    mandelbox.closed().await;

    assert_eq!(host.runtime.created.lock().len(), 1);
    assert_eq!(host.runtime.removed.lock().len(), 1);
    assert!(host.runtime.started.lock().is_empty());
    assert!(host.ctx.registry().is_empty());
    assert_eq!(host.ctx.pools().tty.in_use(), 0);
    assert_eq!(host.ctx.pools().ports.in_use(), 0);
    assert_eq!(host.store.mandelbox_count(), 0);
}

#[tokio::test]
async fn test_concurrent_close_tears_down_once() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let mandelbox = start_spin_up(&host.ctx, MandelboxId::new(), chrome())
        .await
        .unwrap();

    let closers: Vec<_> = (0..8)
        .map(|_| {
            let mandelbox = mandelbox.clone();
            tokio::spawn(async move {
                mandelbox.close();
                mandelbox.closed().await;
            })
        })
        .collect();
    host.ctx.shutdown_token().cancel();
    for closer in closers {
        closer.await.unwrap();
    }

    assert_eq!(host.runtime.removed.lock().len(), 1);
    assert_eq!(host.ctx.pools().tty.in_use(), 0);
    assert!(host.ctx.registry().is_empty());
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let id = MandelboxId::new();
    let first = start_spin_up(&host.ctx, id, chrome()).await.unwrap();

    let err = start_spin_up(&host.ctx, id, chrome()).await.unwrap_err();
    assert!(matches!(err, CoreError::AlreadyExists(_)));
    assert_eq!(first.status(), MandelboxStatus::Waiting);
    assert_eq!(host.ctx.registry().len(), 1);

    first.close();
    first.closed().await;
}

#[tokio::test]
async fn test_phase_two_happy_path() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let id = MandelboxId::new();
    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();

    let assignment = host
        .store
        .allocate(
            "test-instance",
            &chrome(),
            UserId::new("user-1"),
            SessionId::new("1700000000000"),
        )
        .unwrap();
    assert_eq!(assignment.mandelbox_id, id);

    let ctx = host.ctx.clone();
    let finish = tokio::spawn(async move { finish_spin_up(&ctx, assignment).await });

    let (request, reply) = HandshakeRequest::new(handshake(id, true));
    host.ctx.handshakes().deliver(request).unwrap();

    let result = reply.await.unwrap().unwrap();
    assert_eq!(finish.await.unwrap().unwrap(), result);

    let port_of = |port: u16, protocol: Protocol| {
        mandelbox
            .port_bindings()
            .iter()
            .find(|b| b.container_port == port && b.protocol == protocol)
            .unwrap()
            .host_port
    };
    assert_eq!(result.port_32261, port_of(32261, Protocol::Tcp));
    assert_eq!(result.port_32263, port_of(32263, Protocol::Udp));
    assert_eq!(result.aes_key, mandelbox.session_key().as_str());

    assert_eq!(mandelbox.status(), MandelboxStatus::Running);
    assert!(mandelbox.is_connected());
    assert_eq!(host.store.mandelbox(id).unwrap().status, MandelboxStatus::Running);
    assert!(host.ctx.handshakes().is_empty());

    let dir = mandelbox.mappings().dir().to_path_buf();
    assert_eq!(
        std::fs::read_to_string(dir.join("config.json")).unwrap(),
        r#"{"dark_mode":true}"#
    );
    assert_eq!(std::fs::read_to_string(dir.join("session_id")).unwrap(), "1700000000000");
    assert!(dir.join(".paramsReady").exists());
    assert!(dir.join(".configReady").exists());
    let browser_data =
        std::fs::read_to_string(mandelbox.unpacked_config_dir().join(BROWSER_DATA_FILENAME))
            .unwrap();
    assert!(browser_data.contains("ext_a,ext_b"));

    mandelbox.close();
    mandelbox.closed().await;

    let key = format!(
        "user-1/localdevwithdb/browsers/chrome/{}/{}",
        ConfigEncryptionToken::new(TOKEN).hash(),
        ENCRYPTED_ARCHIVE_FILENAME
    );
    assert_eq!(host.objects.keys(), vec![key]);
}

#[tokio::test]
async fn test_short_token_is_never_backed_up() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let id = MandelboxId::new();
    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();
    let assignment = host
        .store
        .allocate("test-instance", &chrome(), UserId::new("user-1"), SessionId::new("1"))
        .unwrap();

    let ctx = host.ctx.clone();
    let finish = tokio::spawn(async move { finish_spin_up(&ctx, assignment).await });
    let short = JsonTransportRequest {
        config_encryption_token: ConfigEncryptionToken::new("too-short"),
        ..handshake(id, false)
    };
    let (request, reply) = HandshakeRequest::new(short);
    host.ctx.handshakes().deliver(request).unwrap();
    reply.await.unwrap().unwrap();
    finish.await.unwrap().unwrap();

    assert!(mandelbox.is_connected());
    assert!(mandelbox.config_token().is_empty());

    mandelbox.close();
    mandelbox.closed().await;
    assert!(host.objects.is_empty());
}

#[tokio::test]
async fn test_handshake_timeout_closes_without_backup() {
    let host = TestHost::with_config(AppEnvironment::LocalDevWithDb, |c| {
        c.handshake_timeout = Duration::from_millis(200);
    })
    .await;
    let id = MandelboxId::new();
    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();
    let assignment = host
        .store
        .allocate("test-instance", &chrome(), UserId::new("user-1"), SessionId::new("1"))
        .unwrap();

    let err = finish_spin_up(&host.ctx, assignment).await.unwrap_err();
    assert!(matches!(err, CoreError::HandshakeTimeout(_)));
    assert!(!mandelbox.is_connected());

    mandelbox.closed().await;
    assert!(host.ctx.registry().is_empty());
    assert!(host.objects.is_empty());
    assert!(host.store.mandelbox(id).is_none());
}

#[tokio::test]
async fn test_unverified_assignment_leaves_mandelbox_alone() {
    let host = TestHost::new(AppEnvironment::LocalDevWithDb).await;
    let id = MandelboxId::new();
    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();

    let forged = mandel_core::MandelboxAssignment {
        mandelbox_id: id,
        user_id: UserId::new("intruder"),
        session_id: SessionId::new("1"),
        app_name: chrome(),
        instance_name: "test-instance".into(),
    };
    assert!(finish_spin_up(&host.ctx, forged).await.is_err());
    assert!(!mandelbox.is_closing());
    assert_eq!(mandelbox.status(), MandelboxStatus::Waiting);

    mandelbox.close();
    mandelbox.closed().await;
}

#[tokio::test]
async fn test_deployed_environment_waits_for_app() {
    let host = TestHost::with_config(AppEnvironment::Dev, |c| {
        c.app_ready_timeout = Duration::from_secs(5);
    })
    .await;
    let id = MandelboxId::new();
    let mandelbox = start_spin_up(&host.ctx, id, chrome()).await.unwrap();
    assert_eq!(
        host.runtime.last_spec().image,
        "ghcr.io/whisthq/dev/browsers/chrome:current-build"
    );
    assert_eq!(
        std::fs::read_to_string(mandelbox.mappings().dir().join("timeout")).unwrap(),
        "30"
    );

    let assignment = host
        .store
        .allocate("test-instance", &chrome(), UserId::new("user-2"), SessionId::new("42"))
        .unwrap();
    let ctx = host.ctx.clone();
    let finish = tokio::spawn(async move { finish_spin_up(&ctx, assignment).await });

    let (request, reply) = HandshakeRequest::new(handshake(id, true));
    host.ctx.handshakes().deliver(request).unwrap();

    let dir = mandelbox.mappings().dir().to_path_buf();
    assert!(eventually(Duration::from_secs(5), || dir.join(".configReady").exists()).await);
    assert_eq!(mandelbox.status(), MandelboxStatus::Connecting);
    std::fs::write(dir.join("done_sleeping_until_X_clients"), b"").unwrap();

    assert!(reply.await.unwrap().is_ok());
    assert!(finish.await.unwrap().is_ok());
    assert_eq!(mandelbox.status(), MandelboxStatus::Running);

    mandelbox.close();
    mandelbox.closed().await;
}
