//! Controller startup paths: relational, fallback on refusal, fallback on a
//! hanging store, and skipping migration once completed. Also the legacy
//! shape of the snapshot on both backends.

use std::time::{Duration, Instant};

use bot_store::config::{DatabaseTarget, StoreConfig};
use bot_store::controller::{Controller, ControllerState, MigrationSummary};
use bot_store::error::StoreError;
use bot_store::migrate::Migrator;
use bot_store::store::BackendKind;
use serde_json::json;
use tokio::net::TcpListener;

fn config_in(dir: &tempfile::TempDir) -> StoreConfig {
    let mut config = StoreConfig::default();
    config.database.target = DatabaseTarget::Local(dir.path().join("bot.db"));
    config.fallback.legacy_path = dir.path().join("database.json");
    config.migration.backup_dir = dir.path().join("backups");
    config
}

fn write_legacy(config: &StoreConfig) {
    let document = json!({
        "users": {"6281111@s.whatsapp.net": {"name": "Ayu", "exp": 40, "level": 2}},
        "chats": {"1203630001@g.us": {"welcome": true}},
        "settings": {"prefix": "."}
    });
    std::fs::write(&config.fallback.legacy_path, document.to_string()).unwrap();
}

/// A TCP endpoint that accepts connections and never answers.
async fn hanging_listener() -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (port, handle)
}

#[tokio::test]
async fn refused_store_falls_back_to_legacy_data() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.database.target = DatabaseTarget::Remote("http://127.0.0.1:1".into());
    config.database.connect_retries = 2;
    config.database.retry_backoff = Duration::from_millis(10);
    write_legacy(&config);

    let controller = Controller::new(config);
    controller.initialize().await.unwrap();

    let status = controller.status();
    assert_eq!(status.state, ControllerState::Ready);
    assert_eq!(status.backend, Some(BackendKind::FlatFile));
    assert!(status.fallback);
    assert!(status.last_error.is_some());
    assert!(matches!(status.migration, MigrationSummary::Failed { .. }));

    let data = controller.data().await;
    assert!(!data.is_empty());
    assert_eq!(data.users["6281111@s.whatsapp.net"].level, 2);
    drop(data);

    let err = controller.query("SELECT 1", Vec::new()).await.unwrap_err();
    assert!(matches!(err, StoreError::Unavailable { .. }));
}

#[tokio::test]
async fn hanging_store_falls_back_within_budget() {
    let (port, server) = hanging_listener().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.database.target = DatabaseTarget::Remote(format!("http://127.0.0.1:{port}"));
    config.database.connect_timeout = Duration::from_secs(30);
    config.fallback.timeout = Duration::from_millis(400);
    config.migration.enabled = false;
    write_legacy(&config);

    let controller = Controller::new(config);
    let started = Instant::now();
    controller.initialize().await.unwrap();
    let elapsed = started.elapsed();

    assert!(
        elapsed < Duration::from_millis(400) + Duration::from_millis(1500),
        "fallback took {elapsed:?}"
    );
    assert_eq!(controller.backend(), Some(BackendKind::FlatFile));
    assert!(controller.status().last_error.unwrap().contains("budget"));
    assert!(!controller.data().await.users.is_empty());
    server.abort();
}

#[tokio::test]
async fn hanging_store_skips_migration_and_falls_back_within_budget() {
    let (port, server) = hanging_listener().await;
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.database.target = DatabaseTarget::Remote(format!("http://127.0.0.1:{port}"));
    config.database.connect_timeout = Duration::from_secs(30);
    config.fallback.timeout = Duration::from_millis(400);
    write_legacy(&config);

    let controller = Controller::new(config);
    let started = Instant::now();
    controller.initialize().await.unwrap();
    let elapsed = started.elapsed();

    // One check budget plus one fallback timeout, never a second connect.
    assert!(
        elapsed < Duration::from_millis(800) + Duration::from_millis(1500),
        "fallback took {elapsed:?}"
    );
    assert_eq!(controller.backend(), Some(BackendKind::FlatFile));
    assert!(matches!(
        controller.status().migration,
        MigrationSummary::Failed { ref error } if error.contains("migration check")
    ));
    assert!(!controller.data().await.users.is_empty());
    server.abort();
}

#[tokio::test]
async fn completed_marker_skips_migration() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(&dir);
    write_legacy(&config);

    let migrator = Migrator::connect(&config).await.unwrap();
    migrator.run().await.unwrap();
    migrator.close();

    // The legacy file changes after migration; a skipped run must not pick it up.
    std::fs::write(
        &config.fallback.legacy_path,
        json!({"users": {"new@s.whatsapp.net": {}}}).to_string(),
    )
    .unwrap();

    let controller = Controller::new(config);
    controller.initialize().await.unwrap();

    assert!(matches!(
        controller.status().migration,
        MigrationSummary::AlreadyCompleted { .. }
    ));
    assert_eq!(controller.backend(), Some(BackendKind::Relational));
    let data = controller.data().await;
    assert!(data.users.contains_key("6281111@s.whatsapp.net"));
    assert!(!data.users.contains_key("new@s.whatsapp.net"));
    drop(data);
    assert_eq!(std::fs::read_dir(dir.path().join("backups")).unwrap().count(), 1);
}

#[tokio::test]
async fn round_trip_holds_on_both_backends() {
    for fallback in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        config.migration.enabled = false;
        if fallback {
            config.database.target = DatabaseTarget::Remote("http://127.0.0.1:1".into());
            config.database.connect_retries = 1;
        }

        let controller = Controller::new(config);
        controller.initialize().await.unwrap();
        let expected = if fallback {
            BackendKind::FlatFile
        } else {
            BackendKind::Relational
        };
        assert_eq!(controller.backend(), Some(expected));

        {
            let mut data = controller.data_mut().await;
            data.users.insert(
                "6289999@s.whatsapp.net".into(),
                serde_json::from_value(json!({"exp": 7.5, "banned": true, "pet": "fox"})).unwrap(),
            );
            // Overflow keys that happen to share a legacy alias name.
            data.users.insert(
                "6288888@s.whatsapp.net".into(),
                serde_json::from_value(json!({"exp": 3, "xp": 900, "coin": "gold"})).unwrap(),
            );
            data.chats.insert(
                "1203639999@g.us".into(),
                serde_json::from_value(
                    json!({"sBye": "Bye", "antiLink": true, "delete": "never", "byeMessage": 1}),
                )
                .unwrap(),
            );
            data.panel_users.insert(
                "ops".into(),
                serde_json::from_value(
                    json!({"username": "ops", "enabled": "legacy", "passwordHash": "$2b$10$x"}),
                )
                .unwrap(),
            );
            data.settings.insert("maintenance".into(), json!(false));
            data.extensions.insert("bannedWords".into(), json!(["spam"]));
        }

        let written = controller.write().await.unwrap();
        controller.data_mut().await.users.clear();
        let read = controller.read().await.unwrap();
        assert_eq!(read, written, "round trip on {expected}");
        assert_eq!(read.users["6288888@s.whatsapp.net"].extra["xp"], json!(900));
        assert_eq!(read.panel_users["ops"].password, None);
        assert_eq!(read.panel_users["ops"].metadata["passwordHash"], json!("$2b$10$x"));

        controller.close().await;
    }
}

#[tokio::test]
async fn shared_controller_serializes_flushes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.migration.enabled = false;
    let controller = std::sync::Arc::new(Controller::new(config));
    controller.initialize().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let controller = std::sync::Arc::clone(&controller);
        tasks.push(tokio::spawn(async move {
            controller
                .data_mut()
                .await
                .settings
                .insert(format!("k{i}"), json!(i));
            controller.write().await.map(|_| ())
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let read = controller.read().await.unwrap();
    assert_eq!(read.settings.len(), 8);
}

#[tokio::test]
async fn legacy_alias_keys_survive_on_both_backends() {
    for fallback in [false, true] {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(&dir);
        if fallback {
            config.database.target = DatabaseTarget::Remote("http://127.0.0.1:1".into());
            config.database.connect_retries = 1;
        }
        std::fs::write(
            &config.fallback.legacy_path,
            json!({"chats": {"g@g.us": {"antilink": true, "modoadmin": true}}}).to_string(),
        )
        .unwrap();

        let controller = Controller::new(config);
        controller.initialize().await.unwrap();
        assert_eq!(controller.status().fallback, fallback);

        {
            let data = controller.data().await;
            let chat = &data.chats["g@g.us"];
            assert!(chat.anti_link && chat.only_admin);
            assert_eq!(chat.extra["antilink"], json!(true), "fallback={fallback}");
            assert_eq!(chat.extra["modoadmin"], json!(true), "fallback={fallback}");
        }

        controller.data_mut().await.chats.get_mut("g@g.us").unwrap().anti_link = false;
        let written = controller.write().await.unwrap();
        assert_eq!(written.chats["g@g.us"].extra["antilink"], json!(false));

        let read = controller.read().await.unwrap();
        assert!(!read.chats["g@g.us"].anti_link);
        assert_eq!(read.chats["g@g.us"].extra["antilink"], json!(false), "fallback={fallback}");
        assert_eq!(read.chats["g@g.us"].extra["modoadmin"], json!(true), "fallback={fallback}");
        controller.close().await;
    }
}

#[tokio::test]
async fn fallback_write_keeps_records_that_were_not_objects() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.database.target = DatabaseTarget::Remote("http://127.0.0.1:1".into());
    config.database.connect_retries = 1;
    config.migration.enabled = false;
    std::fs::write(
        &config.fallback.legacy_path,
        r#"{"users":{"a@s":{"exp":1},"b@s":null},"chats":{"g@g.us":"oops"}}"#,
    )
    .unwrap();
    let legacy_path = config.fallback.legacy_path.clone();

    let controller = Controller::new(config);
    controller.initialize().await.unwrap();
    assert_eq!(controller.backend(), Some(BackendKind::FlatFile));
    controller.write().await.unwrap();

    let on_disk: serde_json::Value =
        serde_json::from_slice(&std::fs::read(&legacy_path).unwrap()).unwrap();
    let users: Vec<_> = on_disk["users"].as_object().unwrap().keys().cloned().collect();
    assert_eq!(users, vec!["a@s", "b@s"]);
    assert!(on_disk["chats"]["g@g.us"].is_object());

    // The file as it was before repair is kept aside.
    assert_eq!(std::fs::read_dir(dir.path().join("backups")).unwrap().count(), 1);
}
