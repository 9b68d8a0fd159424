//! End-to-end tests of the lock service over the mock transports.

use std::time::Duration;

use latchkey_core::{CommandOutcome, Config, ConnectionState, Location};
use latchkey_engine::{AuthError, LockService, ServiceError};
use latchkey_storage::{CredentialStore, password};
use latchkey_transport::TransportError;
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(5);

fn config(dir: &TempDir) -> Config {
    let text = format!(
        r#"
session_secret = "integration"
data_dir = "{}"

[timeouts]
connect_ms = 500
command_ms = 500
connect_wait_ms = 300

[backoff]
initial_ms = 20
max_ms = 100

[[locks]]
location = "1"
[locks.transport]
kind = "mock-success"

[[locks]]
location = "2"
auto_connect = false
[locks.transport]
kind = "mock-disconnected"

[[locks]]
location = "w"
[locks.transport]
kind = "mock-fault"
"#,
        dir.path().display()
    );
    Config::from_toml_str(&text).unwrap()
}

fn add_user(config: &Config, location: Location, name: &str, pw: &str) {
    let stored = password::hash_password(pw);
    CredentialStore::from_config(config)
        .upsert(location, name, &stored.hash, &stored.salt)
        .unwrap();
}

async fn wait_connected(service: &LockService, location: Location) {
    let mut state = service.connection(location).unwrap().subscribe();
    tokio::time::timeout(WAIT, state.wait_for(ConnectionState::is_ready))
        .await
        .expect("lock never connected")
        .unwrap();
}

#[tokio::test]
async fn test_login_open_close_logout() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    add_user(&config, Location::Unit1, "alice", "hunter2");
    let service = LockService::start(&config).unwrap();

    assert_eq!(
        service.locations(),
        [Location::Unit1, Location::Unit2, Location::Workshop]
    );

    let session = service
        .login(Location::Unit1, "alice", "hunter2")
        .await
        .unwrap();
    wait_connected(&service, Location::Unit1).await;

    let status = service.get_status(&session.token).unwrap();
    assert_eq!(status.user.as_str(), "alice");
    assert_eq!(status.state, ConnectionState::Connected);

    let open = service.open_lock(&session.token).await.unwrap();
    assert_eq!(open.outcome(), CommandOutcome::Succeeded);
    let close = service.close_lock(&session.token).await.unwrap();
    assert_eq!(close.outcome(), CommandOutcome::Succeeded);

    let audit = std::fs::read_to_string(config.audit_path(Location::Unit1)).unwrap();
    assert_eq!(audit.lines().count(), 2);

    service.logout(&session.token);
    assert!(matches!(
        service.open_lock(&session.token).await,
        Err(ServiceError::Auth(AuthError::InvalidSession))
    ));

    service.shutdown().await;
}

#[tokio::test]
async fn test_fault_lock_connects_but_fails_actuation() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    add_user(&config, Location::Workshop, "bob", "pw");
    let service = LockService::start(&config).unwrap();
    let session = service.login(Location::Workshop, "bob", "pw").await.unwrap();

    let report = service.open_lock(&session.token).await.unwrap();

    assert!(matches!(
        report.result,
        Err(TransportError::DeviceFault { .. })
    ));
    assert_eq!(report.state, ConnectionState::Connected);
    assert_eq!(
        service.state(Location::Workshop),
        Some(ConnectionState::Connected)
    );

    service.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_lock_never_connects() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    add_user(&config, Location::Unit2, "carol", "pw");
    let service = LockService::start(&config).unwrap();
    let session = service.login(Location::Unit2, "carol", "pw").await.unwrap();

    assert_eq!(
        service.get_status(&session.token).unwrap().state,
        ConnectionState::Disconnected
    );

    let result = service.open_lock(&session.token).await;
    assert!(matches!(
        result,
        Err(ServiceError::Transport(TransportError::Timeout { duration_ms: 300 }))
    ));

    let history = service.history(Location::Unit2).await.unwrap();
    assert!(!history.is_empty());
    assert!(history.iter().all(|t| t.to != ConnectionState::Connected));

    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_disconnects_every_lock() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let service = LockService::start(&config).unwrap();
    wait_connected(&service, Location::Unit1).await;

    let handles: Vec<_> = service
        .locations()
        .into_iter()
        .filter_map(|location| service.connection(location).cloned())
        .collect();
    service.shutdown().await;

    for handle in handles {
        assert_eq!(handle.state(), ConnectionState::Disconnected);
    }
}

#[tokio::test]
async fn test_same_name_in_two_locations_is_independent() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    add_user(&config, Location::Unit1, "dave", "one");
    add_user(&config, Location::Workshop, "dave", "two");
    let service = LockService::start(&config).unwrap();

    assert!(service.login(Location::Unit1, "dave", "one").await.is_ok());
    assert_eq!(
        service.login(Location::Unit1, "dave", "two").await,
        Err(AuthError::InvalidCredentials)
    );
    assert!(service.login(Location::Workshop, "dave", "two").await.is_ok());

    service.shutdown().await;
}

#[tokio::test]
async fn test_login_next_to_spaced_legacy_name() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let alice = password::hash_password("pw");
    let max = password::hash_password("secret");
    let file = serde_json::json!([
        { "name": "alice", "hash": alice.hash, "salt": alice.salt, "modified": 1_700_000_000_000_i64 },
        { "name": "Max Mustermann", "hash": max.hash, "salt": max.salt, "modified": 1_700_000_000_000_i64 },
    ]);
    std::fs::write(config.users_path(Location::Unit1), file.to_string()).unwrap();
    let service = LockService::start(&config).unwrap();

    assert!(service.login(Location::Unit1, "alice", "pw").await.is_ok());
    let session = service
        .login(Location::Unit1, "max mustermann", "secret")
        .await
        .unwrap();
    assert_eq!(session.user.as_str(), "max mustermann");

    service.shutdown().await;
}
