//! Integration tests for the credential store, audit log, expiry sweep and
//! archive working on one data directory.

use chrono::{Local, NaiveDate, TimeZone};
use latchkey_core::{CommandOutcome, Location, LockAction, UserName};
use latchkey_storage::{
    AuditEntry, AuditLog, CredentialStore, ExpiredArchive, LifetimeRule, Lifetimes,
    RemoveOutcome, archive_expired, expired_users, password,
};
use tempfile::TempDir;

fn millis(y: i32, m: u32, d: u32) -> i64 {
    Local
        .with_ymd_and_hms(y, m, d, 12, 0, 0)
        .unwrap()
        .timestamp_millis()
}

#[test]
fn test_reads_files_written_by_existing_tools() {
    let dir = TempDir::new().unwrap();
    let stored = password::hash_password("hunter2");
    let file = format!(
        r#"[
  {{
    "name": "alice",
    "hash": "{}",
    "salt": "{}",
    "modified": 1700000000000
  }}
]"#,
        stored.hash, stored.salt
    );
    std::fs::write(dir.path().join("users-werkstatt.json"), file).unwrap();

    let store = CredentialStore::new(dir.path());
    let alice = store.get(Location::Workshop, "Alice").unwrap().unwrap();

    assert!(password::verify("hunter2", &alice.salt, &alice.hash));
    assert_eq!(alice.modified, 1_700_000_000_000);
}

#[test]
fn test_legacy_file_with_spaced_name_stays_usable() {
    let dir = TempDir::new().unwrap();
    let stored = password::hash_password("pw");
    let file = serde_json::json!([
        { "name": "alice", "hash": stored.hash, "salt": stored.salt, "modified": 1_700_000_000_000_i64 },
        { "name": "max mustermann", "hash": "h", "salt": "s", "modified": 1_700_000_000_000_i64 },
    ]);
    std::fs::write(dir.path().join("users.json"), file.to_string()).unwrap();

    let store = CredentialStore::new(dir.path());
    let alice = store.get(Location::Unit1, "alice").unwrap().unwrap();
    assert!(password::verify("pw", &alice.salt, &alice.hash));
    assert_eq!(
        store.get(Location::Unit1, "Max Mustermann").unwrap().unwrap().hash,
        "h"
    );

    assert_eq!(
        store.remove(Location::Unit1, "max mustermann").unwrap(),
        RemoveOutcome::Removed
    );
    assert_eq!(store.list(Location::Unit1).unwrap().len(), 1);
}

/// Three users at `location`, all last modified in January 2024.
async fn backdated_store(dir: &TempDir, location: Location) -> (CredentialStore, AuditLog) {
    let store = CredentialStore::new(dir.path());
    let audit = AuditLog::new(dir.path());

    for name in ["stale", "active", "forever"] {
        store.upsert(location, name, &format!("hash-{name}"), "s").unwrap();
    }

    let path = store.path(location);
    let text = std::fs::read_to_string(&path).unwrap();
    let mut users: serde_json::Value = serde_json::from_str(&text).unwrap();
    for user in users.as_array_mut().unwrap() {
        user["modified"] = millis(2024, 1, 1).into();
    }
    std::fs::write(&path, serde_json::to_string_pretty(&users).unwrap()).unwrap();

    let mut entry = AuditEntry::new(
        UserName::new("active").unwrap(),
        LockAction::Open,
        "r1",
        CommandOutcome::Succeeded,
    );
    entry.at = Local.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
    audit.append(location, &entry).await.unwrap();

    (store, audit)
}

fn sweep_rules() -> Lifetimes {
    Lifetimes::default()
        .with_rule("active", LifetimeRule::AfterActivity(30))
        .with_rule("forever", LifetimeRule::Never)
}

#[tokio::test]
async fn test_expiry_sweep_lists_expired_users() {
    let dir = TempDir::new().unwrap();
    let (store, audit) = backdated_store(&dir, Location::Unit1).await;
    let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

    let expired = expired_users(&store, &audit, &sweep_rules(), Location::Unit1, today)
        .await
        .unwrap();
    let names: Vec<_> = expired.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, ["stale"]);
    assert_eq!(store.list(Location::Unit1).unwrap().len(), 3);
}

#[tokio::test]
async fn test_expired_users_are_archived_then_revived() {
    let dir = TempDir::new().unwrap();
    let (store, audit) = backdated_store(&dir, Location::Workshop).await;
    let archive = ExpiredArchive::new(dir.path());
    let today = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();

    let archived = archive_expired(
        &store,
        &audit,
        &sweep_rules(),
        &archive,
        Location::Workshop,
        today,
    )
    .await
    .unwrap();
    assert_eq!(archived.len(), 1);
    assert_eq!(store.get(Location::Workshop, "stale").unwrap(), None);
    assert_eq!(store.list(Location::Workshop).unwrap().len(), 2);

    let entry = archive.get("stale").unwrap().unwrap();
    assert_eq!(entry.archived_at(), [Location::Workshop]);
    assert_eq!(entry.hash, "hash-stale");

    assert_eq!(
        archive.revive(&store, "stale").unwrap(),
        Some(vec![Location::Workshop])
    );
    let revived = store.get(Location::Workshop, "stale").unwrap().unwrap();
    assert_eq!(revived.hash, "hash-stale");
    assert!(revived.modified > millis(2024, 1, 1));
    assert_eq!(archive.get("stale").unwrap(), None);
    assert_eq!(archive.revive(&store, "stale").unwrap(), None);
}

#[test]
fn test_lifetime_rules_survive_save_and_load() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lifetimes.json");
    std::fs::write(&path, r#"{ "bob": { "1": "2024-05-01", "w": "10d" } }"#).unwrap();

    let mut lifetimes = Lifetimes::load(&path).unwrap();
    lifetimes.set("Alice", LifetimeRule::AfterActivity(10));
    lifetimes.set("-default-", LifetimeRule::AfterModified(60));
    lifetimes.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("{\n  \"-default-\": \"60d\",\n  \"alice\": \"+10d\""));

    let reloaded = Lifetimes::load(&path).unwrap();
    assert_eq!(reloaded, lifetimes);
    assert_eq!(
        reloaded.rule_for("bob", Location::Workshop),
        LifetimeRule::AfterModified(10)
    );
}
