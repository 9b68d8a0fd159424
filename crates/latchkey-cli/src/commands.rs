//! Subcommand implementations.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use chrono::{Local, NaiveDate};
use dialoguer::{Input, Password};
use latchkey_core::constants::{
    DEFAULT_CONFIG_FILE, DEFAULT_DATA_DIR, DEFAULT_LIFETIME_KEY, LIFETIMES_FILE,
};
use latchkey_core::{Config, Location, UserName};
use latchkey_engine::LockService;
use latchkey_storage::{
    AuditLog, CredentialStore, ExpiredArchive, LifetimeRule, Lifetimes, RemoveOutcome,
    UpsertOutcome, User, archive_expired, expired_users, password,
};
use tracing::{debug, info, warn};

/// Resolved configuration and data directory for one invocation.
#[derive(Debug)]
pub struct Context {
    config: Option<Config>,
    data_dir: PathBuf,
}

impl Context {
    /// Load the configuration if there is one and pick the data directory.
    ///
    /// An explicit `--config` must exist; the default file is optional.
    /// `--data-dir` wins over the configured directory.
    pub fn new(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> Result<Self> {
        let config = match config_path {
            Some(path) => Some(
                Config::load(&path)
                    .with_context(|| format!("failed to load {}", path.display()))?,
            ),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Some(
                Config::load(DEFAULT_CONFIG_FILE)
                    .with_context(|| format!("failed to load {DEFAULT_CONFIG_FILE}"))?,
            ),
            None => None,
        };

        let data_dir = data_dir
            .or_else(|| config.as_ref().map(|c| c.data_dir.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
        debug!(data_dir = %data_dir.display(), has_config = config.is_some(), "resolved context");

        Ok(Self { config, data_dir })
    }

    fn store(&self) -> CredentialStore {
        CredentialStore::new(&self.data_dir)
    }

    fn audit(&self) -> AuditLog {
        AuditLog::new(&self.data_dir)
    }

    fn archive(&self) -> ExpiredArchive {
        ExpiredArchive::new(&self.data_dir)
    }

    fn lifetimes_path(&self) -> PathBuf {
        self.data_dir.join(LIFETIMES_FILE)
    }

    fn lifetimes(&self) -> Result<Lifetimes> {
        let path = self.lifetimes_path();
        Lifetimes::load(&path).with_context(|| format!("failed to load {}", path.display()))
    }
}

/// Parse location codes, reporting and skipping the unknown ones.
pub fn parse_locations(codes: &[String]) -> Vec<Location> {
    let mut locations = Vec::new();
    for code in codes {
        match code.parse::<Location>() {
            Ok(location) if !locations.contains(&location) => locations.push(location),
            Ok(_) => {}
            Err(e) => eprintln!("{e}, skipped"),
        }
    }
    locations
}

fn require_locations(codes: &[String]) -> Result<Vec<Location>> {
    let locations = parse_locations(codes);
    if locations.is_empty() {
        bail!("no valid location given");
    }
    Ok(locations)
}

fn prompt_name() -> Result<String> {
    Ok(Input::<String>::new()
        .with_prompt("User name")
        .interact_text()?)
}

pub fn add_user(ctx: &Context, codes: &[String]) -> Result<()> {
    let locations = require_locations(codes)?;
    let name = prompt_name()?;
    let secret = Password::new()
        .with_prompt("Password")
        .with_confirmation("Repeat password", "Passwords do not match")
        .interact()?;

    let stored = password::hash_password(&secret);
    let store = ctx.store();
    for location in locations {
        match store.upsert(location, &name, &stored.hash, &stored.salt)? {
            UpsertOutcome::Added => println!("{location}: added {name}"),
            UpsertOutcome::Replaced => println!("{location}: replaced {name}"),
        }
    }
    Ok(())
}

pub fn remove_user(ctx: &Context, codes: &[String]) -> Result<()> {
    let locations = require_locations(codes)?;
    let name = prompt_name()?;

    let store = ctx.store();
    for location in locations {
        match store.remove(location, &name)? {
            RemoveOutcome::Removed => println!("{location}: removed {name}"),
            RemoveOutcome::NotFound => println!("{location}: {name} not present"),
        }
    }
    Ok(())
}

pub fn list_users(ctx: &Context, location: Location) -> Result<()> {
    let users = ctx.store().list(location)?;
    if users.is_empty() {
        println!("{location}: no users");
    }
    for user in users {
        println!("{:<24} {}", user.name.as_str(), user.modified_date());
    }
    Ok(())
}

/// Find the expired users of each location, moving them to the archive
/// when `archive` is given.
pub async fn sweep(
    store: &CredentialStore,
    audit: &AuditLog,
    lifetimes: &Lifetimes,
    archive: Option<&ExpiredArchive>,
    locations: &[Location],
    today: NaiveDate,
) -> Result<Vec<(Location, User)>> {
    let mut found = Vec::new();
    for &location in locations {
        let users = match archive {
            Some(archive) => {
                archive_expired(store, audit, lifetimes, archive, location, today).await?
            }
            None => expired_users(store, audit, lifetimes, location, today).await?,
        };
        found.extend(users.into_iter().map(|user| (location, user)));
    }
    Ok(found)
}

pub async fn expired(ctx: &Context, codes: &[String], archive: bool) -> Result<()> {
    let locations = require_locations(codes)?;
    let today = Local::now().date_naive();
    let expired_archive = ctx.archive();

    let found = sweep(
        &ctx.store(),
        &ctx.audit(),
        &ctx.lifetimes()?,
        archive.then_some(&expired_archive),
        &locations,
        today,
    )
    .await?;

    if found.is_empty() {
        println!("no expired users");
    }
    for (location, user) in found {
        let verb = if archive { "archived" } else { "expired" };
        println!(
            "{location}: {verb} {} (modified {})",
            user.name.as_str(),
            user.modified_date()
        );
    }
    Ok(())
}

pub fn revive(ctx: &Context, name: Option<String>) -> Result<()> {
    let name = match name {
        Some(name) => name,
        None => prompt_name()?,
    };

    match ctx.archive().revive(&ctx.store(), &name)? {
        Some(locations) if locations.is_empty() => {
            println!("{name}: archived without a known location, dropped");
        }
        Some(locations) => {
            for location in locations {
                println!("{location}: revived {name}");
            }
        }
        None => bail!("{name} is not among the expired users"),
    }
    Ok(())
}

/// Store a lifetime rule, warning when it names nobody or is already over.
pub fn set_lifetime(ctx: &Context, name: &str, rule: LifetimeRule) -> Result<()> {
    let name = UserName::new(name)?;
    let mut lifetimes = ctx.lifetimes()?;
    lifetimes.set(name.as_str(), rule);
    let path = ctx.lifetimes_path();
    lifetimes
        .save(&path)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("{name}: lifetime {rule}");

    let store = ctx.store();
    let today = Local::now().date_naive();
    let mut known = false;
    for location in Location::ALL {
        let Some(user) = store.get(location, name.as_str())? else {
            continue;
        };
        known = true;
        // Activity-based rules would need the audit log; the sweep checks those
        if !matches!(rule, LifetimeRule::AfterActivity(_)) && rule.is_expired(&user, None, today) {
            eprintln!("warning: {name} is already expired at {location} under this rule");
        }
    }
    if !known && name.as_str() != DEFAULT_LIFETIME_KEY {
        eprintln!("warning: {name} is not an active user at any location");
    }
    Ok(())
}

pub async fn connect(ctx: &Context, only: Option<Location>, wait_ms: u64) -> Result<()> {
    let Some(config) = &ctx.config else {
        bail!("connect needs a configuration file (--config or {DEFAULT_CONFIG_FILE})");
    };

    let service = LockService::start(config)?;
    let wait = Duration::from_millis(wait_ms);
    let locations: Vec<Location> = service
        .locations()
        .into_iter()
        .filter(|location| only.is_none_or(|l| l == *location))
        .collect();
    if locations.is_empty() {
        service.shutdown().await;
        bail!("no configured lock to connect to");
    }

    for location in locations {
        let Some(connection) = service.connection(location) else {
            continue;
        };
        match connection.ensure_connected(wait).await {
            Ok(()) => println!("{location}: {}", connection.state()),
            Err(e) => {
                warn!(%location, error = %e, "connection failed");
                println!("{location}: {} ({e})", connection.state());
            }
        }
        match service.history(location).await {
            Ok(history) => {
                for transition in history {
                    println!("    {transition} ({:?} ago)", transition.elapsed());
                }
            }
            Err(e) => warn!(%location, error = %e, "no transition history"),
        }
    }

    service.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn codes(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[rstest]
    #[case(&["1", "2", "w"], &[Location::Unit1, Location::Unit2, Location::Workshop])]
    #[case(&["W", "9", "1"], &[Location::Workshop, Location::Unit1])]
    #[case(&["1", "1"], &[Location::Unit1])]
    #[case(&["x"], &[])]
    fn test_parse_locations(#[case] input: &[&str], #[case] expected: &[Location]) {
        assert_eq!(parse_locations(&codes(input)), expected);
    }

    #[test]
    fn test_require_locations_rejects_all_unknown() {
        assert!(require_locations(&codes(&["7", "z"])).is_err());
    }

    #[test]
    fn test_context_prefers_explicit_data_dir() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("latchkey.toml");
        std::fs::write(
            &config,
            r#"
session_secret = "s"
data_dir = "/srv/latchkey"

[[locks]]
location = "1"
[locks.transport]
kind = "mock-success"
"#,
        )
        .unwrap();

        let from_config = Context::new(Some(config.clone()), None).unwrap();
        assert_eq!(from_config.data_dir, PathBuf::from("/srv/latchkey"));

        let overridden = Context::new(Some(config), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(overridden.data_dir, dir.path());
    }

    #[test]
    fn test_context_missing_explicit_config_fails() {
        let dir = TempDir::new().unwrap();
        assert!(Context::new(Some(dir.path().join("absent.toml")), None).is_err());
    }

    #[tokio::test]
    async fn test_sweep_lists_then_archives() {
        let dir = TempDir::new().unwrap();
        let store = CredentialStore::new(dir.path());
        let audit = AuditLog::new(dir.path());
        let archive = ExpiredArchive::new(dir.path());
        let stored = password::hash_password("pw");
        store
            .upsert(Location::Unit1, "alice", &stored.hash, &stored.salt)
            .unwrap();
        store
            .upsert(Location::Unit1, "bob", &stored.hash, &stored.salt)
            .unwrap();

        let lifetimes = Lifetimes::default().with_rule("bob", LifetimeRule::Never);
        let far_future = Local::now().date_naive() + chrono::Days::new(365);
        let locations = [Location::Unit1];

        let listed = sweep(&store, &audit, &lifetimes, None, &locations, far_future)
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].1.name.as_str(), "alice");
        assert_eq!(store.list(Location::Unit1).unwrap().len(), 2);

        sweep(&store, &audit, &lifetimes, Some(&archive), &locations, far_future)
            .await
            .unwrap();
        let remaining = store.list(Location::Unit1).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name.as_str(), "bob");

        let archived = archive.get("alice").unwrap().unwrap();
        assert!(password::verify("pw", &archived.salt, &archived.hash));
    }

    #[test]
    fn test_revive_restores_archived_user() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new(None, Some(dir.path().to_path_buf())).unwrap();
        ctx.store().upsert(Location::Workshop, "alice", "h", "s").unwrap();
        let alice = ctx.store().get(Location::Workshop, "alice").unwrap().unwrap();
        ctx.archive().archive(Location::Workshop, &alice).unwrap();
        ctx.store().remove(Location::Workshop, "alice").unwrap();

        revive(&ctx, Some("Alice".to_string())).unwrap();

        let revived = ctx.store().get(Location::Workshop, "alice").unwrap().unwrap();
        assert_eq!(revived.hash, "h");
        assert!(revive(&ctx, Some("alice".to_string())).is_err());
    }

    #[test]
    fn test_set_lifetime_writes_rule() {
        let dir = TempDir::new().unwrap();
        let ctx = Context::new(None, Some(dir.path().to_path_buf())).unwrap();

        set_lifetime(&ctx, "Bob", LifetimeRule::AfterActivity(10)).unwrap();
        set_lifetime(&ctx, "-default-", LifetimeRule::Never).unwrap();

        let lifetimes = Lifetimes::load(dir.path().join(LIFETIMES_FILE)).unwrap();
        assert_eq!(
            lifetimes.rule_for("bob", Location::Unit2),
            LifetimeRule::AfterActivity(10)
        );
        assert_eq!(lifetimes.default_rule(), LifetimeRule::Never);
    }
}
