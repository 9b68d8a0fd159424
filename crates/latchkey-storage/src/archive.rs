//! Archive of expired users.
//!
//! Expiring a user moves their record out of the location's credential file
//! into `expired.json`, one object keyed by name, so that `revive` can put
//! it back with the same password:
//!
//! ```json
//! {
//!   "alice": { "doors": "1w", "hash": "...", "modified": 1713637154000, "salt": "..." }
//! }
//! ```
//!
//! `doors` lists the location codes the user was expired from. Locations
//! whose credentials differ from the top-level ones keep theirs under
//! `locations`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use latchkey_core::{Config, Location, UserName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::credentials::CredentialStore;
use crate::error::{StorageError, StorageResult};
use crate::lifetime::{Lifetimes, expired_users};
use crate::models::User;
use crate::persist::write_atomically;

/// Hash and salt of one location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub hash: String,
    pub salt: String,
}

/// One archived user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedUser {
    pub hash: String,
    pub salt: String,

    /// When the user was first archived, milliseconds since the Unix epoch.
    #[serde(default)]
    pub modified: i64,

    /// Location codes, e.g. `"1w"`.
    #[serde(default)]
    pub doors: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locations: BTreeMap<String, Credentials>,
}

impl ArchivedUser {
    fn new(user: &User) -> Self {
        Self {
            hash: user.hash.clone(),
            salt: user.salt.clone(),
            modified: Local::now().timestamp_millis(),
            doors: String::new(),
            locations: BTreeMap::new(),
        }
    }

    /// Archived locations in code order; unknown codes are skipped.
    pub fn archived_at(&self) -> Vec<Location> {
        let mut doors: Vec<Location> = self
            .doors
            .chars()
            .filter_map(|code| code.to_string().parse().ok())
            .collect();
        doors.sort();
        doors.dedup();
        doors
    }

    /// Hash and salt to restore at `location`.
    pub fn credentials(&self, location: Location) -> (&str, &str) {
        match self.locations.get(location.code()) {
            Some(creds) => (&creds.hash, &creds.salt),
            None => (&self.hash, &self.salt),
        }
    }

    fn add_door(&mut self, location: Location, user: &User) {
        let code = location.code();
        if !self.doors.contains(code) {
            self.doors.push_str(code);
        }
        if user.hash == self.hash && user.salt == self.salt {
            self.locations.remove(code);
        } else {
            self.locations.insert(
                code.to_string(),
                Credentials {
                    hash: user.hash.clone(),
                    salt: user.salt.clone(),
                },
            );
        }
    }
}

/// `expired.json` in one data directory.
#[derive(Debug)]
pub struct ExpiredArchive {
    path: PathBuf,
    write: Mutex<()>,
}

impl ExpiredArchive {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            path: data_dir
                .as_ref()
                .join(latchkey_core::constants::EXPIRED_FILE),
            write: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All archived users by name. A missing file is an empty archive.
    ///
    /// # Errors
    /// `StorageError::Io` / `Malformed` if the file cannot be read.
    pub fn list(&self) -> StorageResult<BTreeMap<UserName, ArchivedUser>> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(StorageError::io(&self.path, e)),
        };
        if text.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&text).map_err(|e| StorageError::malformed(&self.path, e))
    }

    /// # Errors
    /// Same as [`list`](Self::list), plus `StorageError::Config` for an
    /// invalid name.
    pub fn get(&self, name: &str) -> StorageResult<Option<ArchivedUser>> {
        let name = UserName::new(name)?;
        Ok(self.list()?.remove(&name))
    }

    /// Record that `user` expired at `location`.
    ///
    /// # Errors
    /// `StorageError::Io` if the archive cannot be replaced.
    pub fn archive(&self, location: Location, user: &User) -> StorageResult<()> {
        let _guard = self.write.lock();
        let mut users = self.list()?;
        users
            .entry(user.name.clone())
            .or_insert_with(|| ArchivedUser::new(user))
            .add_door(location, user);
        self.write(&users)
    }

    /// Move `name` back into the credential files of every archived
    /// location, with the archived password.
    ///
    /// Returns the restored locations, or `None` if `name` is not archived.
    /// The archive entry is dropped only after every location was restored.
    ///
    /// # Errors
    /// - `StorageError::Config` for an invalid name
    /// - `StorageError::Io` / `Malformed` from either file
    pub fn revive(
        &self,
        store: &CredentialStore,
        name: &str,
    ) -> StorageResult<Option<Vec<Location>>> {
        let name = UserName::new(name)?;
        let _guard = self.write.lock();
        let mut users = self.list()?;
        let Some(archived) = users.remove(&name) else {
            return Ok(None);
        };

        let doors = archived.archived_at();
        if doors.is_empty() {
            warn!(user = %name, doors = %archived.doors, "archived user has no known location");
        }
        for &location in &doors {
            let (hash, salt) = archived.credentials(location);
            store.upsert(location, name.as_str(), hash, salt)?;
            info!(%location, user = %name, "revived user");
        }

        self.write(&users)?;
        Ok(Some(doors))
    }

    fn write(&self, users: &BTreeMap<UserName, ArchivedUser>) -> StorageResult<()> {
        let text = serde_json::to_string_pretty(users)
            .map_err(|e| StorageError::malformed(&self.path, e))?;
        write_atomically(&self.path, &text)
    }
}

/// Move the users of `location` whose lifetime has run out into the archive.
///
/// Each user is archived before being removed from the credential file, so
/// an interrupted sweep never loses a password.
///
/// # Errors
/// Propagates read and write errors of the files involved.
pub async fn archive_expired(
    store: &CredentialStore,
    audit: &AuditLog,
    lifetimes: &Lifetimes,
    archive: &ExpiredArchive,
    location: Location,
    today: NaiveDate,
) -> StorageResult<Vec<User>> {
    let expired = expired_users(store, audit, lifetimes, location, today).await?;
    for user in &expired {
        archive.archive(location, user)?;
        store.remove(location, user.name.as_str())?;
        info!(%location, user = %user.name, "expired user archived");
    }
    Ok(expired)
}
