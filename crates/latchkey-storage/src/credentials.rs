//! File-backed, per-location credential store.
//!
//! Each location has one JSON file holding an ordered array of [`User`]
//! records. There is no cache: every call reads the file as it is on disk.
//! Mutations read the whole file, apply the change in memory and replace
//! the file atomically (temp file in the same directory, fsync, rename), so
//! a crash mid-write leaves the previous contents intact.

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Path, PathBuf};
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use latchkey_core::{Config, Location, UserName};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};
use crate::models::{RemoveOutcome, UpsertOutcome, User};
use crate::persist::write_atomically;

/// Credential store for all locations under one data directory.
///
/// Writers to the same location are serialized; readers never wait.
#[derive(Debug)]
pub struct CredentialStore {
    data_dir: PathBuf,
    write_locks: HashMap<Location, Mutex<()>>,
    #[cfg(test)]
    inject_write_failure: AtomicBool,
}

impl CredentialStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            write_locks: Location::ALL
                .iter()
                .map(|location| (*location, Mutex::new(())))
                .collect(),
            #[cfg(test)]
            inject_write_failure: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the credential file for `location`.
    pub fn path(&self, location: Location) -> PathBuf {
        self.data_dir.join(location.users_file())
    }

    /// Look up one user.
    ///
    /// Returns `Ok(None)` when the name is not present.
    ///
    /// # Errors
    /// - `StorageError::Config` if the name is invalid
    /// - `StorageError::Io` / `Malformed` if the file cannot be read
    pub fn get(&self, location: Location, name: &str) -> StorageResult<Option<User>> {
        let name = UserName::new(name)?;
        let users = self.read(location)?;
        Ok(users.into_iter().find(|user| user.name == name))
    }

    /// All users of `location` in file order.
    ///
    /// # Errors
    /// Returns `StorageError::Io` / `Malformed` if the file cannot be read.
    pub fn list(&self, location: Location) -> StorageResult<Vec<User>> {
        self.read(location)
    }

    /// Add a user, or replace an existing one with the same name.
    ///
    /// Replacing is deliberate self-service behavior and only logged. The
    /// record moves to the end of the file either way.
    ///
    /// # Errors
    /// - `StorageError::Config` if the name is invalid
    /// - `StorageError::Io` if the file cannot be replaced; the previous
    ///   contents stay on disk
    pub fn upsert(
        &self,
        location: Location,
        name: &str,
        hash: &str,
        salt: &str,
    ) -> StorageResult<UpsertOutcome> {
        let name = UserName::new(name)?;

        self.mutate(location, |users| {
            let outcome = if drop_named(users, &name) > 0 {
                warn!(%location, user = %name, "overwriting already existing user");
                UpsertOutcome::Replaced
            } else {
                info!(%location, user = %name, "adding user");
                UpsertOutcome::Added
            };
            users.push(User::new(name.clone(), hash, salt));
            Some(outcome)
        })
        .map(|outcome| outcome.unwrap_or(UpsertOutcome::Added))
    }

    /// Remove a user. A missing name leaves the file untouched.
    ///
    /// # Errors
    /// Same as [`upsert`](Self::upsert).
    pub fn remove(&self, location: Location, name: &str) -> StorageResult<RemoveOutcome> {
        let name = UserName::new(name)?;

        let removed = self.mutate(location, |users| {
            (drop_named(users, &name) > 0).then_some(())
        })?;

        match removed {
            Some(()) => {
                info!(%location, user = %name, "removed user");
                Ok(RemoveOutcome::Removed)
            }
            None => {
                debug!(%location, user = %name, "user not present");
                Ok(RemoveOutcome::NotFound)
            }
        }
    }

    /// Read-modify-write under the location's write lock.
    ///
    /// `apply` returns `None` to signal "nothing changed", in which case
    /// the file is not rewritten.
    fn mutate<T>(
        &self,
        location: Location,
        apply: impl FnOnce(&mut Vec<User>) -> Option<T>,
    ) -> StorageResult<Option<T>> {
        let _guard = self.write_locks.get(&location).map(|lock| lock.lock());

        let mut users = self.read(location)?;
        let Some(result) = apply(&mut users) else {
            return Ok(None);
        };
        self.write(location, &users)?;
        Ok(Some(result))
    }

    fn read(&self, location: Location) -> StorageResult<Vec<User>> {
        let path = self.path(location);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let users: Vec<User> =
            serde_json::from_str(&text).map_err(|e| StorageError::malformed(&path, e))?;

        // Older tools did not trim names, so `alice ` and `alice` can both be
        // on disk. The first one wins, as it did for lookups there.
        let mut seen = HashSet::new();
        Ok(users
            .into_iter()
            .filter(|user| {
                let first = seen.insert(user.name.clone());
                if !first {
                    warn!(%location, user = %user.name, "ignoring duplicate user record");
                }
                first
            })
            .collect())
    }

    fn write(&self, location: Location, users: &[User]) -> StorageResult<()> {
        let path = self.path(location);
        let text = serde_json::to_string_pretty(users)
            .map_err(|e| StorageError::malformed(&path, e))?;

        #[cfg(test)]
        if self.inject_write_failure.swap(false, Ordering::SeqCst) {
            return Err(StorageError::io(
                &path,
                io::Error::other("injected write failure"),
            ));
        }

        write_atomically(&path, &text)?;
        debug!(%location, users = users.len(), "credential file written");
        Ok(())
    }

    /// Make the next write fail before the file is replaced.
    #[cfg(test)]
    pub(crate) fn fail_next_write(&self) {
        self.inject_write_failure.store(true, Ordering::SeqCst);
    }
}

/// Drop every record named `name`, returning how many there were.
fn drop_named(users: &mut Vec<User>, name: &UserName) -> usize {
    let before = users.len();
    users.retain(|user| user.name != *name);
    before - users.len()
}
