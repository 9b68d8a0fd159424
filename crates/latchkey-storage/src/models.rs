//! Records kept in the per-location credential files.

use chrono::{DateTime, Datelike, Local, NaiveDate, TimeZone};
use latchkey_core::UserName;
use serde::{Deserialize, Serialize};

/// One user of one location.
///
/// Serialized exactly as the credential files store it:
///
/// ```json
/// { "name": "alice", "hash": "...", "salt": "...", "modified": 1700000000000 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub name: UserName,

    /// Base64 PBKDF2 output.
    pub hash: String,

    /// Base64 salt text, used verbatim as the PBKDF2 salt.
    pub salt: String,

    /// Last change, milliseconds since the Unix epoch.
    #[serde(default)]
    pub modified: i64,
}

impl User {
    pub fn new(name: UserName, hash: impl Into<String>, salt: impl Into<String>) -> Self {
        Self {
            name,
            hash: hash.into(),
            salt: salt.into(),
            modified: Local::now().timestamp_millis(),
        }
    }

    /// Local date of the last change.
    ///
    /// Older tools wrote seconds instead of milliseconds; a value that reads
    /// as a date before 2000 in milliseconds is taken as seconds.
    pub fn modified_date(&self) -> NaiveDate {
        let as_millis = Local.timestamp_millis_opt(self.modified).single();
        match as_millis {
            Some(date) if date.year() >= 2000 => date.date_naive(),
            _ => Local
                .timestamp_opt(self.modified, 0)
                .single()
                .map(|date: DateTime<Local>| date.date_naive())
                .unwrap_or_default(),
        }
    }
}

/// Result of [`CredentialStore::upsert`](crate::CredentialStore::upsert).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Added,
    Replaced,
}

/// Result of [`CredentialStore::remove`](crate::CredentialStore::remove).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Removed,
    NotFound,
}
