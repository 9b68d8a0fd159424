//! File-backed storage for Latchkey.
//!
//! - [`CredentialStore`]: per-location JSON credential files with atomic
//!   rewrites
//! - [`password`]: PBKDF2 hashing compatible with existing files
//! - [`lifetime`]: user lifetime rules and the expiry sweep
//! - [`ExpiredArchive`]: `expired.json`, where expired users wait to be revived
//! - [`AuditLog`]: per-location log of lock actions
//!
//! # Examples
//!
//! ```no_run
//! use latchkey_core::Location;
//! use latchkey_storage::{CredentialStore, password};
//!
//! # fn example() -> latchkey_storage::StorageResult<()> {
//! let store = CredentialStore::new("/var/lib/latchkey");
//! let stored = password::hash_password("hunter2");
//! store.upsert(Location::Workshop, "alice", &stored.hash, &stored.salt)?;
//!
//! let alice = store.get(Location::Workshop, "alice")?.expect("just added");
//! assert!(password::verify("hunter2", &alice.salt, &alice.hash));
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod audit;
pub mod credentials;
pub mod error;
pub mod lifetime;
pub mod models;
pub mod password;
mod persist;

pub use archive::{ArchivedUser, Credentials, ExpiredArchive, archive_expired};
pub use audit::{AuditEntry, AuditLog};
pub use credentials::CredentialStore;
pub use error::{StorageError, StorageResult};
pub use lifetime::{LifetimeRule, Lifetimes, expired_users};
pub use models::{RemoveOutcome, UpsertOutcome, User};
pub use password::PasswordHash;
