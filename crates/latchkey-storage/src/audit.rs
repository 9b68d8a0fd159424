//! Per-location audit log of lock actions.
//!
//! One line per open or close that reached the transport:
//!
//! ```text
//! 20/04/2024 21:12:04 alice open 5f0c...e1 succeeded
//! 20/04/2024 21:13:10 bob close 9a41...07 failed: Device fault: jammed
//! ```

use std::path::PathBuf;

use chrono::{DateTime, Local, NaiveDate};
use latchkey_core::constants::{AUDIT_DATE_FORMAT, AUDIT_TIMESTAMP_FORMAT};
use latchkey_core::{CommandOutcome, Config, Location, LockAction, UserName};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// One audited lock action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub at: DateTime<Local>,
    pub user: UserName,
    pub action: LockAction,
    pub request_id: String,
    pub outcome: CommandOutcome,
}

impl AuditEntry {
    pub fn new(
        user: UserName,
        action: LockAction,
        request_id: impl Into<String>,
        outcome: CommandOutcome,
    ) -> Self {
        Self {
            at: Local::now(),
            user,
            action,
            request_id: request_id.into(),
            outcome,
        }
    }

    /// The log line, without terminator.
    pub fn to_line(&self) -> String {
        format!(
            "{} {} {} {} {}",
            self.at.format(AUDIT_TIMESTAMP_FORMAT),
            self.user,
            self.action,
            self.request_id,
            self.outcome
        )
    }
}

/// Append-only audit logs under one data directory.
#[derive(Debug)]
pub struct AuditLog {
    data_dir: PathBuf,
    append: Mutex<()>,
}

impl AuditLog {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            append: Mutex::new(()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.data_dir)
    }

    pub fn path(&self, location: Location) -> PathBuf {
        self.data_dir.join(location.audit_file())
    }

    /// Append one entry to the location's log.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the log cannot be opened or written.
    pub async fn append(&self, location: Location, entry: &AuditEntry) -> StorageResult<()> {
        let path = self.path(location);
        let mut line = entry.to_line();
        line.push('\n');

        let _guard = self.append.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StorageError::io(&path, e))?;
        file.flush().await.map_err(|e| StorageError::io(&path, e))?;

        debug!(%location, line = %line.trim_end(), "audit entry written");
        Ok(())
    }

    /// Date of the user's most recent audited action, if any.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the log exists but cannot be read.
    pub async fn last_activity(
        &self,
        location: Location,
        name: &UserName,
    ) -> StorageResult<Option<NaiveDate>> {
        let path = self.path(location);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::io(&path, e)),
        };

        Ok(text
            .lines()
            .filter_map(|line| {
                let (date, rest) = line.split_once(' ')?;
                let (_time, rest) = rest.split_once(' ')?;
                // Names may contain spaces; the action keyword ends them
                let rest = rest.strip_prefix(name.as_str())?.strip_prefix(' ')?;
                rest.split(' ').next()?.parse::<LockAction>().ok()?;
                NaiveDate::parse_from_str(date, AUDIT_DATE_FORMAT).ok()
            })
            .max())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn name(s: &str) -> UserName {
        UserName::new(s).unwrap()
    }

    #[test]
    fn test_line_format() {
        let entry = AuditEntry {
            at: Local.with_ymd_and_hms(2024, 4, 20, 21, 12, 4).unwrap(),
            user: name("alice"),
            action: LockAction::Open,
            request_id: "req-1".into(),
            outcome: CommandOutcome::Failed("Device fault: jammed".into()),
        };

        assert_eq!(
            entry.to_line(),
            "20/04/2024 21:12:04 alice open req-1 failed: Device fault: jammed"
        );
    }

    #[tokio::test]
    async fn test_append_and_last_activity() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        assert_eq!(
            log.last_activity(Location::Unit2, &name("alice")).await.unwrap(),
            None
        );

        let mut older = AuditEntry::new(name("alice"), LockAction::Open, "r1", CommandOutcome::Succeeded);
        older.at = Local.with_ymd_and_hms(2024, 1, 5, 8, 0, 0).unwrap();
        let mut newer = AuditEntry::new(name("alice"), LockAction::Close, "r2", CommandOutcome::TimedOut);
        newer.at = Local.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut other = AuditEntry::new(name("alicia"), LockAction::Open, "r3", CommandOutcome::Succeeded);
        other.at = Local.with_ymd_and_hms(2024, 6, 1, 8, 0, 0).unwrap();

        for entry in [&newer, &older, &other] {
            log.append(Location::Unit2, entry).await.unwrap();
        }

        assert_eq!(
            log.last_activity(Location::Unit2, &name("alice")).await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
        assert_eq!(
            log.last_activity(Location::Unit1, &name("alice")).await.unwrap(),
            None
        );

        let text = std::fs::read_to_string(log.path(Location::Unit2)).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[tokio::test]
    async fn test_last_activity_with_spaced_names() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        let mut full = AuditEntry::new(name("max mustermann"), LockAction::Open, "r1", CommandOutcome::Succeeded);
        full.at = Local.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap();
        let mut short = AuditEntry::new(name("max"), LockAction::Close, "r2", CommandOutcome::Succeeded);
        short.at = Local.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap();
        for entry in [&full, &short] {
            log.append(Location::Workshop, entry).await.unwrap();
        }

        assert_eq!(
            log.last_activity(Location::Workshop, &name("max mustermann")).await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 2)
        );
        assert_eq!(
            log.last_activity(Location::Workshop, &name("max")).await.unwrap(),
            NaiveDate::from_ymd_opt(2024, 4, 1)
        );
    }
}
