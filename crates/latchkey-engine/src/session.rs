//! Session manager.
//!
//! Sessions live only in process memory; a restart logs everybody out.
//!
//! A token has the form `<id>.<mac>`. The id is random, the MAC is an
//! HMAC-SHA256 over id, location code and user name keyed by the configured
//! session secret. A token is only honored when its id is known *and* its
//! MAC matches the session stored under that id.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use hmac::{Hmac, Mac};
use latchkey_core::constants::{SESSION_ID_LEN, TOKEN_SEPARATOR};
use latchkey_core::{Config, Location, UserName};
use latchkey_storage::{CredentialStore, StorageError, User, password};
use parking_lot::RwLock;
use rand::RngCore;
use sha2::Sha256;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// An authenticated user at one location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: UserName,
    pub location: Location,
    pub issued_at: DateTime<Local>,
    pub expires_at: Instant,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Issues and validates session tokens.
pub struct SessionManager {
    signer: HmacSha256,
    ttl: Duration,
    login_timeout: Duration,
    store: Arc<CredentialStore>,
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    /// # Errors
    /// Returns `Error::Config` if the session secret cannot key the MAC.
    pub fn new(config: &Config, store: Arc<CredentialStore>) -> latchkey_core::Result<Self> {
        let signer = HmacSha256::new_from_slice(config.session_secret.as_bytes())
            .map_err(|e| latchkey_core::Error::Config(format!("session secret: {e}")))?;

        Ok(Self {
            signer,
            ttl: config.session.ttl(),
            login_timeout: config.session.login_timeout(),
            store,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    /// Check a password and open a session.
    ///
    /// An unknown name costs the same hashing work as a wrong password and
    /// yields the same error.
    ///
    /// # Errors
    /// - `AuthError::InvalidCredentials` for an unknown name or wrong password
    /// - `AuthError::Unavailable` if the credential file cannot be read or
    ///   the check does not finish within the login timeout
    pub async fn login(
        &self,
        location: Location,
        name: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let store = Arc::clone(&self.store);
        let name = name.to_owned();
        let password = password.to_owned();

        let check =
            tokio::task::spawn_blocking(move || check_password(&store, location, &name, &password));
        let verdict = match time::timeout(self.login_timeout, check).await {
            Ok(Ok(Ok(verdict))) => verdict,
            Ok(Ok(Err(error))) => {
                warn!(%location, %error, "credential lookup failed");
                return Err(AuthError::Unavailable(error.to_string()));
            }
            Ok(Err(error)) => return Err(AuthError::Unavailable(error.to_string())),
            Err(_) => {
                warn!(%location, timeout_ms = self.login_timeout.as_millis(), "password check timed out");
                return Err(AuthError::Unavailable("password check timed out".to_string()));
            }
        };

        let Some(user) = verdict else {
            warn!(%location, "login rejected");
            return Err(AuthError::InvalidCredentials);
        };

        let session = self.issue(user.name, location);
        info!(%location, user = %session.user, "login");
        Ok(session)
    }

    /// Resolve a token to its live session.
    ///
    /// Pure in-memory lookup. An expired session is dropped on the way.
    ///
    /// # Errors
    /// - `AuthError::InvalidSession` for malformed, unknown or forged tokens
    /// - `AuthError::Expired` once the session's TTL has passed
    pub fn validate(&self, token: &str) -> Result<Session, AuthError> {
        let (id, session) = self.lookup(token)?;
        if session.is_expired() {
            self.sessions.write().remove(&id);
            debug!(location = %session.location, user = %session.user, "session expired");
            return Err(AuthError::Expired);
        }
        Ok(session)
    }

    /// End a session. Unknown or forged tokens are ignored.
    pub fn logout(&self, token: &str) {
        if let Ok((id, session)) = self.lookup(token) {
            self.sessions.write().remove(&id);
            info!(location = %session.location, user = %session.user, "logout");
        }
    }

    /// Drop every expired session, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| session.expires_at > now);
        let purged = before - sessions.len();
        if purged > 0 {
            debug!(purged, "expired sessions purged");
        }
        purged
    }

    /// The credential store logins are checked against.
    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }

    fn issue(&self, user: UserName, location: Location) -> Session {
        let mut id = [0u8; SESSION_ID_LEN];
        rand::thread_rng().fill_bytes(&mut id);
        let id = hex::encode(id);

        let mac = hex::encode(self.mac(&id, location, &user).finalize().into_bytes());
        let session = Session {
            token: format!("{id}{TOKEN_SEPARATOR}{mac}"),
            user,
            location,
            issued_at: Local::now(),
            expires_at: Instant::now() + self.ttl,
        };

        self.sessions.write().insert(id, session.clone());
        session
    }

    fn lookup(&self, token: &str) -> Result<(String, Session), AuthError> {
        let (id, mac) = token
            .split_once(TOKEN_SEPARATOR)
            .ok_or(AuthError::InvalidSession)?;
        let mac = hex::decode(mac).map_err(|_| AuthError::InvalidSession)?;

        let session = self
            .sessions
            .read()
            .get(id)
            .cloned()
            .ok_or(AuthError::InvalidSession)?;

        if self
            .mac(id, session.location, &session.user)
            .verify_slice(&mac)
            .is_err()
        {
            warn!(location = %session.location, "session token with bad signature");
            return Err(AuthError::InvalidSession);
        }
        Ok((id.to_string(), session))
    }

    fn mac(&self, id: &str, location: Location, user: &UserName) -> HmacSha256 {
        let mut mac = self.signer.clone();
        mac.update(id.as_bytes());
        mac.update(&[0]);
        mac.update(location.code().as_bytes());
        mac.update(&[0]);
        mac.update(user.as_str().as_bytes());
        mac
    }
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("ttl", &self.ttl)
            .field("login_timeout", &self.login_timeout)
            .field("sessions", &self.active_sessions())
            .finish_non_exhaustive()
    }
}

/// Runs on the blocking pool: file read plus PBKDF2.
fn check_password(
    store: &CredentialStore,
    location: Location,
    name: &str,
    password: &str,
) -> Result<Option<User>, StorageError> {
    match store.get(location, name) {
        Ok(Some(user)) => Ok(password::verify(password, &user.salt, &user.hash).then_some(user)),
        Ok(None) | Err(StorageError::Config(_)) => {
            password::dummy_verify(password);
            Ok(None)
        }
        Err(error) => Err(error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TTL: Duration = Duration::from_secs(600);

    fn manager() -> (SessionManager, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CredentialStore::new(dir.path()));
        let stored = password::hash_password("correct");
        store
            .upsert(Location::Unit1, "alice", &stored.hash, &stored.salt)
            .unwrap();

        let mut config = Config::new("session-secret").data_dir(dir.path());
        config.session.ttl_secs = TTL.as_secs();
        (SessionManager::new(&config, store).unwrap(), dir)
    }

    #[tokio::test]
    async fn test_login_and_validate() {
        let (manager, _dir) = manager();

        let session = manager.login(Location::Unit1, "alice", "correct").await.unwrap();

        assert_eq!(session.user.as_str(), "alice");
        assert_eq!(session.location, Location::Unit1);
        assert_eq!(manager.validate(&session.token).unwrap(), session);
    }

    #[tokio::test]
    async fn test_login_normalizes_name() {
        let (manager, _dir) = manager();
        assert!(manager.login(Location::Unit1, " Alice ", "correct").await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_password_and_unknown_user_look_the_same() {
        let (manager, _dir) = manager();

        let wrong = manager.login(Location::Unit1, "alice", "wrong").await;
        let unknown = manager.login(Location::Unit1, "mallory", "correct").await;
        let invalid = manager.login(Location::Unit1, "   ", "correct").await;

        assert_eq!(wrong, Err(AuthError::InvalidCredentials));
        assert_eq!(unknown, Err(AuthError::InvalidCredentials));
        assert_eq!(invalid, Err(AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn test_credentials_are_per_location() {
        let (manager, _dir) = manager();
        assert_eq!(
            manager.login(Location::Unit2, "alice", "correct").await,
            Err(AuthError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_session_survives_user_removal() {
        let (manager, _dir) = manager();
        let session = manager.login(Location::Unit1, "alice", "correct").await.unwrap();

        manager.store.remove(Location::Unit1, "alice").unwrap();

        assert!(manager.validate(&session.token).is_ok());
    }

    #[tokio::test]
    async fn test_session_expires_after_ttl() {
        let (mut manager, _dir) = manager();
        manager.ttl = Duration::from_millis(150);
        let session = manager.login(Location::Unit1, "alice", "correct").await.unwrap();

        assert!(manager.validate(&session.token).is_ok());

        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(manager.validate(&session.token), Err(AuthError::Expired));
        // Expired sessions are gone afterwards
        assert_eq!(
            manager.validate(&session.token),
            Err(AuthError::InvalidSession)
        );
    }

    #[tokio::test]
    async fn test_logout_invalidates_immediately() {
        let (manager, _dir) = manager();
        let session = manager.login(Location::Unit1, "alice", "correct").await.unwrap();

        manager.logout(&session.token);
        manager.logout(&session.token);

        assert_eq!(
            manager.validate(&session.token),
            Err(AuthError::InvalidSession)
        );
    }

    #[tokio::test]
    async fn test_forged_tokens_are_rejected() {
        let (manager, _dir) = manager();
        let session = manager.login(Location::Unit1, "alice", "correct").await.unwrap();
        let (id, _) = session.token.split_once('.').unwrap();

        for token in [
            String::new(),
            "no-separator".to_string(),
            format!("{id}.zz"),
            format!("{id}.{}", "00".repeat(32)),
            format!("{}.{}", "ab".repeat(32), "00".repeat(32)),
        ] {
            assert_eq!(manager.validate(&token), Err(AuthError::InvalidSession));
        }

        // A forged logout leaves the real session alone
        manager.logout(&format!("{id}.{}", "00".repeat(32)));
        assert!(manager.validate(&session.token).is_ok());
    }

    #[tokio::test]
    async fn test_tokens_from_another_secret_are_rejected() {
        let (manager, dir) = manager();
        let session = manager.login(Location::Unit1, "alice", "correct").await.unwrap();

        let config = Config::new("other-secret").data_dir(dir.path());
        let other = SessionManager::new(&config, Arc::clone(&manager.store)).unwrap();
        other
            .sessions
            .write()
            .extend(manager.sessions.read().clone());

        assert_eq!(other.validate(&session.token), Err(AuthError::InvalidSession));
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (mut manager, _dir) = manager();
        manager.ttl = Duration::from_millis(150);
        manager.login(Location::Unit1, "alice", "correct").await.unwrap();
        manager.ttl = TTL;
        manager.login(Location::Unit1, "alice", "correct").await.unwrap();

        time::sleep(Duration::from_millis(200)).await;

        assert_eq!(manager.purge_expired(), 1);
        assert_eq!(manager.active_sessions(), 1);
    }

    #[tokio::test]
    async fn test_slow_check_is_unavailable() {
        let (mut manager, _dir) = manager();
        manager.login_timeout = Duration::from_nanos(1);

        assert!(matches!(
            manager.login(Location::Unit1, "alice", "correct").await,
            Err(AuthError::Unavailable(_))
        ));
    }
}
