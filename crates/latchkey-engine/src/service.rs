//! The service facade used by the request layer.
//!
//! [`LockService`] wires the credential store, sessions, one supervised
//! connection per configured lock, and the dispatcher together. Its methods
//! are the whole API surface: `login`, `logout`, `get_status`, `open_lock`
//! and `close_lock`, plus diagnostics.
//!
//! # Examples
//!
//! ```no_run
//! use latchkey_core::{Config, Location};
//! use latchkey_engine::LockService;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load("latchkey.toml")?;
//! let service = LockService::start(&config)?;
//!
//! let session = service.login(Location::Workshop, "alice", "hunter2").await?;
//! let report = service.open_lock(&session.token).await?;
//! println!("{}", report.outcome());
//!
//! service.shutdown().await;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use latchkey_core::{CommandKind, Config, ConnectionState, Location, UserName};
use latchkey_storage::{AuditLog, CredentialStore};
use latchkey_transport::AnyLockTransport;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{ConnectionHandle, ConnectionSupervisor};
use crate::dispatcher::{CommandDispatcher, CommandReport};
use crate::error::{AuthError, ServiceError, ServiceResult};
use crate::session::{Session, SessionManager};
use crate::state_machine::StateTransition;

const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Current user and lock state, as shown on the status screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub user: UserName,
    pub location: Location,
    pub state: ConnectionState,
}

/// Running lock service.
#[derive(Debug)]
pub struct LockService {
    sessions: Arc<SessionManager>,
    dispatcher: CommandDispatcher,
    connections: BTreeMap<Location, ConnectionHandle>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl LockService {
    /// Build every configured transport and start the service.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    /// Returns `ServiceError::Config` if the configuration is invalid or a
    /// transport cannot be built from it.
    pub fn start(config: &Config) -> ServiceResult<Self> {
        config.validate()?;

        let transports = config
            .locks
            .iter()
            .map(|lock| AnyLockTransport::from_config(&lock.transport).map(|t| (lock.location, t)))
            .collect::<latchkey_core::Result<Vec<_>>>()?;

        Self::with_transports(config, transports)
    }

    /// Start the service with transports built by the caller.
    ///
    /// `auto_connect` is taken from the matching lock entry in `config`,
    /// defaulting to on.
    ///
    /// # Errors
    /// Returns `ServiceError::Config` if the session secret is unusable.
    pub fn with_transports(
        config: &Config,
        transports: impl IntoIterator<Item = (Location, AnyLockTransport)>,
    ) -> ServiceResult<Self> {
        let store = Arc::new(CredentialStore::from_config(config));
        let sessions = Arc::new(SessionManager::new(config, store)?);
        let audit = Arc::new(AuditLog::from_config(config));
        let shutdown = CancellationToken::new();

        let mut connections = BTreeMap::new();
        let mut tasks = Vec::new();
        for (location, transport) in transports {
            let auto_connect = config.lock(location).is_none_or(|lock| lock.auto_connect);
            let (handle, task) = ConnectionSupervisor::new(location, transport, config)
                .auto_connect(auto_connect)
                .spawn(shutdown.child_token());
            connections.insert(location, handle);
            tasks.push(task);
        }

        tasks.push(tokio::spawn(purge_sessions(
            Arc::clone(&sessions),
            shutdown.child_token(),
        )));

        let dispatcher = CommandDispatcher::new(
            Arc::clone(&sessions),
            audit,
            connections.values().cloned(),
            config.timeouts.connect_wait(),
        );

        info!(locations = ?connections.keys().collect::<Vec<_>>(), "lock service started");
        Ok(Self {
            sessions,
            dispatcher,
            connections,
            tasks,
            shutdown,
        })
    }

    /// # Errors
    /// See [`SessionManager::login`].
    pub async fn login(
        &self,
        location: Location,
        name: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        self.sessions.login(location, name, password).await
    }

    pub fn logout(&self, token: &str) {
        self.sessions.logout(token);
    }

    /// Who is logged in and how the lock is doing.
    ///
    /// # Errors
    /// - `ServiceError::Auth` for an invalid or expired session
    /// - `ServiceError::Config` if the session's location has no lock
    pub fn get_status(&self, token: &str) -> ServiceResult<StatusReport> {
        let session = self.sessions.validate(token)?;
        let state = self
            .dispatcher
            .state(session.location)
            .ok_or_else(|| ServiceError::not_served(session.location))?;

        Ok(StatusReport {
            user: session.user,
            location: session.location,
            state,
        })
    }

    /// # Errors
    /// See [`CommandDispatcher::dispatch`].
    pub async fn open_lock(&self, token: &str) -> ServiceResult<CommandReport> {
        self.dispatcher.dispatch(token, CommandKind::Open).await
    }

    /// # Errors
    /// See [`CommandDispatcher::dispatch`].
    pub async fn close_lock(&self, token: &str) -> ServiceResult<CommandReport> {
        self.dispatcher.dispatch(token, CommandKind::Close).await
    }

    /// Served locations in display order.
    pub fn locations(&self) -> Vec<Location> {
        self.connections.keys().copied().collect()
    }

    pub fn state(&self, location: Location) -> Option<ConnectionState> {
        self.connections.get(&location).map(ConnectionHandle::state)
    }

    pub fn connection(&self, location: Location) -> Option<&ConnectionHandle> {
        self.connections.get(&location)
    }

    /// Recent state transitions of one lock, oldest first.
    ///
    /// # Errors
    /// - `ServiceError::Config` if the location has no lock
    /// - `ServiceError::Transport` if its supervisor has stopped
    pub async fn history(&self, location: Location) -> ServiceResult<Vec<StateTransition>> {
        let connection = self
            .connections
            .get(&location)
            .ok_or_else(|| ServiceError::not_served(location))?;
        Ok(connection.history().await?)
    }

    /// Stop every supervisor and wait for the transports to disconnect.
    pub async fn shutdown(self) {
        info!("lock service shutting down");
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "service task ended abnormally");
            }
        }
    }
}

async fn purge_sessions(sessions: Arc<SessionManager>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = interval.tick() => {
                sessions.purge_expired();
            }
        }
    }
}
