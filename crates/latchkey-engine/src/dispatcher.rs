//! Command dispatcher.
//!
//! Entry point for lock commands. Every command is authenticated first, so
//! a bad token never reaches a transport. Open and close then pass a
//! single-slot gate per lock: while one actuation is in flight, another is
//! refused with [`ServiceError::Concurrency`] instead of being queued.
//! Status reads bypass the gate.
//!
//! Once admitted, a command runs in its own task. If the caller stops
//! waiting, the actuation still completes, is audited, and only then frees
//! the gate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use latchkey_core::{CommandKind, CommandOutcome, ConnectionState, Location, LockAction, UserName};
use latchkey_storage::{AuditEntry, AuditLog};
use latchkey_transport::TransportError;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::{ServiceError, ServiceResult};
use crate::session::{Session, SessionManager};

/// One command as issued by a user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub request_id: Uuid,
    pub issued_by: UserName,
    pub location: Location,
    pub submitted_at: DateTime<Local>,
}

impl Command {
    pub fn new(kind: CommandKind, session: &Session) -> Self {
        Self {
            kind,
            request_id: Uuid::new_v4(),
            issued_by: session.user.clone(),
            location: session.location,
            submitted_at: Local::now(),
        }
    }
}

/// What happened to a dispatched command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub request_id: Uuid,
    pub kind: CommandKind,
    pub location: Location,

    /// Transport result. Always `Ok` for status reads.
    pub result: Result<(), TransportError>,

    /// Lock state right after the command finished.
    pub state: ConnectionState,
}

impl CommandReport {
    pub fn outcome(&self) -> CommandOutcome {
        match &self.result {
            Ok(()) => CommandOutcome::Succeeded,
            Err(TransportError::Timeout { .. }) => CommandOutcome::TimedOut,
            Err(error) => CommandOutcome::Failed(error.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

#[derive(Debug)]
struct Lane {
    connection: ConnectionHandle,
    gate: Arc<Semaphore>,
}

/// Routes authenticated commands to the supervised locks.
#[derive(Debug)]
pub struct CommandDispatcher {
    sessions: Arc<SessionManager>,
    audit: Arc<AuditLog>,
    lanes: HashMap<Location, Lane>,
    connect_wait: Duration,
}

impl CommandDispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        audit: Arc<AuditLog>,
        connections: impl IntoIterator<Item = ConnectionHandle>,
        connect_wait: Duration,
    ) -> Self {
        let lanes = connections
            .into_iter()
            .map(|connection| {
                let lane = Lane {
                    connection,
                    gate: Arc::new(Semaphore::new(1)),
                };
                (lane.connection.location(), lane)
            })
            .collect();

        Self {
            sessions,
            audit,
            lanes,
            connect_wait,
        }
    }

    /// Current state of the lock at `location`, if it is served.
    pub fn state(&self, location: Location) -> Option<ConnectionState> {
        self.lanes.get(&location).map(|lane| lane.connection.state())
    }

    /// Run a command for the holder of `token` against their location's lock.
    ///
    /// Once an open or close reached the transport, its success or failure
    /// is reported in [`CommandReport::result`].
    ///
    /// # Errors
    /// - `ServiceError::Auth` for an invalid or expired session
    /// - `ServiceError::Config` if the session's location has no lock
    /// - `ServiceError::Concurrency` if another open/close is in flight
    /// - `ServiceError::Transport` if the lock did not connect in time
    pub async fn dispatch(&self, token: &str, kind: CommandKind) -> ServiceResult<CommandReport> {
        let session = self.sessions.validate(token)?;
        let lane = self
            .lanes
            .get(&session.location)
            .ok_or_else(|| ServiceError::not_served(session.location))?;
        let command = Command::new(kind, &session);

        let Some(action) = kind.action() else {
            return Ok(CommandReport {
                request_id: command.request_id,
                kind,
                location: command.location,
                result: Ok(()),
                state: lane.connection.state(),
            });
        };

        let permit = Arc::clone(&lane.gate).try_acquire_owned().map_err(|_| {
            warn!(location = %command.location, user = %command.issued_by, %action, "command refused, another one is in flight");
            ServiceError::Concurrency {
                location: command.location,
            }
        })?;

        let connection = lane.connection.clone();
        let audit = Arc::clone(&self.audit);
        let connect_wait = self.connect_wait;
        let task = tokio::spawn(async move {
            let report = actuate(&connection, &audit, &command, action, connect_wait).await;
            drop(permit);
            report
        });

        task.await
            .map_err(|e| TransportError::disconnected(format!("command task failed: {e}")))?
    }
}

async fn actuate(
    connection: &ConnectionHandle,
    audit: &AuditLog,
    command: &Command,
    action: LockAction,
    connect_wait: Duration,
) -> ServiceResult<CommandReport> {
    let location = command.location;
    info!(%location, user = %command.issued_by, %action, request_id = %command.request_id, "dispatching command");

    connection.ensure_connected(connect_wait).await?;

    let result = connection.execute(action).await;
    let report = CommandReport {
        request_id: command.request_id,
        kind: command.kind,
        location,
        result,
        state: connection.state(),
    };

    let entry = AuditEntry::new(
        command.issued_by.clone(),
        action,
        command.request_id.to_string(),
        report.outcome(),
    );
    if let Err(e) = audit.append(location, &entry).await {
        // The lock may already have moved; report what the transport said
        error!(%location, error = %e, "failed to write audit entry");
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionSupervisor;
    use crate::error::AuthError;
    use latchkey_core::{Config, LockConfig, TransportConfig};
    use latchkey_storage::{CredentialStore, password};
    use latchkey_transport::{MockBehavior, MockHandle, MockTransport};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        dispatcher: Arc<CommandDispatcher>,
        sessions: Arc<SessionManager>,
        audit: Arc<AuditLog>,
        mock: MockHandle,
        _shutdown: tokio_util::sync::DropGuard,
        _dir: TempDir,
    }

    impl Fixture {
        async fn token(&self) -> String {
            self.sessions
                .login(Location::Unit1, "alice", "pw")
                .await
                .unwrap()
                .token
        }

        fn audit_lines(&self) -> Vec<String> {
            std::fs::read_to_string(self.audit.path(Location::Unit1))
                .unwrap_or_default()
                .lines()
                .map(str::to_owned)
                .collect()
        }
    }

    fn fixture(transport: MockTransport, mock: MockHandle) -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::new("secret")
            .data_dir(dir.path())
            .with_lock(LockConfig::new(Location::Unit1, TransportConfig::MockSuccess));
        config.timeouts.connect_wait_ms = 500;

        let store = Arc::new(CredentialStore::from_config(&config));
        let stored = password::hash_password("pw");
        store
            .upsert(Location::Unit1, "alice", &stored.hash, &stored.salt)
            .unwrap();

        let shutdown = CancellationToken::new();
        let (connection, _join) =
            ConnectionSupervisor::new(Location::Unit1, transport.into(), &config)
                .auto_connect(false)
                .spawn(shutdown.clone());

        let sessions = Arc::new(SessionManager::new(&config, store).unwrap());
        let audit = Arc::new(AuditLog::from_config(&config));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&audit),
            [connection],
            config.timeouts.connect_wait(),
        ));

        Fixture {
            dispatcher,
            sessions,
            audit,
            mock,
            _shutdown: shutdown.drop_guard(),
            _dir: dir,
        }
    }

    fn mock_fixture(behavior: MockBehavior) -> Fixture {
        let (transport, mock) = MockTransport::new(behavior);
        fixture(transport, mock)
    }

    #[tokio::test]
    async fn test_open_connects_and_succeeds() {
        let fx = mock_fixture(MockBehavior::Success);
        let token = fx.token().await;

        let report = fx.dispatcher.dispatch(&token, CommandKind::Open).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.outcome(), CommandOutcome::Succeeded);
        assert_eq!(report.state, ConnectionState::Connected);
        assert_eq!(fx.mock.opens(), 1);

        let lines = fx.audit_lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(&format!("alice open {} succeeded", report.request_id)));
    }

    #[tokio::test]
    async fn test_fault_is_reported_and_audited() {
        let fx = mock_fixture(MockBehavior::Fault);
        let token = fx.token().await;

        let report = fx.dispatcher.dispatch(&token, CommandKind::Close).await.unwrap();

        assert!(matches!(report.result, Err(TransportError::DeviceFault { .. })));
        assert_eq!(report.state, ConnectionState::Connected);
        assert!(fx.audit_lines()[0].contains("alice close"));
        assert!(fx.audit_lines()[0].contains("failed: Device fault"));
    }

    #[tokio::test]
    async fn test_unreachable_lock_fails_without_reaching_transport() {
        let fx = mock_fixture(MockBehavior::Disconnected);
        let token = fx.token().await;

        let result = fx.dispatcher.dispatch(&token, CommandKind::Open).await;

        assert!(matches!(
            result,
            Err(ServiceError::Transport(TransportError::Timeout { duration_ms: 500 }))
        ));
        assert_eq!(fx.mock.opens(), 0);
        assert!(fx.audit_lines().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_session_never_touches_transport() {
        let fx = mock_fixture(MockBehavior::Success);

        let result = fx.dispatcher.dispatch("bogus.token", CommandKind::Open).await;

        assert!(matches!(
            result,
            Err(ServiceError::Auth(AuthError::InvalidSession))
        ));
        assert_eq!(fx.mock.connect_attempts(), 0);
        assert_eq!(fx.mock.opens(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_opens_admit_exactly_one() {
        let (transport, mock) =
            MockTransport::with_latency(MockBehavior::Success, Duration::from_millis(200));
        let fx = fixture(transport, mock);
        let token = fx.token().await;

        let first = {
            let dispatcher = Arc::clone(&fx.dispatcher);
            let token = token.clone();
            tokio::spawn(async move { dispatcher.dispatch(&token, CommandKind::Open).await })
        };
        // Let the first command take the gate
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = fx.dispatcher.dispatch(&token, CommandKind::Open).await;
        assert!(matches!(
            second,
            Err(ServiceError::Concurrency {
                location: Location::Unit1
            })
        ));

        // Status is never gated
        let status = fx.dispatcher.dispatch(&token, CommandKind::Status).await.unwrap();
        assert!(status.is_success());

        assert!(first.await.unwrap().unwrap().is_success());
        assert_eq!(fx.mock.opens(), 1);

        // No permanent lockout
        let third = fx.dispatcher.dispatch(&token, CommandKind::Open).await.unwrap();
        assert!(third.is_success());
        assert_eq!(fx.mock.opens(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_open_still_completes() {
        let (transport, mock) =
            MockTransport::with_latency(MockBehavior::Success, Duration::from_millis(200));
        let fx = fixture(transport, mock);
        let token = fx.token().await;

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            fx.dispatcher.dispatch(&token, CommandKind::Open),
        )
        .await;
        assert!(cancelled.is_err());

        // The actuation finishes in the background and is audited
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fx.mock.opens(), 1);
        assert_eq!(fx.audit_lines().len(), 1);
        assert_eq!(fx.dispatcher.state(Location::Unit1), Some(ConnectionState::Connected));

        let report = fx.dispatcher.dispatch(&token, CommandKind::Open).await.unwrap();
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn test_status_reports_state_without_connecting() {
        let fx = mock_fixture(MockBehavior::Success);
        let token = fx.token().await;

        let report = fx.dispatcher.dispatch(&token, CommandKind::Status).await.unwrap();

        assert_eq!(report.state, ConnectionState::Disconnected);
        assert_eq!(fx.mock.connect_attempts(), 0);
        assert!(fx.audit_lines().is_empty());
    }

    #[tokio::test]
    async fn test_location_without_lock_is_config_error() {
        let fx = mock_fixture(MockBehavior::Success);
        let stored = password::hash_password("pw");
        fx.sessions
            .store()
            .upsert(Location::Workshop, "bob", &stored.hash, &stored.salt)
            .unwrap();
        let token = fx
            .sessions
            .login(Location::Workshop, "bob", "pw")
            .await
            .unwrap()
            .token;

        assert!(matches!(
            fx.dispatcher.dispatch(&token, CommandKind::Open).await,
            Err(ServiceError::Config(_))
        ));
    }

    #[rstest::rstest]
    #[case(Ok(()), CommandOutcome::Succeeded)]
    #[case(Err(TransportError::timeout(Duration::from_secs(8))), CommandOutcome::TimedOut)]
    #[case(
        Err(TransportError::no_response("garbled")),
        CommandOutcome::Failed("No response: garbled".into())
    )]
    fn test_report_outcome(
        #[case] result: Result<(), TransportError>,
        #[case] expected: CommandOutcome,
    ) {
        let report = CommandReport {
            request_id: Uuid::nil(),
            kind: CommandKind::Open,
            location: Location::Unit1,
            result,
            state: ConnectionState::Connected,
        };
        assert_eq!(report.outcome(), expected);
    }
}
