//! Connection supervisor.
//!
//! One tokio task per lock owns the [`AnyLockTransport`] and its
//! [`StateMachine`]. Nothing else touches the transport. Callers hold a
//! cloneable [`ConnectionHandle`]: requests travel over an `mpsc` channel
//! and the current state is published on a `watch` channel, so reading the
//! state never waits behind a command.
//!
//! Outcome of a command and the resulting state:
//!
//! | Outcome                                  | State          | Follow-up            |
//! |------------------------------------------|----------------|----------------------|
//! | success, `DeviceFault`                   | `Connected`    |                      |
//! | `Disconnected`                           | `Disconnected` | reconnect scheduled  |
//! | `Timeout`, `NoResponse`, `AuthRejected`  | `Error`        | link dropped, retry  |
//!
//! A command whose caller went away still runs to completion and still
//! updates the state: the request is owned by this task, not by the caller.

use std::future;
use std::time::Duration;

use latchkey_core::{Config, ConnectionState, Location, LockAction, TimeoutSettings};
use latchkey_transport::{AnyLockTransport, LinkStatus, LockTransport, TransportError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::state_machine::{StateMachine, StateTransition};

type TransportResult<T> = latchkey_transport::Result<T>;

const REQUEST_QUEUE_DEPTH: usize = 16;

enum Request {
    Connect,
    Execute {
        action: LockAction,
        reply: oneshot::Sender<TransportResult<()>>,
    },
    History {
        reply: oneshot::Sender<Vec<StateTransition>>,
    },
}

/// Cloneable access to one supervised lock.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    location: Location,
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Request::Connect => f.write_str("Connect"),
            Request::Execute { action, .. } => write!(f, "Execute({action})"),
            Request::History { .. } => f.write_str("History"),
        }
    }
}

fn supervisor_gone() -> TransportError {
    TransportError::disconnected("connection supervisor stopped")
}

impl ConnectionHandle {
    pub fn location(&self) -> Location {
        self.location
    }

    /// Current state. Never waits.
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Ask for a connect attempt. An attempt in `Error` starts right away
    /// instead of waiting for the backoff; other states ignore the request.
    ///
    /// # Errors
    /// Returns `TransportError::Disconnected` if the supervisor has stopped.
    pub async fn request_connect(&self) -> TransportResult<()> {
        self.requests
            .send(Request::Connect)
            .await
            .map_err(|_| supervisor_gone())
    }

    /// Wait until the lock is `Connected`, requesting a connect if needed.
    ///
    /// # Errors
    /// - `TransportError::Timeout` if `Connected` is not reached within `wait`
    /// - `TransportError::Disconnected` if the supervisor has stopped
    pub async fn ensure_connected(&self, wait: Duration) -> TransportResult<()> {
        if self.state().is_ready() {
            return Ok(());
        }
        self.request_connect().await?;

        let mut state = self.state.clone();
        match time::timeout(wait, state.wait_for(ConnectionState::is_ready)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(supervisor_gone()),
            Err(_) => {
                warn!(location = %self.location, wait_ms = wait.as_millis(), "lock did not connect in time");
                Err(TransportError::timeout(wait))
            }
        }
    }

    /// Run `action` on the lock and wait for the result.
    ///
    /// Dropping the returned future does not cancel the actuation.
    ///
    /// # Errors
    /// Any [`TransportError`] from the transport, or `Disconnected` if the
    /// lock is not `Connected` when the request is picked up.
    pub async fn execute(&self, action: LockAction) -> TransportResult<()> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::Execute { action, reply })
            .await
            .map_err(|_| supervisor_gone())?;
        response.await.map_err(|_| supervisor_gone())?
    }

    /// Recent state transitions, oldest first.
    ///
    /// # Errors
    /// Returns `TransportError::Disconnected` if the supervisor has stopped.
    pub async fn history(&self) -> TransportResult<Vec<StateTransition>> {
        let (reply, response) = oneshot::channel();
        self.requests
            .send(Request::History { reply })
            .await
            .map_err(|_| supervisor_gone())?;
        response.await.map_err(|_| supervisor_gone())
    }
}

/// Task that owns one lock transport.
#[derive(Debug)]
pub struct ConnectionSupervisor {
    location: Location,
    transport: AnyLockTransport,
    machine: StateMachine,
    backoff: Backoff,
    timeouts: TimeoutSettings,
    auto_connect: bool,
}

impl ConnectionSupervisor {
    pub fn new(location: Location, transport: AnyLockTransport, config: &Config) -> Self {
        Self {
            location,
            transport,
            machine: StateMachine::new(),
            backoff: Backoff::from_settings(&config.backoff),
            timeouts: config.timeouts.clone(),
            auto_connect: true,
        }
    }

    /// Whether to start connecting as soon as the task runs
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }

    /// Spawn the supervisor task.
    ///
    /// The task stops when `shutdown` is cancelled or every handle is
    /// dropped; it then disconnects the transport and publishes
    /// `Disconnected`.
    pub fn spawn(self, shutdown: CancellationToken) -> (ConnectionHandle, JoinHandle<()>) {
        let (requests_tx, requests) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (state_tx, state) = watch::channel(self.machine.current_state());

        let handle = ConnectionHandle {
            location: self.location,
            requests: requests_tx,
            state,
        };
        let link = self.transport.link_events();
        let task = Running {
            inner: self,
            requests,
            state_tx,
            link,
            retry_at: None,
        };
        let join = tokio::spawn(task.run(shutdown));

        (handle, join)
    }
}

struct Running {
    inner: ConnectionSupervisor,
    requests: mpsc::Receiver<Request>,
    state_tx: watch::Sender<ConnectionState>,
    link: watch::Receiver<LinkStatus>,
    retry_at: Option<Instant>,
}

impl Running {
    async fn run(mut self, shutdown: CancellationToken) {
        let location = self.inner.location;
        info!(%location, transport = %self.inner.transport.info(), "connection supervisor started");

        if self.inner.auto_connect {
            self.attempt_connect().await;
        }

        let mut link_open = true;
        loop {
            let retry_at = self.retry_at;
            let retry = async move {
                match retry_at {
                    Some(at) => time::sleep_until(at).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                biased;

                () = shutdown.cancelled() => break,

                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },

                changed = self.link.changed(), if link_open => match changed {
                    Ok(()) => {
                        let status = *self.link.borrow_and_update();
                        self.on_link_status(status);
                    }
                    Err(_) => link_open = false,
                },

                () = retry => {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
            }
        }

        self.inner.transport.disconnect().await;
        if self.inner.machine.current_state() != ConnectionState::Disconnected {
            self.transition(ConnectionState::Disconnected);
        }
        info!(%location, "connection supervisor stopped");
    }

    async fn handle(&mut self, request: Request) {
        debug!(location = %self.inner.location, ?request, "supervisor request");
        match request {
            Request::Connect => {
                if matches!(
                    self.inner.machine.current_state(),
                    ConnectionState::Disconnected | ConnectionState::Error
                ) {
                    self.retry_at = None;
                    self.attempt_connect().await;
                }
            }
            Request::Execute { action, reply } => {
                let result = self.execute(action).await;
                // The caller may have given up; the state is updated either way
                let _ = reply.send(result);
            }
            Request::History { reply } => {
                let _ = reply.send(self.inner.machine.history().iter().cloned().collect());
            }
        }
    }

    fn on_link_status(&mut self, status: LinkStatus) {
        // Only a drop from an idle, established link is unsolicited. Drops
        // during connect or a command surface through that call's result.
        if status == LinkStatus::Down
            && self.inner.machine.current_state() == ConnectionState::Connected
        {
            warn!(location = %self.inner.location, "link lost");
            self.transition(ConnectionState::Disconnected);
            self.schedule_retry();
        }
    }

    async fn attempt_connect(&mut self) {
        let location = self.inner.location;
        self.transition(ConnectionState::Connecting);

        let timeout = self.inner.timeouts.connect();
        let result = time::timeout(timeout, self.inner.transport.connect(timeout))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout(timeout)));

        match result {
            Ok(()) => {
                self.inner.backoff.reset();
                self.transition(ConnectionState::Connected);
            }
            Err(error) => {
                warn!(%location, %error, attempt = self.inner.backoff.attempt() + 1, "connect failed");
                self.inner.transport.disconnect().await;
                self.transition(ConnectionState::Error);
                self.schedule_retry();
            }
        }
    }

    async fn execute(&mut self, action: LockAction) -> TransportResult<()> {
        let location = self.inner.location;
        if self.inner.machine.current_state() != ConnectionState::Connected {
            return Err(TransportError::disconnected(format!(
                "lock is {}",
                self.inner.machine.current_state()
            )));
        }

        self.transition(ConnectionState::Busy);
        let timeout = self.inner.timeouts.command();
        let result = time::timeout(timeout, self.inner.transport.execute(action, timeout))
            .await
            .unwrap_or_else(|_| Err(TransportError::timeout(timeout)));

        match &result {
            Ok(()) => {
                info!(%location, %action, "command succeeded");
                self.transition(ConnectionState::Connected);
            }
            Err(error @ TransportError::DeviceFault { .. }) => {
                warn!(%location, %action, %error, "command failed");
                self.transition(ConnectionState::Connected);
            }
            Err(error @ TransportError::Disconnected { .. }) => {
                warn!(%location, %action, %error, "link lost during command");
                self.inner.transport.disconnect().await;
                self.transition(ConnectionState::Disconnected);
                self.schedule_retry();
            }
            Err(error) => {
                warn!(%location, %action, %error, "command failed, dropping link");
                self.inner.transport.disconnect().await;
                self.transition(ConnectionState::Error);
                self.schedule_retry();
            }
        }
        result
    }

    fn schedule_retry(&mut self) {
        let delay = self.inner.backoff.next_delay();
        info!(
            location = %self.inner.location,
            attempt = self.inner.backoff.attempt(),
            delay_ms = delay.as_millis(),
            "reconnect scheduled"
        );
        self.retry_at = Some(Instant::now() + delay);
    }

    fn transition(&mut self, to: ConnectionState) {
        let location = self.inner.location;
        match self.inner.machine.transition_to(to) {
            Ok(transition) => {
                info!(%location, from = %transition.from, to = %transition.to, "connection state changed");
                self.state_tx.send_replace(to);
            }
            Err(error) => warn!(%location, %error, "state transition refused"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_core::{LockConfig, TransportConfig};
    use latchkey_transport::{MockBehavior, MockHandle, MockTransport};

    const WAIT: Duration = Duration::from_secs(5);

    fn config() -> Config {
        let mut config = Config::new("secret")
            .with_lock(LockConfig::new(Location::Unit1, TransportConfig::MockSuccess));
        config.timeouts.connect_ms = 200;
        config.timeouts.command_ms = 200;
        config.backoff.initial_ms = 50;
        config.backoff.max_ms = 400;
        config
    }

    fn spawn_with(
        transport: MockTransport,
        config: &Config,
        auto_connect: bool,
    ) -> (ConnectionHandle, JoinHandle<()>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let (handle, join) = ConnectionSupervisor::new(Location::Unit1, transport.into(), config)
            .auto_connect(auto_connect)
            .spawn(shutdown.clone());
        (handle, join, shutdown)
    }

    fn spawn_mock(
        transport: MockTransport,
        auto_connect: bool,
    ) -> (ConnectionHandle, JoinHandle<()>, CancellationToken) {
        spawn_with(transport, &config(), auto_connect)
    }

    async fn wait_for_state(handle: &ConnectionHandle, expected: ConnectionState) {
        let mut state = handle.subscribe();
        time::timeout(WAIT, state.wait_for(|s| *s == expected))
            .await
            .unwrap_or_else(|_| panic!("never reached {expected}, stuck in {}", handle.state()))
            .unwrap();
    }

    fn mock(behavior: MockBehavior) -> (MockTransport, MockHandle) {
        MockTransport::new(behavior)
    }

    #[tokio::test]
    async fn test_success_mock_reaches_connected() {
        let (transport, _mock) = mock(MockBehavior::Success);
        let (handle, _join, _shutdown) = spawn_mock(transport, true);

        wait_for_state(&handle, ConnectionState::Connected).await;
        assert!(handle.execute(LockAction::Open).await.is_ok());
        assert!(handle.execute(LockAction::Close).await.is_ok());
        assert_eq!(handle.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_fault_mock_stays_connected() {
        let (transport, mock) = mock(MockBehavior::Fault);
        let (handle, _join, _shutdown) = spawn_mock(transport, true);

        wait_for_state(&handle, ConnectionState::Connected).await;
        assert!(matches!(
            handle.execute(LockAction::Open).await,
            Err(TransportError::DeviceFault { .. })
        ));
        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(mock.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnected_mock_never_connects_and_keeps_retrying() {
        let (transport, mock) = mock(MockBehavior::Disconnected);
        let (handle, _join, _shutdown) = spawn_mock(transport, true);

        wait_for_state(&handle, ConnectionState::Error).await;
        time::sleep(Duration::from_secs(5)).await;

        assert_ne!(handle.state(), ConnectionState::Connected);
        assert!(mock.connect_attempts() > 3);
        assert!(
            handle
                .history()
                .await
                .unwrap()
                .iter()
                .all(|t| t.to != ConnectionState::Connected)
        );
    }

    #[tokio::test]
    async fn test_ensure_connected_triggers_connect() {
        let (transport, mock) = mock(MockBehavior::Success);
        let (handle, _join, _shutdown) = spawn_mock(transport, false);
        assert_eq!(handle.state(), ConnectionState::Disconnected);

        handle.ensure_connected(WAIT).await.unwrap();

        assert_eq!(handle.state(), ConnectionState::Connected);
        assert_eq!(mock.connect_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_connected_gives_up_after_wait() {
        let (transport, _mock) = mock(MockBehavior::Disconnected);
        let (handle, _join, _shutdown) = spawn_mock(transport, false);

        let result = handle.ensure_connected(Duration::from_secs(1)).await;

        assert_eq!(result, Err(TransportError::Timeout { duration_ms: 1000 }));
    }

    #[tokio::test]
    async fn test_execute_when_not_connected_does_not_reach_transport() {
        let (transport, mock) = mock(MockBehavior::Success);
        let (handle, _join, _shutdown) = spawn_mock(transport, false);

        assert!(matches!(
            handle.execute(LockAction::Open).await,
            Err(TransportError::Disconnected { .. })
        ));
        assert_eq!(mock.opens(), 0);
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_forces_disconnected_then_reconnects() {
        let (transport, mock) = mock(MockBehavior::Success);
        let (handle, _join, _shutdown) = spawn_mock(transport, true);
        wait_for_state(&handle, ConnectionState::Connected).await;

        let mut states = handle.subscribe();
        mock.drop_link();

        time::timeout(WAIT, states.wait_for(|s| *s == ConnectionState::Disconnected))
            .await
            .unwrap()
            .unwrap();
        wait_for_state(&handle, ConnectionState::Connected).await;
        assert_eq!(mock.connect_attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_timeout_moves_to_error_and_recovers() {
        let mut config = config();
        config.timeouts.connect_ms = 1_000;
        config.timeouts.command_ms = 100;
        // Connecting fits in its bound, commands do not
        let (transport, mock) =
            MockTransport::with_latency(MockBehavior::Success, Duration::from_millis(500));
        let (handle, _join, _shutdown) = spawn_with(transport, &config, true);
        wait_for_state(&handle, ConnectionState::Connected).await;

        let mut states = handle.subscribe();
        assert_eq!(
            handle.execute(LockAction::Open).await,
            Err(TransportError::Timeout { duration_ms: 100 })
        );
        assert_eq!(*states.borrow_and_update(), ConnectionState::Error);

        wait_for_state(&handle, ConnectionState::Connected).await;
        assert_eq!(mock.connect_attempts(), 2);
        assert_eq!(mock.opens(), 1);
    }

    #[tokio::test]
    async fn test_history_tracks_transitions() {
        let (transport, _mock) = mock(MockBehavior::Success);
        let (handle, _join, _shutdown) = spawn_mock(transport, true);
        wait_for_state(&handle, ConnectionState::Connected).await;
        handle.execute(LockAction::Open).await.unwrap();

        let pairs: Vec<_> = handle
            .history()
            .await
            .unwrap()
            .iter()
            .map(|t| (t.from, t.to))
            .collect();
        assert_eq!(
            pairs,
            [
                (ConnectionState::Disconnected, ConnectionState::Connecting),
                (ConnectionState::Connecting, ConnectionState::Connected),
                (ConnectionState::Connected, ConnectionState::Busy),
                (ConnectionState::Busy, ConnectionState::Connected),
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_disconnects() {
        let (transport, _mock) = mock(MockBehavior::Success);
        let (handle, join, shutdown) = spawn_mock(transport, true);
        wait_for_state(&handle, ConnectionState::Connected).await;

        shutdown.cancel();
        join.await.unwrap();

        assert_eq!(handle.state(), ConnectionState::Disconnected);
        assert!(matches!(
            handle.execute(LockAction::Open).await,
            Err(TransportError::Disconnected { .. })
        ));
    }
}
