//! Simulated transports for tests and bench setups.
//!
//! Three fixed behaviors are available:
//!
//! - [`MockBehavior::Success`]: connect, open and close always succeed.
//! - [`MockBehavior::Fault`]: connect succeeds, open and close fail with
//!   `DeviceFault`.
//! - [`MockBehavior::Disconnected`]: `status()` is always `Disconnected` and
//!   every call fails with `Disconnected`.
//!
//! A configurable latency makes operations take time, which lets tests hold
//! a command in flight. Latency never outlives the caller's timeout.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use latchkey_core::{ConnectionState, LockAction, TransportKind};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::LockTransport;
use crate::types::{LinkStatus, TransportInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockBehavior {
    Success,
    Fault,
    Disconnected,
}

impl MockBehavior {
    pub fn kind(&self) -> TransportKind {
        match self {
            MockBehavior::Success => TransportKind::MockSuccess,
            MockBehavior::Fault => TransportKind::MockFault,
            MockBehavior::Disconnected => TransportKind::MockDisconnected,
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    connected: AtomicBool,
    connect_attempts: AtomicU32,
    opens: AtomicU32,
    closes: AtomicU32,
}

/// Mock lock transport.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use latchkey_transport::LockTransport;
/// use latchkey_transport::mock::{MockBehavior, MockTransport};
///
/// #[tokio::main]
/// async fn main() -> latchkey_transport::Result<()> {
///     let (mut transport, handle) = MockTransport::new(MockBehavior::Success);
///
///     transport.connect(Duration::from_secs(1)).await?;
///     transport.open(Duration::from_secs(1)).await?;
///
///     assert_eq!(handle.opens(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MockTransport {
    behavior: MockBehavior,
    latency: Duration,
    state: Arc<MockState>,
    link: Arc<watch::Sender<LinkStatus>>,
}

impl MockTransport {
    /// Create a mock with no latency.
    ///
    /// Returns the transport and a handle for inspecting and disturbing it.
    pub fn new(behavior: MockBehavior) -> (Self, MockHandle) {
        Self::with_latency(behavior, Duration::ZERO)
    }

    /// Create a mock whose operations each take `latency`.
    pub fn with_latency(behavior: MockBehavior, latency: Duration) -> (Self, MockHandle) {
        let (link, _) = watch::channel(LinkStatus::Down);
        let link = Arc::new(link);
        let state = Arc::new(MockState::default());

        let transport = Self {
            behavior,
            latency,
            state: Arc::clone(&state),
            link: Arc::clone(&link),
        };
        let handle = MockHandle { state, link };

        (transport, handle)
    }

    pub fn behavior(&self) -> MockBehavior {
        self.behavior
    }

    /// Sleep for the configured latency, bounded by `timeout`.
    async fn simulate_latency(&self, timeout: Duration) -> Result<()> {
        if self.latency > timeout {
            tokio::time::sleep(timeout).await;
            return Err(TransportError::timeout(timeout));
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Ok(())
    }

    async fn actuate(&mut self, action: LockAction, timeout: Duration) -> Result<()> {
        let counter = match action {
            LockAction::Open => &self.state.opens,
            LockAction::Close => &self.state.closes,
        };
        counter.fetch_add(1, Ordering::SeqCst);

        match self.behavior {
            MockBehavior::Disconnected => {
                Err(TransportError::disconnected("mock lock is unreachable"))
            }
            MockBehavior::Success => {
                self.simulate_latency(timeout).await?;
                debug!(%action, "mock actuation succeeded");
                Ok(())
            }
            MockBehavior::Fault => {
                self.simulate_latency(timeout).await?;
                Err(TransportError::device_fault(format!(
                    "mock lock failed to {action}"
                )))
            }
        }
    }
}

impl LockTransport for MockTransport {
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        self.state.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if self.behavior == MockBehavior::Disconnected {
            return Err(TransportError::disconnected("mock lock is unreachable"));
        }

        self.simulate_latency(timeout).await?;
        self.state.connected.store(true, Ordering::SeqCst);
        self.link.send_replace(LinkStatus::Up);
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.link.send_replace(LinkStatus::Down);
    }

    async fn open(&mut self, timeout: Duration) -> Result<()> {
        self.actuate(LockAction::Open, timeout).await
    }

    async fn close(&mut self, timeout: Duration) -> Result<()> {
        self.actuate(LockAction::Close, timeout).await
    }

    fn status(&self) -> ConnectionState {
        if self.behavior != MockBehavior::Disconnected && self.state.connected.load(Ordering::SeqCst)
        {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        self.link.subscribe()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo::new(self.behavior.kind(), "mock")
    }
}

/// Handle for inspecting and disturbing a mock transport.
#[derive(Debug, Clone)]
pub struct MockHandle {
    state: Arc<MockState>,
    link: Arc<watch::Sender<LinkStatus>>,
}

impl MockHandle {
    pub fn connect_attempts(&self) -> u32 {
        self.state.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of open calls that reached the transport.
    pub fn opens(&self) -> u32 {
        self.state.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> u32 {
        self.state.closes.load(Ordering::SeqCst)
    }

    /// Simulate the lock going out of range.
    pub fn drop_link(&self) {
        self.state.connected.store(false, Ordering::SeqCst);
        self.link.send_replace(LinkStatus::Down);
    }
}
