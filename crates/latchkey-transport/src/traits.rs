//! The lock transport capability.
//!
//! All methods use native `async fn` (Edition 2024 RPITIT). The trait is
//! therefore not object-safe; use [`AnyLockTransport`](crate::AnyLockTransport)
//! where a single type must cover every backend.

#![allow(async_fn_in_trait)]

use std::time::Duration;

use latchkey_core::{ConnectionState, LockAction};
use tokio::sync::watch;

use crate::error::Result;
use crate::types::{LinkStatus, TransportInfo};

/// One physical path to a lock.
///
/// Every suspending operation takes a timeout and must return
/// [`TransportError::Timeout`](crate::TransportError::Timeout) (or a more
/// specific error) once it elapses; none may block indefinitely.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use latchkey_transport::{LockTransport, Result};
///
/// async fn unlock<T: LockTransport>(transport: &mut T) -> Result<()> {
///     let timeout = Duration::from_secs(5);
///     transport.connect(timeout).await?;
///     transport.open(timeout).await
/// }
/// ```
pub trait LockTransport: Send {
    /// Establish the link and complete any authentication.
    async fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// Tear the link down. Never fails; a link that is already gone is fine.
    async fn disconnect(&mut self);

    async fn open(&mut self, timeout: Duration) -> Result<()>;

    async fn close(&mut self, timeout: Duration) -> Result<()>;

    /// Link state as the transport itself sees it. Only `Connected` and
    /// `Disconnected` are reported here.
    fn status(&self) -> ConnectionState;

    /// Subscribe to link status changes.
    fn link_events(&self) -> watch::Receiver<LinkStatus>;

    fn info(&self) -> TransportInfo;

    /// Run the physical operation behind `action`.
    async fn execute(&mut self, action: LockAction, timeout: Duration) -> Result<()> {
        match action {
            LockAction::Open => self.open(timeout).await,
            LockAction::Close => self.close(timeout).await,
        }
    }
}
