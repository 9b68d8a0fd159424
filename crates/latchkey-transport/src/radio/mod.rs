//! Native radio transport.
//!
//! The host speaks the lock's own protocol over a [`RadioLink`]. Every
//! `connect` starts from scratch: fresh link, fresh nonces, fresh
//! handshake. Commands are only accepted inside an authenticated session
//! and carry a strictly increasing counter bound into their tag.

pub mod link;
pub mod sim;

#[cfg(feature = "radio-ble")]
pub mod ble;

pub use link::{AnyRadioLink, RadioLink};
pub use sim::{SimulatedLink, SimulatedLockHandle};

#[cfg(feature = "radio-ble")]
pub use ble::BleLink;

use std::time::Duration;

use latchkey_core::{ConnectionState, LockAction, TransportKind};
use latchkey_protocol::{CommandStatus, DeviceKey, Nonce, RadioFrame};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::traits::LockTransport;
use crate::types::{LinkStatus, TransportInfo};

#[derive(Debug, Clone, Copy)]
struct RadioSession {
    lock_nonce: Nonce,
    counter: u16,
}

/// Transport driving a lock directly over its radio protocol.
#[derive(Debug)]
pub struct NativeRadio {
    link: AnyRadioLink,
    key: DeviceKey,
    session: Option<RadioSession>,
}

impl NativeRadio {
    pub fn new(link: AnyRadioLink, key: DeviceKey) -> Self {
        Self {
            link,
            key,
            session: None,
        }
    }

    /// Native radio over an in-process simulated lock that trusts `key`.
    pub fn simulated(key: DeviceKey) -> (Self, SimulatedLockHandle) {
        let (link, handle) = SimulatedLink::new(key.clone());
        (Self::new(AnyRadioLink::Simulated(link), key), handle)
    }

    /// Next frame the link delivers that decodes; garbage is skipped.
    async fn recv_frame(&mut self) -> Result<RadioFrame> {
        loop {
            let bytes = self.link.recv().await?;
            match RadioFrame::decode(&bytes) {
                Ok(frame) => return Ok(frame),
                Err(e) => debug!(error = %e, "ignoring undecodable radio frame"),
            }
        }
    }

    async fn handshake(&mut self) -> Result<RadioSession> {
        self.link.connect().await?;

        let client_nonce: Nonce = rand::random();
        self.link
            .send(&RadioFrame::ConnectionRequest { client_nonce }.to_bytes())
            .await?;

        let lock_nonce = loop {
            match self.recv_frame().await? {
                RadioFrame::ConnectionInfo { lock_nonce } => break lock_nonce,
                other => debug!(frame = ?other, "unexpected frame before connection info"),
            }
        };

        let tag = self.key.auth_tag(&client_nonce, &lock_nonce)?;
        self.link
            .send(&RadioFrame::Authenticate { tag }.to_bytes())
            .await?;

        loop {
            match self.recv_frame().await? {
                RadioFrame::Accepted => {
                    return Ok(RadioSession {
                        lock_nonce,
                        counter: 0,
                    });
                }
                RadioFrame::Rejected => {
                    return Err(TransportError::auth_rejected(
                        "lock rejected the device key",
                    ));
                }
                other => debug!(frame = ?other, "unexpected frame during authentication"),
            }
        }
    }

    async fn exchange(&mut self, frame: RadioFrame, counter: u16) -> Result<CommandStatus> {
        self.link.send(&frame.to_bytes()).await?;
        loop {
            match self.recv_frame().await? {
                RadioFrame::CommandResult {
                    counter: got,
                    status,
                } if got == counter => return Ok(status),
                other => debug!(frame = ?other, expected = counter, "discarding radio frame"),
            }
        }
    }

    async fn drop_session(&mut self) {
        self.session = None;
        self.link.disconnect().await;
    }

    async fn command(&mut self, action: LockAction, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        if !self.link.is_connected() {
            self.session = None;
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| TransportError::disconnected("no radio session"))?;

        let Some(counter) = session.counter.checked_add(1) else {
            self.drop_session().await;
            return Err(TransportError::disconnected(
                "command counter exhausted, reconnect required",
            ));
        };
        session.counter = counter;
        let lock_nonce = session.lock_nonce;

        let tag = self.key.command_tag(&lock_nonce, counter, action)?;
        let frame = RadioFrame::Command {
            action,
            counter,
            tag,
        };
        debug!(%action, counter, "sending radio command");

        match tokio::time::timeout_at(deadline, self.exchange(frame, counter)).await {
            Err(_) => Err(TransportError::timeout(timeout)),
            Ok(Ok(CommandStatus::Ok)) => Ok(()),
            Ok(Ok(CommandStatus::Fault)) => Err(TransportError::device_fault(format!(
                "lock could not {action}"
            ))),
            Ok(Ok(CommandStatus::AuthFailed)) => {
                warn!(%action, counter, "lock refused command authentication");
                self.drop_session().await;
                Err(TransportError::auth_rejected("lock refused the command tag"))
            }
            Ok(Err(e)) => {
                if matches!(e, TransportError::Disconnected { .. }) {
                    self.session = None;
                }
                Err(e)
            }
        }
    }
}

impl LockTransport for NativeRadio {
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        self.session = None;
        if self.link.is_connected() {
            self.link.disconnect().await;
        }

        match tokio::time::timeout_at(deadline, self.handshake()).await {
            Ok(Ok(session)) => {
                info!(link = %self.link.describe(), "radio session established");
                self.session = Some(session);
                Ok(())
            }
            Ok(Err(e)) => {
                if matches!(e, TransportError::AuthRejected { .. }) {
                    warn!(link = %self.link.describe(), "radio handshake rejected");
                }
                self.link.disconnect().await;
                Err(e)
            }
            Err(_) => {
                self.link.disconnect().await;
                Err(TransportError::timeout(timeout))
            }
        }
    }

    async fn disconnect(&mut self) {
        self.drop_session().await;
    }

    async fn open(&mut self, timeout: Duration) -> Result<()> {
        self.command(LockAction::Open, timeout).await
    }

    async fn close(&mut self, timeout: Duration) -> Result<()> {
        self.command(LockAction::Close, timeout).await
    }

    fn status(&self) -> ConnectionState {
        if self.session.is_some() && self.link.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        self.link.link_events()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo::new(TransportKind::NativeRadio, self.link.describe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn key() -> DeviceKey {
        DeviceKey::new([7; 16])
    }

    #[tokio::test]
    async fn test_handshake_then_commands() {
        let (mut radio, lock) = NativeRadio::simulated(key());

        assert_eq!(radio.status(), ConnectionState::Disconnected);
        radio.connect(TIMEOUT).await.unwrap();
        assert_eq!(radio.status(), ConnectionState::Connected);

        radio.open(TIMEOUT).await.unwrap();
        assert!(lock.is_open());
        radio.close(TIMEOUT).await.unwrap();
        assert!(!lock.is_open());
        assert_eq!(lock.commands(), 2);
    }

    #[tokio::test]
    async fn test_wrong_key_is_auth_rejected() {
        let (link, lock) = SimulatedLink::new(key());
        let mut radio = NativeRadio::new(AnyRadioLink::Simulated(link), DeviceKey::new([9; 16]));

        let err = radio.connect(TIMEOUT).await.unwrap_err();
        assert!(matches!(err, TransportError::AuthRejected { .. }));
        assert_eq!(radio.status(), ConnectionState::Disconnected);
        assert_eq!(lock.handshakes(), 1);
    }

    #[tokio::test]
    async fn test_rejection_forces_fresh_connect() {
        let (mut radio, lock) = NativeRadio::simulated(key());
        lock.set_reject_auth(true);
        assert!(radio.connect(TIMEOUT).await.is_err());

        // Commands are refused until a new handshake succeeds
        assert!(matches!(
            radio.open(TIMEOUT).await,
            Err(TransportError::Disconnected { .. })
        ));

        lock.set_reject_auth(false);
        radio.connect(TIMEOUT).await.unwrap();
        radio.open(TIMEOUT).await.unwrap();
        assert_eq!(lock.handshakes(), 2);
    }

    #[tokio::test]
    async fn test_actuation_fault_keeps_session() {
        let (mut radio, lock) = NativeRadio::simulated(key());
        radio.connect(TIMEOUT).await.unwrap();
        lock.set_fault(true);

        assert!(matches!(
            radio.open(TIMEOUT).await,
            Err(TransportError::DeviceFault { .. })
        ));
        assert_eq!(radio.status(), ConnectionState::Connected);

        lock.set_fault(false);
        radio.open(TIMEOUT).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_lock_times_out() {
        let (mut radio, lock) = NativeRadio::simulated(key());
        lock.set_silent(true);

        assert_eq!(
            radio.connect(Duration::from_millis(200)).await,
            Err(TransportError::Timeout { duration_ms: 200 })
        );

        lock.set_silent(false);
        radio.connect(TIMEOUT).await.unwrap();
        lock.set_silent(true);
        assert_eq!(
            radio.close(Duration::from_millis(300)).await,
            Err(TransportError::Timeout { duration_ms: 300 })
        );
    }

    #[tokio::test]
    async fn test_out_of_range_is_disconnected() {
        let (mut radio, lock) = NativeRadio::simulated(key());
        let mut events = radio.link_events();
        radio.connect(TIMEOUT).await.unwrap();

        lock.drop_link();
        events.changed().await.unwrap();
        assert_eq!(*events.borrow(), LinkStatus::Down);
        assert_eq!(radio.status(), ConnectionState::Disconnected);
        assert!(matches!(
            radio.open(TIMEOUT).await,
            Err(TransportError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_lock_fails_connect() {
        let (mut radio, lock) = NativeRadio::simulated(key());
        lock.set_unreachable(true);

        assert!(matches!(
            radio.connect(TIMEOUT).await,
            Err(TransportError::Disconnected { .. })
        ));
        assert_eq!(lock.handshakes(), 0);
    }

    #[tokio::test]
    async fn test_reconnect_starts_new_session() {
        let (mut radio, lock) = NativeRadio::simulated(key());
        radio.connect(TIMEOUT).await.unwrap();
        radio.open(TIMEOUT).await.unwrap();

        radio.connect(TIMEOUT).await.unwrap();
        radio.close(TIMEOUT).await.unwrap();
        assert_eq!(lock.handshakes(), 2);
        assert_eq!(lock.commands(), 2);
    }
}
