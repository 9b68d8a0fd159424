//! Frame carriers for the native radio protocol.

#![allow(async_fn_in_trait)]

use tokio::sync::watch;

use super::sim::SimulatedLink;
#[cfg(feature = "radio-ble")]
use super::ble::BleLink;
use crate::error::Result;
use crate::types::LinkStatus;

/// Moves raw radio frames to and from one lock.
///
/// Implementations do not interpret frames and do not apply timeouts; the
/// caller bounds every call.
pub trait RadioLink: Send {
    async fn connect(&mut self) -> Result<()>;

    async fn send(&mut self, frame: &[u8]) -> Result<()>;

    /// Wait for the next frame from the lock.
    async fn recv(&mut self) -> Result<Vec<u8>>;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    fn link_events(&self) -> watch::Receiver<LinkStatus>;

    fn describe(&self) -> String;
}

/// Enum wrapper for radio link dispatch.
#[derive(Debug)]
#[non_exhaustive]
pub enum AnyRadioLink {
    /// In-process lock used by tests and demos.
    Simulated(SimulatedLink),
    /// Host Bluetooth adapter.
    #[cfg(feature = "radio-ble")]
    Ble(BleLink),
}

impl RadioLink for AnyRadioLink {
    async fn connect(&mut self) -> Result<()> {
        match self {
            Self::Simulated(link) => link.connect().await,
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.connect().await,
        }
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        match self {
            Self::Simulated(link) => link.send(frame).await,
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.send(frame).await,
        }
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        match self {
            Self::Simulated(link) => link.recv().await,
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.recv().await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Self::Simulated(link) => link.disconnect().await,
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.disconnect().await,
        }
    }

    fn is_connected(&self) -> bool {
        match self {
            Self::Simulated(link) => link.is_connected(),
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.is_connected(),
        }
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        match self {
            Self::Simulated(link) => link.link_events(),
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.link_events(),
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Simulated(link) => link.describe(),
            #[cfg(feature = "radio-ble")]
            Self::Ble(link) => link.describe(),
        }
    }
}
