//! Radio link over the host Bluetooth adapter.
//!
//! Frames are written to the lock's send characteristic and arrive as
//! notifications on its notify characteristic. Adapter disconnect events
//! for our peripheral are published as [`LinkStatus::Down`].

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use btleplug::api::{
    BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{Stream, StreamExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::link::RadioLink;
use crate::error::{Result, TransportError};
use crate::types::LinkStatus;

/// GATT service exposed by the lock.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x58e06900_15d8_11e6_b737_0002a5d5c51b);
/// Host -> lock frames.
pub const SEND_UUID: Uuid = Uuid::from_u128(0x3141dd40_15db_11e6_a24b_0002a5d5c51b);
/// Lock -> host frames.
pub const NOTIFY_UUID: Uuid = Uuid::from_u128(0x359d4820_15db_11e6_82bd_0002a5d5c51b);

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

type Notifications = Pin<Box<dyn Stream<Item = ValueNotification> + Send>>;

fn ble_error(context: &str, e: btleplug::Error) -> TransportError {
    TransportError::disconnected(format!("{context}: {e}"))
}

pub struct BleLink {
    address: BDAddr,
    peripheral: Option<Peripheral>,
    send_char: Option<Characteristic>,
    notifications: Option<Notifications>,
    watcher: Option<JoinHandle<()>>,
    events: Arc<watch::Sender<LinkStatus>>,
}

impl BleLink {
    /// Create a link to the lock at `address` (`xx:xx:xx:xx:xx:xx`).
    ///
    /// # Errors
    /// Returns `Error::Config` if the address does not parse.
    pub fn new(address: &str) -> latchkey_core::Result<Self> {
        let address: BDAddr = address.parse().map_err(|e| {
            latchkey_core::Error::Config(format!("invalid radio address '{address}': {e}"))
        })?;
        let (events, _) = watch::channel(LinkStatus::Down);
        Ok(Self {
            address,
            peripheral: None,
            send_char: None,
            notifications: None,
            watcher: None,
            events: Arc::new(events),
        })
    }

    async fn adapter() -> Result<Adapter> {
        let manager = Manager::new()
            .await
            .map_err(|e| ble_error("bluetooth unavailable", e))?;
        manager
            .adapters()
            .await
            .map_err(|e| ble_error("cannot list adapters", e))?
            .into_iter()
            .next()
            .ok_or_else(|| TransportError::disconnected("no bluetooth adapter"))
    }

    /// Scan until the lock shows up. The caller bounds the wait.
    async fn find(adapter: &Adapter, address: BDAddr) -> Result<Peripheral> {
        adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| ble_error("scan failed", e))?;

        loop {
            let peripherals = adapter
                .peripherals()
                .await
                .map_err(|e| ble_error("scan failed", e))?;
            if let Some(found) = peripherals.into_iter().find(|p| p.address() == address) {
                if let Err(e) = adapter.stop_scan().await {
                    debug!(error = %e, "failed to stop scan");
                }
                return Ok(found);
            }
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
        }
    }

    /// Publish `Down` when the adapter reports our peripheral gone.
    async fn watch_disconnects(&mut self, adapter: &Adapter, peripheral: &Peripheral) -> Result<()> {
        let mut adapter_events = adapter
            .events()
            .await
            .map_err(|e| ble_error("cannot watch adapter", e))?;
        let id = peripheral.id();
        let events = Arc::clone(&self.events);
        let address = self.address;

        self.watcher = Some(tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event
                    && gone == id
                {
                    warn!(%address, "lock dropped the radio link");
                    events.send_replace(LinkStatus::Down);
                    break;
                }
            }
        }));
        Ok(())
    }

    fn teardown(&mut self) -> Option<Peripheral> {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
        self.notifications = None;
        self.send_char = None;
        self.peripheral.take()
    }
}

impl std::fmt::Debug for BleLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleLink")
            .field("address", &self.address)
            .field("connected", &self.peripheral.is_some())
            .finish_non_exhaustive()
    }
}

impl Drop for BleLink {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl RadioLink for BleLink {
    async fn connect(&mut self) -> Result<()> {
        let adapter = Self::adapter().await?;
        let peripheral = Self::find(&adapter, self.address).await?;

        peripheral
            .connect()
            .await
            .map_err(|e| ble_error("connect failed", e))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| ble_error("service discovery failed", e))?;

        let characteristics = peripheral.characteristics();
        let send_char = characteristics
            .iter()
            .find(|c| c.uuid == SEND_UUID)
            .cloned()
            .ok_or_else(|| TransportError::no_response("lock has no send characteristic"))?;
        let notify_char = characteristics
            .iter()
            .find(|c| c.uuid == NOTIFY_UUID)
            .cloned()
            .ok_or_else(|| TransportError::no_response("lock has no notify characteristic"))?;

        peripheral
            .subscribe(&notify_char)
            .await
            .map_err(|e| ble_error("subscribe failed", e))?;
        let notifications = peripheral
            .notifications()
            .await
            .map_err(|e| ble_error("notifications unavailable", e))?;

        self.watch_disconnects(&adapter, &peripheral).await?;
        self.send_char = Some(send_char);
        self.notifications = Some(notifications);
        self.peripheral = Some(peripheral);

        info!(address = %self.address, "radio link up");
        self.events.send_replace(LinkStatus::Up);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let (Some(peripheral), Some(send_char)) = (&self.peripheral, &self.send_char) else {
            return Err(TransportError::disconnected("radio link not connected"));
        };
        peripheral
            .write(send_char, frame, WriteType::WithResponse)
            .await
            .map_err(|e| ble_error("write failed", e))
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let notifications = self
            .notifications
            .as_mut()
            .ok_or_else(|| TransportError::disconnected("radio link not connected"))?;

        while let Some(notification) = notifications.next().await {
            if notification.uuid == NOTIFY_UUID {
                return Ok(notification.value);
            }
        }
        Err(TransportError::disconnected("notification stream ended"))
    }

    async fn disconnect(&mut self) {
        if let Some(peripheral) = self.teardown()
            && let Err(e) = peripheral.disconnect().await
        {
            debug!(address = %self.address, error = %e, "disconnect failed");
        }
        self.events.send_replace(LinkStatus::Down);
    }

    fn is_connected(&self) -> bool {
        self.peripheral.is_some() && *self.events.borrow() == LinkStatus::Up
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        self.events.subscribe()
    }

    fn describe(&self) -> String {
        self.address.to_string()
    }
}
