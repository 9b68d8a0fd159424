//! Bridge reached over a serial line.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use latchkey_core::{ConnectionState, TransportKind};
use latchkey_protocol::{BridgeCodec, BridgeCommand};
use tokio::sync::watch;
use tokio_serial::SerialPortBuilderExt;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::{BridgeIo, BridgeLink};
use crate::error::{Result, TransportError};
use crate::traits::LockTransport;
use crate::types::{LinkStatus, TransportInfo};

/// Opens the byte stream behind a serial bridge.
pub trait SerialOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<Box<dyn BridgeIo>>;
}

impl<F> SerialOpener for F
where
    F: Fn(&str, u32) -> io::Result<Box<dyn BridgeIo>> + Send + Sync,
{
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<Box<dyn BridgeIo>> {
        self(path, baud_rate)
    }
}

/// Opens real serial devices.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSerial;

impl SerialOpener for SystemSerial {
    fn open(&self, path: &str, baud_rate: u32) -> io::Result<Box<dyn BridgeIo>> {
        let port = tokio_serial::new(path, baud_rate)
            .open_native_async()
            .map_err(|e| io::Error::other(e.to_string()))?;
        Ok(Box::new(port))
    }
}

/// Serial bridge transport.
///
/// `connect` opens the port and confirms the bridge answers a `STATUS`
/// request before reporting success.
pub struct SerialBridge {
    path: String,
    baud_rate: u32,
    has_prefix: bool,
    opener: Box<dyn SerialOpener>,
    link: Option<BridgeLink>,
    events: Arc<watch::Sender<LinkStatus>>,
}

impl SerialBridge {
    pub fn new(path: impl Into<String>, baud_rate: u32, has_prefix: bool) -> Self {
        Self::with_opener(path, baud_rate, has_prefix, SystemSerial)
    }

    /// Use a custom opener, e.g. an in-memory stream in tests.
    pub fn with_opener(
        path: impl Into<String>,
        baud_rate: u32,
        has_prefix: bool,
        opener: impl SerialOpener + 'static,
    ) -> Self {
        let (events, _) = watch::channel(LinkStatus::Down);
        Self {
            path: path.into(),
            baud_rate,
            has_prefix,
            opener: Box::new(opener),
            link: None,
            events: Arc::new(events),
        }
    }

    async fn request(&mut self, command: BridgeCommand, timeout: Duration) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::disconnected("serial bridge not connected"))?;

        let result = link.request(command, timeout).await;
        if matches!(result, Err(TransportError::Disconnected { .. })) {
            self.link = None;
        }
        result.map(|_| ())
    }
}

impl std::fmt::Debug for SerialBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialBridge")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("has_prefix", &self.has_prefix)
            .field("connected", &self.link.is_some())
            .finish()
    }
}

impl LockTransport for SerialBridge {
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if let Some(old) = self.link.take() {
            old.shutdown().await;
        }

        let io = self.opener.open(&self.path, self.baud_rate).map_err(|e| {
            TransportError::disconnected(format!("cannot open {}: {e}", self.path))
        })?;
        let stream = Framed::new(io, BridgeCodec::for_bridge(self.has_prefix));
        let mut link = BridgeLink::start(stream, Arc::clone(&self.events), self.path.clone());

        if let Err(e) = link.request(BridgeCommand::Status, timeout).await {
            warn!(path = %self.path, error = %e, "serial bridge did not confirm");
            link.shutdown().await;
            return Err(e);
        }

        info!(path = %self.path, baud_rate = self.baud_rate, "serial bridge connected");
        self.link = Some(link);
        self.events.send_replace(LinkStatus::Up);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            link.shutdown().await;
        }
        self.events.send_replace(LinkStatus::Down);
    }

    async fn open(&mut self, timeout: Duration) -> Result<()> {
        self.request(BridgeCommand::Open, timeout).await
    }

    async fn close(&mut self, timeout: Duration) -> Result<()> {
        self.request(BridgeCommand::Close, timeout).await
    }

    fn status(&self) -> ConnectionState {
        match &self.link {
            Some(link) if link.is_alive() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        self.events.subscribe()
    }

    fn info(&self) -> TransportInfo {
        TransportInfo::new(
            TransportKind::SerialBridge,
            format!("{}@{}", self.path, self.baud_rate),
        )
    }
}
