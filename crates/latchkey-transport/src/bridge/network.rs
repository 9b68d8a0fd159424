//! Bridge that dials in over TCP.
//!
//! The bridge firmware connects to us. Its first line must be
//! `AUTH <secret>`; we answer `WELCOME` or `DENIED`. The connection then
//! stays open and carries requests until either side drops it. A drop we
//! did not ask for is published as [`LinkStatus::Down`].

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use latchkey_core::{ConnectionState, TransportKind};
use latchkey_protocol::{BridgeCodec, BridgeCommand, BridgeMessage};
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{info, warn};

use super::{BridgeIo, BridgeLink, BridgeStream};
use crate::error::{Result, TransportError};
use crate::traits::LockTransport;
use crate::types::{LinkStatus, TransportInfo};

pub struct NetworkBridge {
    port: u16,
    secret: String,
    listener: Option<TcpListener>,
    link: Option<BridgeLink>,
    events: Arc<watch::Sender<LinkStatus>>,
}

impl NetworkBridge {
    /// Create a bridge transport listening on `port` (0 picks a free port).
    ///
    /// The socket is bound lazily, on [`listen`](Self::listen) or the first
    /// `connect`.
    pub fn new(port: u16, secret: impl Into<String>) -> Self {
        let (events, _) = watch::channel(LinkStatus::Down);
        Self {
            port,
            secret: secret.into(),
            listener: None,
            link: None,
            events: Arc::new(events),
        }
    }

    /// Bind the listening socket if needed and return its address.
    ///
    /// # Errors
    /// Returns the bind error, e.g. when the port is taken.
    pub async fn listen(&mut self) -> io::Result<SocketAddr> {
        if let Some(listener) = &self.listener {
            return listener.local_addr();
        }
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).await?;
        let addr = listener.local_addr()?;
        info!(%addr, "waiting for network bridge");
        self.listener = Some(listener);
        Ok(addr)
    }

    async fn request(&mut self, command: BridgeCommand, timeout: Duration) -> Result<()> {
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| TransportError::disconnected("network bridge not connected"))?;

        let result = link.request(command, timeout).await;
        if matches!(result, Err(TransportError::Disconnected { .. })) {
            self.link = None;
        }
        result.map(|_| ())
    }

    fn secret_matches(&self, offered: &str) -> bool {
        self.secret.as_bytes().ct_eq(offered.as_bytes()).into()
    }

    /// Accept one bridge connection and run the shared-secret handshake.
    async fn accept(&mut self, deadline: Instant, timeout: Duration) -> Result<BridgeStream> {
        self.listen()
            .await
            .map_err(|e| TransportError::disconnected(format!("cannot listen: {e}")))?;
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| TransportError::disconnected("listener unavailable"))?;

        let (socket, peer) = tokio::time::timeout_at(deadline, listener.accept())
            .await
            .map_err(|_| TransportError::timeout(timeout))??;
        // Replies are single short lines; don't let Nagle hold them back
        if let Err(e) = socket.set_nodelay(true) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }

        let io: Box<dyn BridgeIo> = Box::new(socket);
        let mut stream = Framed::new(io, BridgeCodec::new());

        let first = tokio::time::timeout_at(deadline, stream.next())
            .await
            .map_err(|_| TransportError::no_response(format!("{peer} sent no AUTH line")))?;

        match first {
            Some(Ok(BridgeMessage::Auth { secret })) if self.secret_matches(&secret) => {
                stream.send(BridgeMessage::Welcome).await?;
                info!(%peer, "network bridge authenticated");
                Ok(stream)
            }
            Some(Ok(BridgeMessage::Auth { .. })) => {
                warn!(%peer, "network bridge offered a wrong secret");
                // Best effort, the peer is dropped either way
                let _ = stream.send(BridgeMessage::Denied).await;
                Err(TransportError::auth_rejected("bridge secret mismatch"))
            }
            Some(Ok(other)) => {
                let _ = stream.send(BridgeMessage::Denied).await;
                Err(TransportError::no_response(format!(
                    "expected AUTH from {peer}, got '{other}'"
                )))
            }
            Some(Err(e)) => Err(e.into()),
            None => Err(TransportError::disconnected(format!(
                "{peer} closed before authenticating"
            ))),
        }
    }
}

impl std::fmt::Debug for NetworkBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkBridge")
            .field("port", &self.port)
            .field("connected", &self.link.is_some())
            .finish_non_exhaustive()
    }
}

impl LockTransport for NetworkBridge {
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        if let Some(old) = self.link.take() {
            old.shutdown().await;
        }

        let stream = self.accept(deadline, timeout).await?;
        self.link = Some(BridgeLink::start(
            stream,
            Arc::clone(&self.events),
            format!("tcp:{}", self.port),
        ));
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
        TransportInfo::new(TransportKind::NetworkBridge, format!("tcp:{}", self.port))
    }
}

