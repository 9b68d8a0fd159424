//! Microcontroller bridge transports.
//!
//! Both bridges speak the line protocol from [`latchkey_protocol::bridge`];
//! they differ only in how the byte stream is obtained (serial port or an
//! inbound TCP connection) and in the network bridge's shared-secret
//! handshake. [`BridgeLink`] owns an established stream: a reader task
//! routes replies to the pending request, logs events and diagnostics, and
//! publishes [`LinkStatus::Down`] when the stream ends.

pub mod network;
pub mod serial;

pub use network::NetworkBridge;
pub use serial::{SerialBridge, SerialOpener, SystemSerial};

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use latchkey_protocol::{BridgeCodec, BridgeCommand, BridgeMessage, BridgeReply};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};
use crate::types::LinkStatus;

/// Byte stream a bridge can run over.
pub trait BridgeIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> BridgeIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type BridgeStream = Framed<Box<dyn BridgeIo>, BridgeCodec>;

/// Reply reason the bridge uses when the lock refused its key.
const AUTH_FAILURE_REASON: &str = "auth";

/// Graceful close budget, per step.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(500);

const REPLY_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
enum Inbound {
    Reply { seq: u32, reply: BridgeReply },
    Malformed(String),
}

/// An established bridge connection.
pub(crate) struct BridgeLink {
    sink: SplitSink<BridgeStream, BridgeMessage>,
    replies: mpsc::Receiver<Inbound>,
    reader: JoinHandle<()>,
    next_seq: u32,
    label: String,
}

impl BridgeLink {
    /// Take over an established stream and start its reader task.
    pub(crate) fn start(
        stream: BridgeStream,
        events: Arc<watch::Sender<LinkStatus>>,
        label: impl Into<String>,
    ) -> Self {
        let label = label.into();
        let (sink, mut source) = stream.split();
        let (tx, replies) = mpsc::channel(REPLY_CHANNEL_CAPACITY);

        let reader_label = label.clone();
        let reader = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                let message = match item {
                    Ok(message) => message,
                    Err(e) => {
                        warn!(bridge = %reader_label, error = %e, "bridge stream error");
                        break;
                    }
                };

                let inbound = match message {
                    BridgeMessage::Reply { seq, reply } => Inbound::Reply { seq, reply },
                    BridgeMessage::Malformed(text) => Inbound::Malformed(text),
                    BridgeMessage::Event(text) => {
                        info!(bridge = %reader_label, event = %text, "lock event");
                        continue;
                    }
                    BridgeMessage::Diagnostic(text) => {
                        debug!(bridge = %reader_label, "{text}");
                        continue;
                    }
                    other => {
                        debug!(bridge = %reader_label, message = %other, "ignoring unexpected message");
                        continue;
                    }
                };

                // Nobody waiting is fine; the next request drains stale items
                if tx.try_send(inbound).is_err() {
                    debug!(bridge = %reader_label, "reply queue full, dropping");
                }
            }

            warn!(bridge = %reader_label, "bridge link closed");
            events.send_replace(LinkStatus::Down);
        });

        Self {
            sink,
            replies,
            reader,
            next_seq: 1,
            label,
        }
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.reader.is_finished()
    }

    /// Send one request and wait for the reply with the matching sequence.
    ///
    /// # Errors
    /// - `Timeout` if the request cannot be written in time
    /// - `NoResponse` if no matching reply arrives in time, or the reply is malformed
    /// - `Disconnected` if the stream ends
    /// - `AuthRejected` / `DeviceFault` for `ERR` replies
    pub(crate) async fn request(
        &mut self,
        command: BridgeCommand,
        timeout: Duration,
    ) -> Result<BridgeReply> {
        let deadline = Instant::now() + timeout;

        while self.replies.try_recv().is_ok() {}

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let request = BridgeMessage::request(seq, command);
        debug!(bridge = %self.label, %request, "sending");
        match tokio::time::timeout_at(deadline, self.sink.send(request)).await {
            Err(_) => return Err(TransportError::timeout(timeout)),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(())) => {}
        }

        loop {
            let inbound = match tokio::time::timeout_at(deadline, self.replies.recv()).await {
                Err(_) => {
                    return Err(TransportError::no_response(format!(
                        "no reply to request {seq} within {}ms",
                        timeout.as_millis()
                    )));
                }
                Ok(None) => return Err(TransportError::disconnected("bridge link closed")),
                Ok(Some(inbound)) => inbound,
            };

            match inbound {
                Inbound::Reply { seq: got, reply } if got == seq => {
                    return match reply {
                        BridgeReply::Err(reason) if reason == AUTH_FAILURE_REASON => Err(
                            TransportError::auth_rejected("lock rejected the bridge key"),
                        ),
                        BridgeReply::Err(reason) => Err(TransportError::device_fault(reason)),
                        ok => Ok(ok),
                    };
                }
                Inbound::Reply { seq: got, .. } => {
                    debug!(bridge = %self.label, expected = seq, got, "discarding stale reply");
                }
                Inbound::Malformed(text) => {
                    return Err(TransportError::no_response(format!(
                        "malformed reply: {text}"
                    )));
                }
            }
        }
    }

    /// Stop the reader and close the stream without publishing a link change.
    pub(crate) async fn shutdown(mut self) {
        self.reader.abort();
        if tokio::time::timeout(CLOSE_TIMEOUT, self.sink.close())
            .await
            .is_err()
        {
            debug!(bridge = %self.label, "close timed out");
        }
    }
}

impl Drop for BridgeLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
