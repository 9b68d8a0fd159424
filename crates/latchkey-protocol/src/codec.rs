//! Tokio codec for bridge line framing.
//!
//! `BridgeCodec` splits a byte stream into newline-terminated lines and
//! classifies each one:
//!
//! - With a prefix byte configured, lines starting with it are protocol
//!   traffic. Everything else is bridge diagnostic output and is returned as
//!   [`BridgeMessage::Diagnostic`]. A prefixed line that does not parse is
//!   returned as [`BridgeMessage::Malformed`] so the caller can fail the
//!   pending request instead of tearing down the stream.
//! - Without a prefix, every line is parsed and anything unrecognized is a
//!   diagnostic.
//!
//! Carriage returns before the terminator are stripped, empty lines are
//! skipped.
//!
//! # Usage with Tokio Framed
//!
//! ```rust,no_run
//! use futures::{SinkExt, StreamExt};
//! use latchkey_protocol::{BridgeCodec, BridgeCommand, BridgeMessage};
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//!
//! # async fn example() -> latchkey_protocol::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:4000").await?;
//! let mut framed = Framed::new(stream, BridgeCodec::new());
//!
//! framed.send(BridgeMessage::request(1, BridgeCommand::Status)).await?;
//! if let Some(Ok(reply)) = framed.next().await {
//!     println!("Received: {reply}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # DoS Protection
//!
//! Lines longer than the configured maximum (default 1024 bytes) are
//! rejected with [`ProtocolError::FrameTooLarge`], whether or not their
//! terminator has arrived yet.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use latchkey_core::constants::{BRIDGE_FRAME_PREFIX, MAX_BRIDGE_LINE_LEN};

use crate::bridge::BridgeMessage;
use crate::error::{ProtocolError, Result};

const LINE_TERMINATOR: u8 = b'\n';

/// Tokio codec for bridge messages.
#[derive(Debug, Clone)]
pub struct BridgeCodec {
    /// Marker byte for protocol lines, if the firmware uses one.
    prefix: Option<u8>,

    /// Maximum line length in bytes, excluding terminator.
    max_frame_size: usize,
}

impl BridgeCodec {
    /// Codec without a prefix byte.
    ///
    /// ```
    /// use latchkey_protocol::BridgeCodec;
    ///
    /// let codec = BridgeCodec::new();
    /// assert_eq!(codec.prefix(), None);
    /// ```
    pub fn new() -> Self {
        Self {
            prefix: None,
            max_frame_size: MAX_BRIDGE_LINE_LEN,
        }
    }

    /// Codec that marks protocol lines with `$`.
    pub fn with_prefix() -> Self {
        Self {
            prefix: Some(BRIDGE_FRAME_PREFIX),
            ..Self::new()
        }
    }

    /// Codec for a bridge configured with or without the prefix byte.
    pub fn for_bridge(has_prefix: bool) -> Self {
        if has_prefix {
            Self::with_prefix()
        } else {
            Self::new()
        }
    }

    /// Set a custom maximum line length.
    pub fn max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub fn prefix(&self) -> Option<u8> {
        self.prefix
    }

    pub fn frame_limit(&self) -> usize {
        self.max_frame_size
    }

    fn classify(&self, line: &[u8]) -> BridgeMessage {
        match self.prefix {
            Some(prefix) => match line.split_first() {
                Some((first, rest)) if *first == prefix => {
                    let text = String::from_utf8_lossy(rest);
                    BridgeMessage::parse_line(&text)
                        .unwrap_or_else(|_| BridgeMessage::Malformed(text.into_owned()))
                }
                _ => BridgeMessage::Diagnostic(String::from_utf8_lossy(line).into_owned()),
            },
            None => {
                let text = String::from_utf8_lossy(line);
                BridgeMessage::parse_line(&text)
                    .unwrap_or_else(|_| BridgeMessage::Diagnostic(text.into_owned()))
            }
        }
    }
}

impl Default for BridgeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for BridgeCodec {
    type Item = BridgeMessage;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == LINE_TERMINATOR) else {
                // No terminator yet; refuse to buffer an oversized line
                if src.len() > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max_size: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            let raw = src.split_to(pos + 1);
            let mut line = &raw[..pos];
            if let [head @ .., b'\r'] = line {
                line = head;
            }

            if line.len() > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: line.len(),
                    max_size: self.max_frame_size,
                });
            }

            if line.is_empty() {
                continue;
            }

            return Ok(Some(self.classify(line)));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if let Some(message) = self.decode(src)? {
            return Ok(Some(message));
        }
        // Peer closed mid-line; treat the tail as a final line
        if src.is_empty() {
            return Ok(None);
        }
        src.put_u8(LINE_TERMINATOR);
        self.decode(src)
    }
}

impl Encoder<BridgeMessage> for BridgeCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: BridgeMessage, dst: &mut BytesMut) -> Result<()> {
        let text = item.to_string();
        let prefixed = item.is_protocol() || matches!(item, BridgeMessage::Malformed(_));
        let prefix = self.prefix.filter(|_| prefixed);

        let size = text.len() + usize::from(prefix.is_some());
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max_size: self.max_frame_size,
            });
        }

        dst.reserve(size + 1);
        if let Some(prefix) = prefix {
            dst.put_u8(prefix);
        }
        dst.extend_from_slice(text.as_bytes());
        dst.put_u8(LINE_TERMINATOR);

        Ok(())
    }
}
