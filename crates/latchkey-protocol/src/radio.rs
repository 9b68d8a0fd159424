//! Binary frames of the lock's native radio protocol.
//!
//! Each frame is `[type][payload]`:
//!
//! | Type | Direction | Payload |
//! |------|-----------|---------|
//! | `0x02` | host -> lock | client nonce (8) |
//! | `0x03` | lock -> host | lock nonce (8) |
//! | `0x04` | host -> lock | auth tag (16) |
//! | `0x81` | lock -> host | accepted |
//! | `0x82` | lock -> host | rejected |
//! | `0x87` | host -> lock | action (1), counter (u16 BE), command tag (16) |
//! | `0x88` | lock -> host | counter (u16 BE), status (1) |
//!
//! Tags are HMAC-SHA256 keyed by the preshared device key, truncated to
//! 16 bytes.

use std::fmt;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use latchkey_core::LockAction;
use latchkey_core::constants::DEVICE_KEY_LEN;

use crate::error::{ProtocolError, Result};

type HmacSha256 = Hmac<Sha256>;

pub const NONCE_LEN: usize = 8;
pub const TAG_LEN: usize = 16;

pub type Nonce = [u8; NONCE_LEN];
pub type Tag = [u8; TAG_LEN];

const TYPE_CONNECTION_REQUEST: u8 = 0x02;
const TYPE_CONNECTION_INFO: u8 = 0x03;
const TYPE_AUTHENTICATE: u8 = 0x04;
const TYPE_ACCEPTED: u8 = 0x81;
const TYPE_REJECTED: u8 = 0x82;
const TYPE_COMMAND: u8 = 0x87;
const TYPE_COMMAND_RESULT: u8 = 0x88;

const ACTION_CLOSE: u8 = 0x00;
const ACTION_OPEN: u8 = 0x01;

/// Preshared key of one lock.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceKey([u8; DEVICE_KEY_LEN]);

impl DeviceKey {
    pub fn new(bytes: [u8; DEVICE_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse a key given as 32 hex characters.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidKey` for bad hex or wrong length.
    pub fn from_hex(text: &str) -> Result<Self> {
        let bytes = hex::decode(text.trim())
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        let bytes: [u8; DEVICE_KEY_LEN] = bytes.try_into().map_err(|v: Vec<u8>| {
            ProtocolError::InvalidKey(format!(
                "expected {DEVICE_KEY_LEN} bytes, got {}",
                v.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    fn mac(&self) -> Result<HmacSha256> {
        HmacSha256::new_from_slice(&self.0).map_err(|e| ProtocolError::InvalidKey(e.to_string()))
    }

    /// Tag proving knowledge of the key for one handshake.
    ///
    /// # Errors
    /// Only fails if the MAC cannot be keyed.
    pub fn auth_tag(&self, client_nonce: &Nonce, lock_nonce: &Nonce) -> Result<Tag> {
        let mut mac = self.mac()?;
        mac.update(b"auth");
        mac.update(client_nonce);
        mac.update(lock_nonce);
        Ok(truncate(mac))
    }

    /// Tag binding a command to the current session and counter.
    ///
    /// # Errors
    /// Only fails if the MAC cannot be keyed.
    pub fn command_tag(&self, lock_nonce: &Nonce, counter: u16, action: LockAction) -> Result<Tag> {
        let mut mac = self.mac()?;
        mac.update(b"cmd");
        mac.update(lock_nonce);
        mac.update(&counter.to_be_bytes());
        mac.update(&[action_byte(action)]);
        Ok(truncate(mac))
    }
}

impl fmt::Debug for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DeviceKey(..)")
    }
}

fn truncate(mac: HmacSha256) -> Tag {
    let full = mac.finalize().into_bytes();
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&full[..TAG_LEN]);
    tag
}

/// Constant-time tag comparison.
pub fn tags_match(a: &Tag, b: &Tag) -> bool {
    a.ct_eq(b).into()
}

fn action_byte(action: LockAction) -> u8 {
    match action {
        LockAction::Open => ACTION_OPEN,
        LockAction::Close => ACTION_CLOSE,
    }
}

/// Outcome byte of a command result frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStatus {
    Ok,
    Fault,
    AuthFailed,
}

impl CommandStatus {
    fn to_byte(self) -> u8 {
        match self {
            CommandStatus::Ok => 0,
            CommandStatus::Fault => 1,
            CommandStatus::AuthFailed => 2,
        }
    }

    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            0 => Ok(CommandStatus::Ok),
            1 => Ok(CommandStatus::Fault),
            2 => Ok(CommandStatus::AuthFailed),
            other => Err(ProtocolError::InvalidRadioFrame(format!(
                "unknown status byte 0x{other:02x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioFrame {
    ConnectionRequest { client_nonce: Nonce },
    ConnectionInfo { lock_nonce: Nonce },
    Authenticate { tag: Tag },
    Accepted,
    Rejected,
    Command { action: LockAction, counter: u16, tag: Tag },
    CommandResult { counter: u16, status: CommandStatus },
}

impl RadioFrame {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + 1 + 2 + TAG_LEN);
        match self {
            RadioFrame::ConnectionRequest { client_nonce } => {
                out.push(TYPE_CONNECTION_REQUEST);
                out.extend_from_slice(client_nonce);
            }
            RadioFrame::ConnectionInfo { lock_nonce } => {
                out.push(TYPE_CONNECTION_INFO);
                out.extend_from_slice(lock_nonce);
            }
            RadioFrame::Authenticate { tag } => {
                out.push(TYPE_AUTHENTICATE);
                out.extend_from_slice(tag);
            }
            RadioFrame::Accepted => out.push(TYPE_ACCEPTED),
            RadioFrame::Rejected => out.push(TYPE_REJECTED),
            RadioFrame::Command {
                action,
                counter,
                tag,
            } => {
                out.push(TYPE_COMMAND);
                out.push(action_byte(*action));
                out.extend_from_slice(&counter.to_be_bytes());
                out.extend_from_slice(tag);
            }
            RadioFrame::CommandResult { counter, status } => {
                out.push(TYPE_COMMAND_RESULT);
                out.extend_from_slice(&counter.to_be_bytes());
                out.push(status.to_byte());
            }
        }
        out
    }

    /// Decode one frame.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidRadioFrame` for unknown types and
    /// payloads of the wrong length.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&kind, payload) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::InvalidRadioFrame("empty frame".to_string()))?;

        match kind {
            TYPE_CONNECTION_REQUEST => Ok(RadioFrame::ConnectionRequest {
                client_nonce: fixed(payload, kind)?,
            }),
            TYPE_CONNECTION_INFO => Ok(RadioFrame::ConnectionInfo {
                lock_nonce: fixed(payload, kind)?,
            }),
            TYPE_AUTHENTICATE => Ok(RadioFrame::Authenticate {
                tag: fixed(payload, kind)?,
            }),
            TYPE_ACCEPTED => {
                expect_empty(payload, kind)?;
                Ok(RadioFrame::Accepted)
            }
            TYPE_REJECTED => {
                expect_empty(payload, kind)?;
                Ok(RadioFrame::Rejected)
            }
            TYPE_COMMAND => {
                let body: [u8; 1 + 2 + TAG_LEN] = fixed(payload, kind)?;
                let action = match body[0] {
                    ACTION_OPEN => LockAction::Open,
                    ACTION_CLOSE => LockAction::Close,
                    other => {
                        return Err(ProtocolError::InvalidRadioFrame(format!(
                            "unknown action byte 0x{other:02x}"
                        )));
                    }
                };
                let mut tag = [0u8; TAG_LEN];
                tag.copy_from_slice(&body[3..]);
                Ok(RadioFrame::Command {
                    action,
                    counter: u16::from_be_bytes([body[1], body[2]]),
                    tag,
                })
            }
            TYPE_COMMAND_RESULT => {
                let body: [u8; 3] = fixed(payload, kind)?;
                Ok(RadioFrame::CommandResult {
                    counter: u16::from_be_bytes([body[0], body[1]]),
                    status: CommandStatus::from_byte(body[2])?,
                })
            }
            other => Err(ProtocolError::InvalidRadioFrame(format!(
                "unknown frame type 0x{other:02x}"
            ))),
        }
    }
}

fn fixed<const N: usize>(payload: &[u8], kind: u8) -> Result<[u8; N]> {
    payload.try_into().map_err(|_| {
        ProtocolError::InvalidRadioFrame(format!(
            "frame 0x{kind:02x} expects {N} payload bytes, got {}",
            payload.len()
        ))
    })
}

fn expect_empty(payload: &[u8], kind: u8) -> Result<()> {
    fixed::<0>(payload, kind).map(|_| ())
}
