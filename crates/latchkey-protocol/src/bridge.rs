//! Line grammar spoken by the serial and network bridges.
//!
//! Every protocol message is a single ASCII line:
//!
//! ```text
//! AUTH <secret>            bridge -> host, network bridge only, first line
//! WELCOME | DENIED         host -> bridge, answer to AUTH
//! REQ <seq> OPEN|CLOSE|STATUS
//! ACK <seq> OK
//! ACK <seq> ERR <reason>
//! ACK <seq> STATE <text>
//! EVT <text>               unsolicited lock event
//! ```
//!
//! Framing (terminator and optional prefix byte) is handled by
//! [`BridgeCodec`](crate::BridgeCodec); this module only deals with the
//! text between them.

use std::fmt;
use std::str::FromStr;

use latchkey_core::LockAction;

use crate::error::{ProtocolError, Result};

/// Command carried by a `REQ` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeCommand {
    Open,
    Close,
    Status,
}

impl BridgeCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeCommand::Open => "OPEN",
            BridgeCommand::Close => "CLOSE",
            BridgeCommand::Status => "STATUS",
        }
    }
}

impl From<LockAction> for BridgeCommand {
    fn from(action: LockAction) -> Self {
        match action {
            LockAction::Open => BridgeCommand::Open,
            LockAction::Close => BridgeCommand::Close,
        }
    }
}

impl FromStr for BridgeCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "OPEN" => Ok(BridgeCommand::Open),
            "CLOSE" => Ok(BridgeCommand::Close),
            "STATUS" => Ok(BridgeCommand::Status),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown command '{other}'"
            ))),
        }
    }
}

/// Body of an `ACK` line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeReply {
    Ok,
    Err(String),
    State(String),
}

/// A decoded bridge line.
///
/// `Diagnostic` and `Malformed` never come from a well-behaved peer as
/// protocol traffic: the codec produces them for free-form bridge output
/// and for prefixed lines that fail to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeMessage {
    Auth { secret: String },
    Welcome,
    Denied,
    Request { seq: u32, command: BridgeCommand },
    Reply { seq: u32, reply: BridgeReply },
    Event(String),
    /// Free-form output from the bridge firmware.
    Diagnostic(String),
    /// A line marked as protocol traffic that could not be parsed.
    Malformed(String),
}

impl BridgeMessage {
    pub fn request(seq: u32, command: BridgeCommand) -> Self {
        BridgeMessage::Request { seq, command }
    }

    pub fn reply(seq: u32, reply: BridgeReply) -> Self {
        BridgeMessage::Reply { seq, reply }
    }

    /// Whether this line belongs to the protocol (as opposed to bridge chatter).
    pub fn is_protocol(&self) -> bool {
        !matches!(
            self,
            BridgeMessage::Diagnostic(_) | BridgeMessage::Malformed(_)
        )
    }

    /// Parse the text of one protocol line, without prefix or terminator.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidMessage` if the line does not match the
    /// grammar.
    pub fn parse_line(line: &str) -> Result<Self> {
        let (keyword, rest) = match line.split_once(' ') {
            Some((k, r)) => (k, Some(r)),
            None => (line, None),
        };

        match (keyword, rest) {
            ("AUTH", Some(secret)) if !secret.is_empty() => Ok(BridgeMessage::Auth {
                secret: secret.to_string(),
            }),
            ("WELCOME", None) => Ok(BridgeMessage::Welcome),
            ("DENIED", None) => Ok(BridgeMessage::Denied),
            ("REQ", Some(rest)) => {
                let (seq, command) = rest
                    .split_once(' ')
                    .ok_or_else(|| invalid(line, "missing command"))?;
                Ok(BridgeMessage::Request {
                    seq: parse_seq(seq, line)?,
                    command: command.parse()?,
                })
            }
            ("ACK", Some(rest)) => {
                let (seq, body) = match rest.split_once(' ') {
                    Some((s, b)) => (s, b),
                    None => return Err(invalid(line, "missing reply")),
                };
                let seq = parse_seq(seq, line)?;
                let reply = match body.split_once(' ') {
                    None if body == "OK" => BridgeReply::Ok,
                    Some(("ERR", reason)) => BridgeReply::Err(reason.to_string()),
                    Some(("STATE", text)) => BridgeReply::State(text.to_string()),
                    _ => return Err(invalid(line, "unknown reply")),
                };
                Ok(BridgeMessage::Reply { seq, reply })
            }
            ("EVT", Some(text)) => Ok(BridgeMessage::Event(text.to_string())),
            _ => Err(invalid(line, "unrecognized line")),
        }
    }
}

fn parse_seq(seq: &str, line: &str) -> Result<u32> {
    seq.parse()
        .map_err(|_| invalid(line, "sequence number is not an integer"))
}

fn invalid(line: &str, reason: &str) -> ProtocolError {
    ProtocolError::InvalidMessage(format!("{reason}: '{line}'"))
}

impl fmt::Display for BridgeMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeMessage::Auth { secret } => write!(f, "AUTH {secret}"),
            BridgeMessage::Welcome => f.write_str("WELCOME"),
            BridgeMessage::Denied => f.write_str("DENIED"),
            BridgeMessage::Request { seq, command } => {
                write!(f, "REQ {seq} {}", command.as_str())
            }
            BridgeMessage::Reply { seq, reply } => match reply {
                BridgeReply::Ok => write!(f, "ACK {seq} OK"),
                BridgeReply::Err(reason) => write!(f, "ACK {seq} ERR {reason}"),
                BridgeReply::State(text) => write!(f, "ACK {seq} STATE {text}"),
            },
            BridgeMessage::Event(text) => write!(f, "EVT {text}"),
            BridgeMessage::Diagnostic(text) | BridgeMessage::Malformed(text) => f.write_str(text),
        }
    }
}

impl FromStr for BridgeMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        BridgeMessage::parse_line(s)
    }
}
