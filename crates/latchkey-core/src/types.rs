use crate::{Result, error::Error};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A physical site served by one lock, with its own credential file.
///
/// The set is fixed. Codes are the short identifiers used on the command
/// line, in configuration files and in the request layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Location {
    Unit1,
    Unit2,
    Workshop,
}

impl Location {
    /// All known locations in display order.
    pub const ALL: [Location; 3] = [Location::Unit1, Location::Unit2, Location::Workshop];

    /// Short code (`1`, `2`, `w`).
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Location::Unit1 => "1",
            Location::Unit2 => "2",
            Location::Workshop => "w",
        }
    }

    /// Human-readable name shown to users.
    #[must_use]
    pub fn display_name(&self) -> &'static str {
        match self {
            Location::Unit1 => "Einheit 1",
            Location::Unit2 => "Einheit 2",
            Location::Workshop => "Werkstatt",
        }
    }

    /// Credential file name, relative to the data directory.
    #[must_use]
    pub fn users_file(&self) -> &'static str {
        match self {
            Location::Unit1 => "users.json",
            Location::Unit2 => "users-einheit2.json",
            Location::Workshop => "users-werkstatt.json",
        }
    }

    /// Audit log file name, relative to the data directory.
    #[must_use]
    pub fn audit_file(&self) -> &'static str {
        match self {
            Location::Unit1 => "log.txt",
            Location::Unit2 => "log-einheit2.txt",
            Location::Workshop => "log-werkstatt.txt",
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Location {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "1" => Ok(Location::Unit1),
            "2" => Ok(Location::Unit2),
            "w" | "W" => Ok(Location::Workshop),
            other => Err(Error::UnknownLocation(other.to_string())),
        }
    }
}

impl TryFrom<String> for Location {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Location> for String {
    fn from(location: Location) -> Self {
        location.code().to_string()
    }
}

/// Normalized user name.
///
/// Names are trimmed and lowercased so that `Alice` and ` alice ` refer to
/// the same record. Inner spaces are allowed (`max mustermann`).
///
/// Names read back from files go through [`UserName::from_stored`], which
/// normalizes but never rejects, so one odd legacy record cannot make a
/// whole credential file unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct UserName(String);

impl UserName {
    /// Create a new user name with normalization and validation.
    ///
    /// # Errors
    /// Returns `Error::InvalidUserName` if the name is empty after trimming,
    /// or contains control characters.
    pub fn new(name: &str) -> Result<Self> {
        let name = Self::from_stored(name);

        if name.0.is_empty() {
            return Err(Error::InvalidUserName("name must not be empty".to_string()));
        }

        if name.0.chars().any(char::is_control) {
            return Err(Error::InvalidUserName(format!(
                "'{}' contains control characters",
                name.0.escape_debug()
            )));
        }

        Ok(name)
    }

    /// Normalize a name as found in an existing file, without validation.
    #[must_use]
    pub fn from_stored(name: &str) -> Self {
        UserName(name.trim().to_lowercase())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for UserName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        UserName::new(s)
    }
}

impl From<String> for UserName {
    fn from(value: String) -> Self {
        UserName::from_stored(&value)
    }
}

impl From<UserName> for String {
    fn from(name: UserName) -> Self {
        name.0
    }
}

impl AsRef<str> for UserName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Coarse link state of one lock, as seen by callers.
///
/// # Valid Transitions
///
/// - Disconnected → Connecting
/// - Connecting → Connected / Error / Disconnected
/// - Connected → Busy / Error / Disconnected
/// - Busy → Connected / Error / Disconnected
/// - Error → Connecting / Disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// A command is being executed against the transport.
    Busy,
    /// The last connect attempt failed; a retry is scheduled.
    Error,
}

impl ConnectionState {
    /// Check if a transition to `target` is legal from this state.
    ///
    /// ```
    /// use latchkey_core::ConnectionState;
    ///
    /// assert!(ConnectionState::Disconnected.can_transition_to(&ConnectionState::Connecting));
    /// assert!(!ConnectionState::Disconnected.can_transition_to(&ConnectionState::Busy));
    /// ```
    pub fn can_transition_to(&self, target: &ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, target),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Disconnected)
                | (Connected, Busy | Error | Disconnected)
                | (Busy, Connected | Error | Disconnected)
                | (Error, Connecting | Disconnected)
        )
    }

    /// Whether a command may be sent in this state.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Busy => "Busy",
            ConnectionState::Error => "Error",
        };
        write!(f, "{s}")
    }
}

/// Physical actuation requested from a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockAction {
    Open,
    Close,
}

impl LockAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            LockAction::Open => "open",
            LockAction::Close => "close",
        }
    }
}

impl fmt::Display for LockAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(LockAction::Open),
            "close" => Ok(LockAction::Close),
            other => Err(Error::Config(format!("unknown lock action: {other}"))),
        }
    }
}

/// Kind of command accepted by the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Open,
    Close,
    Status,
}

impl CommandKind {
    /// The actuation behind this command, `None` for `Status`.
    #[must_use]
    pub fn action(&self) -> Option<LockAction> {
        match self {
            CommandKind::Open => Some(LockAction::Open),
            CommandKind::Close => Some(LockAction::Close),
            CommandKind::Status => None,
        }
    }
}

impl From<LockAction> for CommandKind {
    fn from(action: LockAction) -> Self {
        match action {
            LockAction::Open => CommandKind::Open,
            LockAction::Close => CommandKind::Close,
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            CommandKind::Open => "open",
            CommandKind::Close => "close",
            CommandKind::Status => "status",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of an open or close command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum CommandOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
}

impl CommandOutcome {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, CommandOutcome::Succeeded)
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandOutcome::Succeeded => f.write_str("succeeded"),
            CommandOutcome::Failed(reason) => write!(f, "failed: {reason}"),
            CommandOutcome::TimedOut => f.write_str("timed-out"),
        }
    }
}

/// Physical path used to reach a lock. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    NativeRadio,
    SerialBridge,
    NetworkBridge,
    MockSuccess,
    MockFault,
    MockDisconnected,
}

impl TransportKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::NativeRadio => "native-radio",
            TransportKind::SerialBridge => "serial-bridge",
            TransportKind::NetworkBridge => "network-bridge",
            TransportKind::MockSuccess => "mock-success",
            TransportKind::MockFault => "mock-fault",
            TransportKind::MockDisconnected => "mock-disconnected",
        }
    }

    /// Whether this is one of the simulated backends.
    #[must_use]
    pub fn is_mock(&self) -> bool {
        matches!(
            self,
            TransportKind::MockSuccess | TransportKind::MockFault | TransportKind::MockDisconnected
        )
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "native-radio" => Ok(TransportKind::NativeRadio),
            "serial-bridge" => Ok(TransportKind::SerialBridge),
            "network-bridge" => Ok(TransportKind::NetworkBridge),
            "mock-success" => Ok(TransportKind::MockSuccess),
            "mock-fault" => Ok(TransportKind::MockFault),
            "mock-disconnected" => Ok(TransportKind::MockDisconnected),
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }
}
