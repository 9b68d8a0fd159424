//! Startup configuration.
//!
//! The configuration is read once from a TOML file, validated, and then
//! handed by reference to the components that need it. Nothing re-reads it
//! while the process runs.
//!
//! ```toml
//! session_secret = "change-me"
//! data_dir = "/var/lib/latchkey"
//!
//! [[locks]]
//! location = "1"
//! [locks.transport]
//! kind = "serial-bridge"
//! path = "/dev/ttyUSB0"
//! ```

use crate::constants::*;
use crate::{Location, Result, TransportKind, error::Error};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Process-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Key for signing session tokens.
    pub session_secret: String,

    /// Directory holding credential files, audit logs and lifetime rules.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub timeouts: TimeoutSettings,

    #[serde(default)]
    pub backoff: BackoffSettings,

    /// One entry per served location.
    #[serde(default)]
    pub locks: Vec<LockConfig>,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(DEFAULT_DATA_DIR)
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub ttl_secs: u64,
    pub login_timeout_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
            login_timeout_ms: DEFAULT_LOGIN_TIMEOUT_MS,
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Bound on one connect attempt.
    pub connect_ms: u64,
    /// Bound on one open/close attempt.
    pub command_ms: u64,
    /// How long a command waits for the lock to become `Connected`.
    pub connect_wait_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            command_ms: DEFAULT_COMMAND_TIMEOUT_MS,
            connect_wait_ms: DEFAULT_CONNECT_WAIT_MS,
        }
    }
}

impl TimeoutSettings {
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    #[must_use]
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    #[must_use]
    pub fn connect_wait(&self) -> Duration {
        Duration::from_millis(self.connect_wait_ms)
    }
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffSettings {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: f64,
}

impl Default for BackoffSettings {
    fn default() -> Self {
        Self {
            initial_ms: DEFAULT_BACKOFF_INITIAL_MS,
            max_ms: DEFAULT_BACKOFF_MAX_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

/// One lock and the path used to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    pub location: Location,

    /// Start connecting as soon as the service starts.
    #[serde(default = "default_true")]
    pub auto_connect: bool,

    pub transport: TransportConfig,
}

impl LockConfig {
    pub fn new(location: Location, transport: TransportConfig) -> Self {
        Self {
            location,
            auto_connect: true,
            transport,
        }
    }

    /// Set whether the lock connects at startup
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.auto_connect = auto_connect;
        self
    }
}

/// Transport selection and its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TransportConfig {
    NativeRadio {
        /// Radio MAC address, `xx:xx:xx:xx:xx:xx`.
        address: String,
        /// Preshared device key as 32 hex characters.
        device_key: String,
    },
    SerialBridge {
        #[serde(default = "default_serial_path")]
        path: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_true")]
        has_prefix: bool,
    },
    NetworkBridge {
        #[serde(default = "default_bridge_port")]
        port: u16,
        secret: String,
    },
    MockSuccess,
    MockFault,
    MockDisconnected,
}

fn default_serial_path() -> String {
    DEFAULT_SERIAL_PATH.to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_SERIAL_BAUD_RATE
}

fn default_bridge_port() -> u16 {
    DEFAULT_BRIDGE_PORT
}

impl TransportConfig {
    #[must_use]
    pub fn kind(&self) -> TransportKind {
        match self {
            TransportConfig::NativeRadio { .. } => TransportKind::NativeRadio,
            TransportConfig::SerialBridge { .. } => TransportKind::SerialBridge,
            TransportConfig::NetworkBridge { .. } => TransportKind::NetworkBridge,
            TransportConfig::MockSuccess => TransportKind::MockSuccess,
            TransportConfig::MockFault => TransportKind::MockFault,
            TransportConfig::MockDisconnected => TransportKind::MockDisconnected,
        }
    }

    /// Check the variant's parameters.
    ///
    /// # Errors
    /// Returns `Error::Config` describing the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        match self {
            TransportConfig::NativeRadio {
                address,
                device_key,
            } => {
                if !is_radio_address(address) {
                    return Err(Error::Config(format!(
                        "radio address '{address}' is not six colon-separated hex octets"
                    )));
                }
                if device_key.len() != DEVICE_KEY_LEN * 2
                    || !device_key.chars().all(|c| c.is_ascii_hexdigit())
                {
                    return Err(Error::Config(format!(
                        "device key must be {} hex characters",
                        DEVICE_KEY_LEN * 2
                    )));
                }
            }
            TransportConfig::SerialBridge {
                path, baud_rate, ..
            } => {
                if path.trim().is_empty() {
                    return Err(Error::MissingConfig("serial path".to_string()));
                }
                if *baud_rate == 0 {
                    return Err(Error::Config("baud rate must be non-zero".to_string()));
                }
            }
            TransportConfig::NetworkBridge { secret, .. } => {
                if secret.is_empty() {
                    return Err(Error::MissingConfig("network bridge secret".to_string()));
                }
            }
            TransportConfig::MockSuccess
            | TransportConfig::MockFault
            | TransportConfig::MockDisconnected => {}
        }
        Ok(())
    }
}

fn is_radio_address(address: &str) -> bool {
    let octets: Vec<&str> = address.split(':').collect();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

impl Config {
    /// Create a configuration with defaults and no locks.
    pub fn new(session_secret: impl Into<String>) -> Self {
        Self {
            session_secret: session_secret.into(),
            data_dir: default_data_dir(),
            session: SessionSettings::default(),
            timeouts: TimeoutSettings::default(),
            backoff: BackoffSettings::default(),
            locks: Vec::new(),
        }
    }

    /// Set the data directory
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Add a served lock
    pub fn with_lock(mut self, lock: LockConfig) -> Self {
        self.locks.push(lock);
        self
    }

    /// Read and validate a configuration file.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file cannot be read, `Error::Parse` for
    /// malformed TOML or unknown transport kinds, and `Error::Config` when
    /// validation fails.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate configuration text.
    ///
    /// # Errors
    /// See [`Config::load`].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every invariant that must hold before the service starts.
    ///
    /// # Errors
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<()> {
        if self.session_secret.is_empty() {
            return Err(Error::MissingConfig("session_secret".to_string()));
        }

        if self.locks.is_empty() {
            return Err(Error::Config("no locks configured".to_string()));
        }

        let mut seen = HashSet::new();
        for lock in &self.locks {
            if !seen.insert(lock.location) {
                return Err(Error::Config(format!(
                    "location {} configured more than once",
                    lock.location
                )));
            }
            lock.transport.validate()?;
        }

        let t = &self.timeouts;
        if t.connect_ms == 0 || t.command_ms == 0 || t.connect_wait_ms == 0 {
            return Err(Error::Config("timeouts must be non-zero".to_string()));
        }
        if self.session.ttl_secs == 0 || self.session.login_timeout_ms == 0 {
            return Err(Error::Config(
                "session ttl and login timeout must be non-zero".to_string(),
            ));
        }

        let b = &self.backoff;
        if b.initial_ms == 0 || b.max_ms < b.initial_ms {
            return Err(Error::Config(
                "backoff requires 0 < initial_ms <= max_ms".to_string(),
            ));
        }
        if b.multiplier.is_nan() || b.multiplier < 1.0 {
            return Err(Error::Config(format!(
                "backoff multiplier must be >= 1, got {}",
                b.multiplier
            )));
        }

        Ok(())
    }

    /// Configuration for `location`, if it is served.
    #[must_use]
    pub fn lock(&self, location: Location) -> Option<&LockConfig> {
        self.locks.iter().find(|l| l.location == location)
    }

    /// Path of the credential file for `location`.
    #[must_use]
    pub fn users_path(&self, location: Location) -> PathBuf {
        self.data_dir.join(location.users_file())
    }

    /// Path of the audit log for `location`.
    #[must_use]
    pub fn audit_path(&self, location: Location) -> PathBuf {
        self.data_dir.join(location.audit_file())
    }

    #[must_use]
    pub fn lifetimes_path(&self) -> PathBuf {
        self.data_dir.join(LIFETIMES_FILE)
    }

    #[must_use]
    pub fn expired_path(&self) -> PathBuf {
        self.data_dir.join(EXPIRED_FILE)
    }
}
