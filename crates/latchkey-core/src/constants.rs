//! Shared constants for the latchkey workspace.
//!
//! Grouped by the component that consumes them. Values that operators may
//! want to tune also appear as defaults in [`crate::config`].

// Configuration

/// Default configuration file looked up by the CLI.
pub const DEFAULT_CONFIG_FILE: &str = "latchkey.toml";

/// Default directory for credential files, audit logs and `lifetimes.json`.
pub const DEFAULT_DATA_DIR: &str = ".";

// Sessions

/// Session lifetime when not configured (24 hours).
pub const DEFAULT_SESSION_TTL_SECS: u64 = 86_400;

/// Upper bound on the password hashing step of a login.
pub const DEFAULT_LOGIN_TIMEOUT_MS: u64 = 5_000;

/// Random bytes in a session id (hex encoded in the token).
pub const SESSION_ID_LEN: usize = 32;

/// Separator between session id and MAC inside a token.
pub const TOKEN_SEPARATOR: char = '.';

// Connection supervision

/// Bound on a single `Connecting` attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Bound on a single open/close attempt against the transport.
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 8_000;

/// How long the dispatcher waits for `Connected` before failing a command.
pub const DEFAULT_CONNECT_WAIT_MS: u64 = 15_000;

pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Number of state transitions retained for diagnostics.
pub const MAX_STATE_HISTORY: usize = 100;

// Bridges

/// Byte that marks protocol lines when the bridge firmware uses a prefix.
pub const BRIDGE_FRAME_PREFIX: u8 = b'$';

/// Longest accepted bridge line, excluding the terminator.
pub const MAX_BRIDGE_LINE_LEN: usize = 1024;

pub const DEFAULT_SERIAL_PATH: &str = "/dev/ttyUSB0";
pub const DEFAULT_SERIAL_BAUD_RATE: u32 = 115_200;
pub const DEFAULT_BRIDGE_PORT: u16 = 4000;

// Native radio

/// Length of the preshared device key in bytes (32 hex characters).
pub const DEVICE_KEY_LEN: usize = 16;

// Credentials

/// PBKDF2-HMAC-SHA512 rounds. Must stay in sync with existing user files.
pub const PBKDF2_ITERATIONS: u32 = 10_000;

/// Derived key length in bytes before base64 encoding.
pub const PASSWORD_HASH_LEN: usize = 128;

/// Random salt length in bytes before base64 encoding.
pub const PASSWORD_SALT_LEN: usize = 128;

// Lifetimes

pub const LIFETIMES_FILE: &str = "lifetimes.json";
pub const DEFAULT_LIFETIME_KEY: &str = "-default-";
pub const DEFAULT_LIFETIME_RULE: &str = "30d";

/// Archive of expired users, shared by all locations.
pub const EXPIRED_FILE: &str = "expired.json";

// Audit log

/// Timestamp layout at the start of every audit line.
pub const AUDIT_TIMESTAMP_FORMAT: &str = "%d/%m/%Y %H:%M:%S";

/// Date part of [`AUDIT_TIMESTAMP_FORMAT`].
pub const AUDIT_DATE_FORMAT: &str = "%d/%m/%Y";
