use thiserror::Error;

/// Configuration and validation errors.
///
/// Fatal when raised while loading the startup configuration; non-fatal when
/// a single request carries a bad parameter (for example an unknown location).
#[derive(Error, Debug)]
pub enum Error {
    #[error("Unknown location: {0}")]
    UnknownLocation(String),

    #[error("Invalid user name: {0}")]
    InvalidUserName(String),

    #[error("Invalid lifetime rule '{rule}': {reason}")]
    InvalidLifetime { rule: String, reason: String },

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing configuration key: {0}")]
    MissingConfig(String),

    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
