//! Request-level error taxonomy.
//!
//! Transport failures that happen after a command reached the lock are not
//! errors at this level: they come back as a failed
//! [`CommandReport`](crate::CommandReport). [`ServiceError::Transport`] is
//! only used when a command never got that far, for example because the
//! lock did not connect within the wait bound.

use latchkey_core::Location;
use latchkey_storage::StorageError;
use latchkey_transport::TransportError;
use thiserror::Error;

/// Authentication failures.
///
/// `InvalidCredentials` covers both an unknown name and a wrong password.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Invalid user name or password")]
    InvalidCredentials,

    #[error("Invalid session")]
    InvalidSession,

    #[error("Session expired")]
    Expired,

    /// The password check could not run to completion in time
    #[error("Authentication unavailable: {0}")]
    Unavailable(String),
}

/// Errors returned by the service entry points.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Unknown or unserved location, or a bad startup configuration
    #[error(transparent)]
    Config(#[from] latchkey_core::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Another open or close is in flight for the same lock
    #[error("A command is already in flight for location {location}")]
    Concurrency { location: Location },
}

impl ServiceError {
    pub fn not_served(location: Location) -> Self {
        Self::Config(latchkey_core::Error::MissingConfig(format!(
            "no lock configured for location {location}"
        )))
    }
}

/// Specialized result type for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
