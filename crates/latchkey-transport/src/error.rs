//! Error type for lock transports.
//!
//! Every variant is recoverable: the connection supervisor maps it to a
//! state change and a failed command outcome, never to a crash.

use std::time::Duration;

use latchkey_protocol::ProtocolError;

/// Result type alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur while talking to a lock.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The caller-supplied timeout elapsed.
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// The peer did not answer, or answered with something unparseable.
    #[error("No response: {detail}")]
    NoResponse { detail: String },

    /// The lock or bridge refused our credentials.
    #[error("Authentication rejected: {reason}")]
    AuthRejected { reason: String },

    /// The lock received the command but could not carry it out.
    #[error("Device fault: {reason}")]
    DeviceFault { reason: String },

    /// The link is down.
    #[error("Disconnected: {reason}")]
    Disconnected { reason: String },
}

impl TransportError {
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    pub fn no_response(detail: impl Into<String>) -> Self {
        Self::NoResponse {
            detail: detail.into(),
        }
    }

    pub fn auth_rejected(reason: impl Into<String>) -> Self {
        Self::AuthRejected {
            reason: reason.into(),
        }
    }

    pub fn device_fault(reason: impl Into<String>) -> Self {
        Self::DeviceFault {
            reason: reason.into(),
        }
    }

    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::Disconnected {
            reason: reason.into(),
        }
    }

    /// Short machine-friendly name, used in audit lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::NoResponse { .. } => "no-response",
            Self::AuthRejected { .. } => "auth-rejected",
            Self::DeviceFault { .. } => "device-fault",
            Self::Disconnected { .. } => "disconnected",
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::disconnected(err.to_string())
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => e.into(),
            ProtocolError::InvalidKey(reason) => Self::auth_rejected(reason),
            other => Self::no_response(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error() {
        let error = TransportError::timeout(Duration::from_millis(3000));
        assert_eq!(error, TransportError::Timeout { duration_ms: 3000 });
        assert_eq!(error.to_string(), "Operation timeout after 3000ms");
        assert_eq!(error.kind(), "timeout");
    }

    #[test]
    fn test_device_fault_error() {
        let error = TransportError::device_fault("motor blocked");
        assert_eq!(error.to_string(), "Device fault: motor blocked");
    }

    #[test]
    fn test_io_error_is_disconnect() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(matches!(
            TransportError::from(io),
            TransportError::Disconnected { .. }
        ));
    }

    #[test]
    fn test_protocol_errors_map_to_no_response() {
        let err = ProtocolError::FrameTooLarge {
            size: 2000,
            max_size: 1024,
        };
        assert_eq!(TransportError::from(err).kind(), "no-response");
    }
}
