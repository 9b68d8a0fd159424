//! Types shared by all transport implementations.

use std::fmt;

use latchkey_core::TransportKind;

/// Physical link status, published by transports whenever it changes.
///
/// A `Down` that the supervisor did not ask for is an unsolicited
/// disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStatus {
    Up,
    Down,
}

/// Description of a transport instance for logs and diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub kind: TransportKind,

    /// Address, device path or listen port.
    pub endpoint: String,
}

impl TransportInfo {
    pub fn new(kind: TransportKind, endpoint: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
        }
    }
}

impl fmt::Display for TransportInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.kind, self.endpoint)
    }
}
