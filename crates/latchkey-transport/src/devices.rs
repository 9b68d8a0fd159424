//! Enum wrapper for transport dispatch.
//!
//! Native `async fn` in traits is not object-safe, so `Box<dyn LockTransport>`
//! is unavailable. [`AnyLockTransport`] gives the connection supervisor one
//! concrete type covering every backend, chosen once at startup by
//! [`AnyLockTransport::from_config`].
//!
//! # Examples
//!
//! ```
//! use latchkey_core::TransportConfig;
//! use latchkey_transport::{AnyLockTransport, LockTransport};
//!
//! let transport = AnyLockTransport::from_config(&TransportConfig::MockSuccess).unwrap();
//! assert_eq!(transport.info().endpoint, "mock");
//! ```

use std::time::Duration;

use latchkey_core::{ConnectionState, TransportConfig};
use tokio::sync::watch;
use tracing::info;

use crate::bridge::{NetworkBridge, SerialBridge};
use crate::error::Result;
use crate::mock::{MockBehavior, MockTransport};
use crate::radio::NativeRadio;
use crate::traits::LockTransport;
use crate::types::{LinkStatus, TransportInfo};

#[derive(Debug)]
#[non_exhaustive]
pub enum AnyLockTransport {
    NativeRadio(NativeRadio),
    SerialBridge(SerialBridge),
    NetworkBridge(NetworkBridge),
    Mock(MockTransport),
}

impl AnyLockTransport {
    /// Build the transport selected by the configuration.
    ///
    /// # Errors
    /// - `Error::Config` for parameters that fail validation
    /// - `Error::UnsupportedTransport` for `native-radio` when built without
    ///   the `radio-ble` feature
    pub fn from_config(config: &TransportConfig) -> latchkey_core::Result<Self> {
        config.validate()?;

        let transport = match config {
            TransportConfig::NativeRadio {
                address,
                device_key,
            } => Self::NativeRadio(native_radio(address, device_key)?),
            TransportConfig::SerialBridge {
                path,
                baud_rate,
                has_prefix,
            } => Self::SerialBridge(SerialBridge::new(path.clone(), *baud_rate, *has_prefix)),
            TransportConfig::NetworkBridge { port, secret } => {
                Self::NetworkBridge(NetworkBridge::new(*port, secret.clone()))
            }
            TransportConfig::MockSuccess => Self::Mock(MockTransport::new(MockBehavior::Success).0),
            TransportConfig::MockFault => Self::Mock(MockTransport::new(MockBehavior::Fault).0),
            TransportConfig::MockDisconnected => {
                Self::Mock(MockTransport::new(MockBehavior::Disconnected).0)
            }
        };

        info!(transport = %transport.info(), "transport selected");
        Ok(transport)
    }
}

#[cfg(feature = "radio-ble")]
fn native_radio(address: &str, device_key: &str) -> latchkey_core::Result<NativeRadio> {
    use crate::radio::{AnyRadioLink, BleLink};

    let key = latchkey_protocol::DeviceKey::from_hex(device_key)
        .map_err(|e| latchkey_core::Error::Config(e.to_string()))?;
    let link = BleLink::new(address)?;
    Ok(NativeRadio::new(AnyRadioLink::Ble(link), key))
}

#[cfg(not(feature = "radio-ble"))]
fn native_radio(_address: &str, _device_key: &str) -> latchkey_core::Result<NativeRadio> {
    Err(latchkey_core::Error::UnsupportedTransport(
        "native-radio requires the radio-ble feature".to_string(),
    ))
}

impl From<MockTransport> for AnyLockTransport {
    fn from(transport: MockTransport) -> Self {
        Self::Mock(transport)
    }
}

impl From<NativeRadio> for AnyLockTransport {
    fn from(transport: NativeRadio) -> Self {
        Self::NativeRadio(transport)
    }
}

impl From<SerialBridge> for AnyLockTransport {
    fn from(transport: SerialBridge) -> Self {
        Self::SerialBridge(transport)
    }
}

impl From<NetworkBridge> for AnyLockTransport {
    fn from(transport: NetworkBridge) -> Self {
        Self::NetworkBridge(transport)
    }
}

impl LockTransport for AnyLockTransport {
    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Self::NativeRadio(t) => t.connect(timeout).await,
            Self::SerialBridge(t) => t.connect(timeout).await,
            Self::NetworkBridge(t) => t.connect(timeout).await,
            Self::Mock(t) => t.connect(timeout).await,
        }
    }

    async fn disconnect(&mut self) {
        match self {
            Self::NativeRadio(t) => t.disconnect().await,
            Self::SerialBridge(t) => t.disconnect().await,
            Self::NetworkBridge(t) => t.disconnect().await,
            Self::Mock(t) => t.disconnect().await,
        }
    }

    async fn open(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Self::NativeRadio(t) => t.open(timeout).await,
            Self::SerialBridge(t) => t.open(timeout).await,
            Self::NetworkBridge(t) => t.open(timeout).await,
            Self::Mock(t) => t.open(timeout).await,
        }
    }

    async fn close(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Self::NativeRadio(t) => t.close(timeout).await,
            Self::SerialBridge(t) => t.close(timeout).await,
            Self::NetworkBridge(t) => t.close(timeout).await,
            Self::Mock(t) => t.close(timeout).await,
        }
    }

    fn status(&self) -> ConnectionState {
        match self {
            Self::NativeRadio(t) => t.status(),
            Self::SerialBridge(t) => t.status(),
            Self::NetworkBridge(t) => t.status(),
            Self::Mock(t) => t.status(),
        }
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        match self {
            Self::NativeRadio(t) => t.link_events(),
            Self::SerialBridge(t) => t.link_events(),
            Self::NetworkBridge(t) => t.link_events(),
            Self::Mock(t) => t.link_events(),
        }
    }

    fn info(&self) -> TransportInfo {
        match self {
            Self::NativeRadio(t) => t.info(),
            Self::SerialBridge(t) => t.info(),
            Self::NetworkBridge(t) => t.info(),
            Self::Mock(t) => t.info(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_core::TransportKind;
    use rstest::rstest;

    #[rstest]
    #[case(TransportConfig::MockSuccess, TransportKind::MockSuccess)]
    #[case(TransportConfig::MockFault, TransportKind::MockFault)]
    #[case(TransportConfig::MockDisconnected, TransportKind::MockDisconnected)]
    #[case(
        TransportConfig::SerialBridge {
            path: "/dev/ttyACM0".into(),
            baud_rate: 9600,
            has_prefix: false,
        },
        TransportKind::SerialBridge
    )]
    #[case(
        TransportConfig::NetworkBridge { port: 4000, secret: "s3cret".into() },
        TransportKind::NetworkBridge
    )]
    fn test_from_config_selects_variant(
        #[case] config: TransportConfig,
        #[case] kind: TransportKind,
    ) {
        let transport = AnyLockTransport::from_config(&config).unwrap();
        assert_eq!(transport.info().kind, kind);
        assert_eq!(transport.status(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_from_config_rejects_bad_parameters() {
        let config = TransportConfig::NetworkBridge {
            port: 4000,
            secret: String::new(),
        };
        assert!(AnyLockTransport::from_config(&config).is_err());
    }

    #[cfg(not(feature = "radio-ble"))]
    #[test]
    fn test_native_radio_needs_feature() {
        let config = TransportConfig::NativeRadio {
            address: "00:11:22:33:44:55".into(),
            device_key: "000102030405060708090a0b0c0d0e0f".into(),
        };
        assert!(matches!(
            AnyLockTransport::from_config(&config),
            Err(latchkey_core::Error::UnsupportedTransport(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_reaches_inner_transport() {
        let (mock, handle) = MockTransport::new(MockBehavior::Success);
        let mut transport = AnyLockTransport::from(mock);
        let timeout = Duration::from_secs(1);

        transport.connect(timeout).await.unwrap();
        transport
            .execute(latchkey_core::LockAction::Open, timeout)
            .await
            .unwrap();
        assert_eq!(handle.opens(), 1);
        assert_eq!(transport.status(), ConnectionState::Connected);
    }
}
