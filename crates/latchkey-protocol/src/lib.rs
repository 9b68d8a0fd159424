pub mod bridge;
pub mod codec;
pub mod error;
pub mod radio;

pub use bridge::{BridgeCommand, BridgeMessage, BridgeReply};
pub use codec::BridgeCodec;
pub use error::{ProtocolError, Result};
pub use radio::{CommandStatus, DeviceKey, Nonce, RadioFrame, Tag};
