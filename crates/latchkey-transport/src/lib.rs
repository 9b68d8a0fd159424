//! Lock transports for Latchkey.
//!
//! A transport is one physical path to a lock. Every backend implements the
//! same [`LockTransport`] capability, so the layers above issue open, close
//! and status requests without knowing how the lock is reached.
//!
//! # Backends
//!
//! | Backend | Module | Path to the lock |
//! |---------|--------|------------------|
//! | native radio | [`radio`] | lock protocol over a [`RadioLink`] (BLE with the `radio-ble` feature, or simulated) |
//! | serial bridge | [`bridge::serial`] | microcontroller on a serial line |
//! | network bridge | [`bridge::network`] | microcontroller dialing in over TCP |
//! | mocks | [`mock`] | always succeed, always fault, or never connect |
//!
//! The backend is chosen once at startup with
//! [`AnyLockTransport::from_config`] and never switched afterwards.
//!
//! # Timeouts
//!
//! Every suspending operation takes a caller-supplied timeout. Nothing in
//! this crate waits indefinitely.
//!
//! # Link Events
//!
//! [`LockTransport::link_events`] publishes [`LinkStatus`] changes, which is
//! how an unsolicited disconnect (bridge hang-up, lock out of range) reaches
//! the connection supervisor without a failed call.

pub mod bridge;
pub mod devices;
pub mod error;
pub mod mock;
pub mod radio;
pub mod traits;
pub mod types;

pub use bridge::{NetworkBridge, SerialBridge, SerialOpener};
pub use devices::AnyLockTransport;
pub use error::{Result, TransportError};
pub use mock::{MockBehavior, MockHandle, MockTransport};
pub use radio::{AnyRadioLink, NativeRadio, RadioLink, SimulatedLink, SimulatedLockHandle};
pub use traits::LockTransport;
pub use types::{LinkStatus, TransportInfo};
