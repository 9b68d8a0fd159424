//! Command core of Latchkey.
//!
//! - [`StateMachine`]: legal connection states and their history
//! - [`ConnectionSupervisor`]: the task that owns one lock transport,
//!   reconnects with [`Backoff`] and serializes access to it
//! - [`SessionManager`]: password login and signed session tokens
//! - [`CommandDispatcher`]: authenticated, single-flight lock commands
//! - [`LockService`]: everything above behind the request-layer API
//!
//! ```text
//! request ─▶ SessionManager ─▶ CommandDispatcher ─▶ ConnectionSupervisor ─▶ LockTransport
//! ```

pub mod backoff;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod session;
pub mod state_machine;

pub use backoff::Backoff;
pub use connection::{ConnectionHandle, ConnectionSupervisor};
pub use dispatcher::{Command, CommandDispatcher, CommandReport};
pub use error::{AuthError, ServiceError, ServiceResult};
pub use service::{LockService, StatusReport};
pub use session::{Session, SessionManager};
pub use state_machine::{StateMachine, StateTransition};
