//! In-process simulated lock speaking the native radio protocol.
//!
//! The simulated lock verifies handshake and command tags with the real
//! device key, so it exercises the same code paths as hardware. A
//! [`SimulatedLockHandle`] lets tests make the lock reject the key, fault on
//! actuation, go silent, or drop out of range.

use std::sync::Arc;

use latchkey_core::LockAction;
use latchkey_protocol::radio::tags_match;
use latchkey_protocol::{CommandStatus, DeviceKey, Nonce, RadioFrame};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::trace;

use super::link::RadioLink;
use crate::error::{Result, TransportError};
use crate::types::LinkStatus;

#[derive(Debug)]
struct SimSession {
    client_nonce: Nonce,
    lock_nonce: Nonce,
    authenticated: bool,
    last_counter: Option<u16>,
}

#[derive(Debug)]
struct LockState {
    key: DeviceKey,
    reject_auth: bool,
    fault: bool,
    silent: bool,
    unreachable: bool,
    unlocked: bool,
    session: Option<SimSession>,
    outbox: Option<mpsc::UnboundedSender<Vec<u8>>>,
    handshakes: u32,
    commands: u32,
}

impl LockState {
    /// The lock's reaction to one inbound frame. Garbage is ignored.
    fn handle_frame(&mut self, bytes: &[u8]) -> Option<RadioFrame> {
        let frame = RadioFrame::decode(bytes).ok()?;

        match frame {
            RadioFrame::ConnectionRequest { client_nonce } => {
                let lock_nonce: Nonce = rand::random();
                self.session = Some(SimSession {
                    client_nonce,
                    lock_nonce,
                    authenticated: false,
                    last_counter: None,
                });
                Some(RadioFrame::ConnectionInfo { lock_nonce })
            }
            RadioFrame::Authenticate { tag } => {
                self.handshakes += 1;
                let valid = !self.reject_auth
                    && self.session.as_ref().is_some_and(|s| {
                        self.key
                            .auth_tag(&s.client_nonce, &s.lock_nonce)
                            .is_ok_and(|expected| tags_match(&expected, &tag))
                    });

                match self.session.as_mut() {
                    Some(session) if valid => {
                        session.authenticated = true;
                        Some(RadioFrame::Accepted)
                    }
                    _ => {
                        self.session = None;
                        Some(RadioFrame::Rejected)
                    }
                }
            }
            RadioFrame::Command {
                action,
                counter,
                tag,
            } => {
                let status = match self.session.as_mut() {
                    Some(session)
                        if session.authenticated
                            && session.last_counter.is_none_or(|last| counter > last)
                            && self
                                .key
                                .command_tag(&session.lock_nonce, counter, action)
                                .is_ok_and(|expected| tags_match(&expected, &tag)) =>
                    {
                        session.last_counter = Some(counter);
                        if self.fault {
                            CommandStatus::Fault
                        } else {
                            self.unlocked = action == LockAction::Open;
                            self.commands += 1;
                            CommandStatus::Ok
                        }
                    }
                    _ => CommandStatus::AuthFailed,
                };
                Some(RadioFrame::CommandResult { counter, status })
            }
            _ => None,
        }
    }
}

/// Host side of the simulated radio.
#[derive(Debug)]
pub struct SimulatedLink {
    state: Arc<Mutex<LockState>>,
    inbox: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
    events: Arc<watch::Sender<LinkStatus>>,
}

impl SimulatedLink {
    /// Create a simulated lock that trusts `key`.
    ///
    /// Returns the host side of the radio link and a handle for steering
    /// the lock.
    pub fn new(key: DeviceKey) -> (Self, SimulatedLockHandle) {
        let state = Arc::new(Mutex::new(LockState {
            key,
            reject_auth: false,
            fault: false,
            silent: false,
            unreachable: false,
            unlocked: false,
            session: None,
            outbox: None,
            handshakes: 0,
            commands: 0,
        }));
        let (events, _) = watch::channel(LinkStatus::Down);
        let events = Arc::new(events);

        let link = Self {
            state: Arc::clone(&state),
            inbox: None,
            events: Arc::clone(&events),
        };
        let handle = SimulatedLockHandle { state, events };
        (link, handle)
    }
}

impl RadioLink for SimulatedLink {
    async fn connect(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.unreachable {
            return Err(TransportError::disconnected("simulated lock out of range"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.outbox = Some(tx);
        state.session = None;
        drop(state);

        self.inbox = Some(rx);
        self.events.send_replace(LinkStatus::Up);
        Ok(())
    }

    async fn send(&mut self, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.outbox.is_none() {
            return Err(TransportError::disconnected("simulated lock out of range"));
        }

        trace!(frame = ?frame, "radio frame to simulated lock");
        let reply = state.handle_frame(frame);
        if let (Some(reply), Some(outbox)) = (reply, &state.outbox)
            && !state.silent
        {
            // A closed inbox means the host already hung up
            let _ = outbox.send(reply.to_bytes());
        }
        Ok(())
    }

    async fn recv(&mut self) -> Result<Vec<u8>> {
        let inbox = self
            .inbox
            .as_mut()
            .ok_or_else(|| TransportError::disconnected("radio link not connected"))?;
        inbox
            .recv()
            .await
            .ok_or_else(|| TransportError::disconnected("simulated lock went out of range"))
    }

    async fn disconnect(&mut self) {
        self.inbox = None;
        let mut state = self.state.lock();
        state.outbox = None;
        state.session = None;
        drop(state);
        self.events.send_replace(LinkStatus::Down);
    }

    fn is_connected(&self) -> bool {
        self.inbox.is_some() && self.state.lock().outbox.is_some()
    }

    fn link_events(&self) -> watch::Receiver<LinkStatus> {
        self.events.subscribe()
    }

    fn describe(&self) -> String {
        "simulated".to_string()
    }
}

/// Handle for steering a simulated lock.
#[derive(Debug, Clone)]
pub struct SimulatedLockHandle {
    state: Arc<Mutex<LockState>>,
    events: Arc<watch::Sender<LinkStatus>>,
}

impl SimulatedLockHandle {
    /// Reject every authentication attempt.
    pub fn set_reject_auth(&self, reject: bool) {
        self.state.lock().reject_auth = reject;
    }

    /// Answer authenticated commands with a fault.
    pub fn set_fault(&self, fault: bool) {
        self.state.lock().fault = fault;
    }

    /// Swallow frames without answering.
    pub fn set_silent(&self, silent: bool) {
        self.state.lock().silent = silent;
    }

    /// Refuse new connections.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    /// Drop the current connection as if the lock went out of range.
    pub fn drop_link(&self) {
        let mut state = self.state.lock();
        state.outbox = None;
        state.session = None;
        drop(state);
        self.events.send_replace(LinkStatus::Down);
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unlocked
    }

    /// Authentication frames received so far.
    pub fn handshakes(&self) -> u32 {
        self.state.lock().handshakes
    }

    /// Commands actually carried out.
    pub fn commands(&self) -> u32 {
        self.state.lock().commands
    }
}
