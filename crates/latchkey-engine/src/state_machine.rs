//! Connection state machine for one lock.
//!
//! The machine enforces the legal transitions of [`ConnectionState`] and
//! keeps a bounded history of the transitions it made. It performs no I/O:
//! the [connection supervisor](crate::connection) drives it from transport
//! outcomes.
//!
//! # Transitions
//!
//! ```text
//! Disconnected -> Connecting                  connect attempt
//! Connecting   -> Connected | Error           attempt succeeded / failed or timed out
//! Connected    -> Busy                        command issued
//! Busy         -> Connected | Error           command completed / link failure
//! Error        -> Connecting                  backoff elapsed or explicit connect
//! ```
//!
//! Any state other than `Disconnected` may fall back to `Disconnected` when
//! the link is lost.
//!
//! # Examples
//!
//! ```
//! use latchkey_core::ConnectionState;
//! use latchkey_engine::StateMachine;
//!
//! let mut machine = StateMachine::new();
//! machine.transition_to(ConnectionState::Connecting).unwrap();
//! machine.transition_to(ConnectionState::Connected).unwrap();
//!
//! assert_eq!(machine.current_state(), ConnectionState::Connected);
//! assert!(machine.transition_to(ConnectionState::Connecting).is_err());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use latchkey_core::constants::MAX_STATE_HISTORY;
use latchkey_core::{ConnectionState, Error, Result};
use serde::{Deserialize, Serialize};

/// A single state transition with the time it happened.
///
/// The timestamp is process-local and not serialized; a deserialized
/// transition carries the time of deserialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,

    #[serde(skip, default = "Instant::now")]
    pub timestamp: Instant,
}

impl StateTransition {
    pub fn new(from: ConnectionState, to: ConnectionState) -> Self {
        Self {
            from,
            to,
            timestamp: Instant::now(),
        }
    }

    /// Time since this transition happened.
    pub fn elapsed(&self) -> Duration {
        self.timestamp.elapsed()
    }
}

impl fmt::Display for StateTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Connection state machine.
///
/// Not synchronized; the supervisor task is its only owner.
#[derive(Debug)]
pub struct StateMachine {
    current_state: ConnectionState,
    state_entered_at: Instant,
    history: VecDeque<StateTransition>,
}

impl StateMachine {
    /// Create a machine in the `Disconnected` state.
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Disconnected,
            state_entered_at: Instant::now(),
            history: VecDeque::with_capacity(MAX_STATE_HISTORY),
        }
    }

    pub fn current_state(&self) -> ConnectionState {
        self.current_state
    }

    pub fn time_in_current_state(&self) -> Duration {
        self.state_entered_at.elapsed()
    }

    /// Transitions made so far, oldest first, at most
    /// [`MAX_STATE_HISTORY`] of them.
    pub fn history(&self) -> &VecDeque<StateTransition> {
        &self.history
    }

    /// The last `count` transitions, oldest first.
    pub fn last_transitions(&self, count: usize) -> Vec<StateTransition> {
        let skip = self.history.len().saturating_sub(count);
        self.history.iter().skip(skip).cloned().collect()
    }

    /// Move to `new_state` if the transition is legal.
    ///
    /// # Errors
    /// Returns `Error::InvalidStateTransition` and leaves the machine
    /// untouched if the transition is not allowed.
    pub fn transition_to(&mut self, new_state: ConnectionState) -> Result<StateTransition> {
        if !self.current_state.can_transition_to(&new_state) {
            return Err(Error::InvalidStateTransition {
                from: self.current_state.to_string(),
                to: new_state.to_string(),
            });
        }

        let transition = StateTransition::new(self.current_state, new_state);
        self.perform_state_change(new_state, transition.clone());
        Ok(transition)
    }

    fn perform_state_change(&mut self, new_state: ConnectionState, transition: StateTransition) {
        self.current_state = new_state;
        self.state_entered_at = Instant::now();

        self.history.push_back(transition);
        if self.history.len() > MAX_STATE_HISTORY {
            self.history.pop_front();
        }
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::{Busy, Connected, Connecting, Disconnected};
    use rstest::rstest;

    fn machine_in(path: &[ConnectionState]) -> StateMachine {
        let mut machine = StateMachine::new();
        for state in path {
            machine.transition_to(*state).unwrap();
        }
        machine
    }

    #[test]
    fn test_new_machine_starts_disconnected() {
        let machine = StateMachine::new();
        assert_eq!(machine.current_state(), Disconnected);
        assert!(machine.history().is_empty());
    }

    #[rstest]
    #[case(&[], Connecting)]
    #[case(&[Connecting], Connected)]
    #[case(&[Connecting], ConnectionState::Error)]
    #[case(&[Connecting], Disconnected)]
    #[case(&[Connecting, Connected], Busy)]
    #[case(&[Connecting, Connected], ConnectionState::Error)]
    #[case(&[Connecting, Connected], Disconnected)]
    #[case(&[Connecting, Connected, Busy], Connected)]
    #[case(&[Connecting, Connected, Busy], ConnectionState::Error)]
    #[case(&[Connecting, Connected, Busy], Disconnected)]
    #[case(&[Connecting, ConnectionState::Error], Connecting)]
    #[case(&[Connecting, ConnectionState::Error], Disconnected)]
    fn test_valid_transitions(#[case] path: &[ConnectionState], #[case] to: ConnectionState) {
        let mut machine = machine_in(path);
        let from = machine.current_state();

        let transition = machine.transition_to(to).unwrap();

        assert_eq!(transition.from, from);
        assert_eq!(transition.to, to);
        assert_eq!(machine.current_state(), to);
    }

    #[rstest]
    #[case(&[], Connected)]
    #[case(&[], Busy)]
    #[case(&[], Disconnected)]
    #[case(&[Connecting], Busy)]
    #[case(&[Connecting, Connected], Connecting)]
    #[case(&[Connecting, ConnectionState::Error], Connected)]
    #[case(&[Connecting, ConnectionState::Error], Busy)]
    fn test_invalid_transitions(#[case] path: &[ConnectionState], #[case] to: ConnectionState) {
        let mut machine = machine_in(path);
        let before = machine.current_state();
        let history_len = machine.history().len();

        let result = machine.transition_to(to);

        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
        assert_eq!(machine.current_state(), before);
        assert_eq!(machine.history().len(), history_len);
    }

    #[test]
    fn test_history_records_transitions_in_order() {
        let machine = machine_in(&[Connecting, Connected, Busy, Connected]);

        let pairs: Vec<_> = machine.history().iter().map(|t| (t.from, t.to)).collect();
        assert_eq!(
            pairs,
            [
                (Disconnected, Connecting),
                (Connecting, Connected),
                (Connected, Busy),
                (Busy, Connected),
            ]
        );
    }

    #[test]
    fn test_history_is_bounded() {
        let mut machine = StateMachine::new();
        machine.transition_to(Connecting).unwrap();
        for _ in 0..MAX_STATE_HISTORY {
            machine.transition_to(ConnectionState::Error).unwrap();
            machine.transition_to(Connecting).unwrap();
        }

        assert_eq!(machine.history().len(), MAX_STATE_HISTORY);
        // The very first transition has been evicted
        assert_eq!(machine.history()[0].from, Connecting);
    }

    #[test]
    fn test_last_transitions() {
        let machine = machine_in(&[Connecting, Connected, Busy]);

        let last = machine.last_transitions(2);
        assert_eq!(last.len(), 2);
        assert_eq!(last[0].to, Connected);
        assert_eq!(last[1].to, Busy);

        assert_eq!(machine.last_transitions(10).len(), 3);
    }

    #[test]
    fn test_transition_display() {
        let transition = StateTransition::new(Connected, Busy);
        assert_eq!(transition.to_string(), "Connected -> Busy");
    }

    #[test]
    fn test_time_in_state_resets_on_transition() {
        let mut machine = StateMachine::new();
        std::thread::sleep(Duration::from_millis(20));
        let before = machine.time_in_current_state();

        machine.transition_to(Connecting).unwrap();

        assert!(machine.time_in_current_state() < before);
    }
}
