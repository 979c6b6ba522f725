//! Connection lifecycle state machine
//!
//! `None -> Inited -> Ready -> {Cleanup | Stopped}`. Both `Cleanup` and
//! `Stopped` are terminal: a stopped connection object is never revived, a new
//! one must be created to reconnect.

use std::fmt;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Connection State
// ----------------------------------------------------------------------------

/// Lifecycle state of one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No physical link attached yet
    #[default]
    None,
    /// Physical link attached, I/O not started
    Inited,
    /// Sends and receives are live
    Ready,
    /// Torn down after a transport or protocol failure
    Cleanup,
    /// Torn down by an explicit stop
    Stopped,
}

impl ConnectionState {
    /// No further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Cleanup | ConnectionState::Stopped)
    }

    pub fn is_ready(self) -> bool {
        self == ConnectionState::Ready
    }

    /// Whether the lifecycle allows moving from `self` to `next`
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (None, Inited) => true,
            (Inited, Ready) => true,
            (current, Cleanup | Stopped) => !current.is_terminal(),
            _ => false,
        }
    }

    /// Validated transition
    pub fn transition(self, next: ConnectionState) -> Result<ConnectionState, StateTransitionError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(StateTransitionError {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::None => "none",
            ConnectionState::Inited => "inited",
            ConnectionState::Ready => "ready",
            ConnectionState::Cleanup => "cleanup",
            ConnectionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Rejected lifecycle transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Invalid state transition from {from} to {to}")]
pub struct StateTransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}
