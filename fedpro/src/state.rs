//! Session lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Session`](crate::Session).
///
/// ```text
/// Disconnected → Connecting → Connected → Joined → Resigning → Connected
///       ↑______________________________________________________↓ (disconnect / connection lost)
/// any → Faulted (protocol violation)      any → Closed (close)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No connection. The only state `connect` is accepted in.
    #[default]
    Disconnected,
    /// Dialing the RTI.
    Connecting,
    /// Transport is up; administrative calls and `join` are accepted.
    Connected,
    /// Member of a federation execution; service calls are accepted.
    Joined,
    /// Resign call in flight.
    Resigning,
    /// Protocol violation detected. Terminal.
    Faulted,
    /// Closed by the federate. Terminal.
    Closed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Faulted | Self::Closed)
    }

    /// A live transport exists in this state.
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected | Self::Joined | Self::Resigning)
    }

    pub fn allows_service_calls(&self) -> bool {
        matches!(self, Self::Joined)
    }

    pub fn allows_admin_calls(&self) -> bool {
        matches!(self, Self::Connected | Self::Joined)
    }

    /// Transition table. Teardown edges (→ Disconnected, Faulted, Closed) are
    /// accepted from every non-terminal state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Disconnected | Faulted | Closed) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Joined) => true,
            (Joined, Resigning) => true,
            (Resigning, Connected | Joined) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Joined => "joined",
            Self::Resigning => "resigning",
            Self::Faulted => "faulted",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
