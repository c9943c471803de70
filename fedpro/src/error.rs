//! Error taxonomy surfaced by the session engine.

use std::time::Duration;

use bytes::Bytes;

use crate::state::SessionState;
use crate::wire::MalformedFrame;

/// Failure reported by the RTI inside a Reply. The payload is passed through
/// untouched for the service layer to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceError {
    payload: Bytes,
}

impl ServiceError {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn into_payload(self) -> Bytes {
        self.payload
    }
}

impl std::fmt::Display for ServiceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.payload))
    }
}

impl std::error::Error for ServiceError {}

/// Error returned by session operations.
///
/// `Clone` so that a single transport or protocol failure can be fanned out to
/// every pending call and every blocked evoke.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    /// Dial or handshake failure. The session stays Disconnected.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connect { endpoint: String, reason: String },

    /// Write to the transport failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// The connection went away while the operation was outstanding.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("call {sequence} timed out after {timeout:?}")]
    CallTimeout { sequence: u64, timeout: Duration },

    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] MalformedFrame),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Precondition violation. Nothing was sent.
    #[error("{operation} is not allowed while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("service error reported by RTI: {0}")]
    Service(ServiceError),

    #[error("evoke is not allowed from within a callback")]
    EvokeWithinCallback,

    #[error("unbounded evoke is disabled by configuration")]
    UnboundedEvoke,

    /// The same operation is already running on this session. Nothing was sent.
    #[error("{operation} is already in progress")]
    InProgress { operation: &'static str },
}

impl SessionError {
    pub fn invalid_state(operation: &'static str, state: SessionState) -> Self {
        Self::InvalidState { operation, state }
    }

    pub(crate) fn connection_lost(reason: impl Into<String>) -> Self {
        Self::ConnectionLost(reason.into())
    }

    /// The session that produced this error can no longer carry calls.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Transport(_)
                | Self::ConnectionLost(_)
                | Self::MalformedFrame(_)
                | Self::ProtocolViolation(_)
        )
    }

    /// Retrying the same operation may succeed.
    ///
    /// A timed-out call may still have executed on the RTI; callers retry at
    /// their own risk since delivery is at-most-once.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::CallTimeout { .. })
    }

    pub fn as_service_error(&self) -> Option<&ServiceError> {
        match self {
            Self::Service(e) => Some(e),
            _ => None,
        }
    }
}

/// Error returned by a federate's callback handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CallbackError {
    message: String,
}

impl CallbackError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(SessionError::connection_lost("reset").is_fatal());
        assert!(SessionError::ProtocolViolation("dup".into()).is_fatal());
        assert!(SessionError::MalformedFrame(MalformedFrame::UnknownType(0)).is_fatal());
        assert!(!SessionError::invalid_state("call", SessionState::Connected).is_fatal());
        assert!(
            !SessionError::CallTimeout {
                sequence: 1,
                timeout: Duration::from_millis(5)
            }
            .is_fatal()
        );
    }

    #[test]
    fn retryable_classification() {
        assert!(
            SessionError::Connect {
                endpoint: "tcp://localhost:15164".into(),
                reason: "refused".into()
            }
            .is_retryable()
        );
        assert!(!SessionError::connection_lost("reset").is_retryable());
        assert!(!SessionError::Service(ServiceError::new("x")).is_retryable());
    }

    #[test]
    fn display_messages() {
        assert_eq!(
            SessionError::invalid_state("join", SessionState::Joined).to_string(),
            "join is not allowed while joined"
        );
        assert_eq!(
            SessionError::InProgress { operation: "join" }.to_string(),
            "join is already in progress"
        );
        assert_eq!(
            SessionError::Service(ServiceError::new("FederateNotExecutionMember")).to_string(),
            "service error reported by RTI: FederateNotExecutionMember"
        );
        assert_eq!(
            SessionError::CallTimeout {
                sequence: 4,
                timeout: Duration::from_millis(250)
            }
            .to_string(),
            "call 4 timed out after 250ms"
        );
    }

    #[test]
    fn service_error_payload_is_verbatim() {
        let err = SessionError::Service(ServiceError::new(Bytes::from_static(&[0xff, 0x00])));
        assert_eq!(
            err.as_service_error().unwrap().payload().as_ref(),
            &[0xff, 0x00]
        );
    }
}
