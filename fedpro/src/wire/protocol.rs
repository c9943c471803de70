//! Payload conventions the session engine interprets itself.
//!
//! Everything else inside a payload belongs to the typed service layer and is
//! passed through verbatim.
//!
//! - **Reply**: `[status:1][body..]`, status 0 = ok, 1 = service error
//! - **Callback**: `[ordering:1][body..]`, ordering 0 = receive, 1 = timestamp
//! - **Control**: `[kind:1][args..]`, see [`ControlMessage`]
//! - **Callback ack** (federate → RTI, sent as a Reply): `[0]` or `[1][utf8 message]`

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

const REPLY_OK: u8 = 0;
const REPLY_SERVICE_ERROR: u8 = 1;

const CONTROL_HEARTBEAT: u8 = 1;
const CONTROL_HEARTBEAT_RESPONSE: u8 = 2;
const CONTROL_GOODBYE: u8 = 3;
const CONTROL_NEW_SESSION: u8 = 4;
const CONTROL_NEW_SESSION_STATUS: u8 = 5;
const CONTROL_TERMINATE_SESSION: u8 = 6;
const CONTROL_SESSION_TERMINATED: u8 = 7;

/// Protocol version offered in the new-session handshake.
pub const FEDERATE_PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    #[error("empty {0} payload")]
    Empty(&'static str),

    #[error("unknown reply status {0:#04x}")]
    UnknownReplyStatus(u8),

    #[error("unknown ordering class {0:#04x}")]
    UnknownOrdering(u8),

    #[error("control message {kind:#04x} is truncated")]
    TruncatedControl { kind: u8 },
}

/// Body of a Reply frame: either a result or a failure reported by the RTI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Ok(Bytes),
    ServiceError(Bytes),
}

impl ReplyBody {
    pub fn parse(mut payload: Bytes) -> Result<Self, PayloadError> {
        if payload.is_empty() {
            return Err(PayloadError::Empty("reply"));
        }
        match payload.get_u8() {
            REPLY_OK => Ok(Self::Ok(payload)),
            REPLY_SERVICE_ERROR => Ok(Self::ServiceError(payload)),
            other => Err(PayloadError::UnknownReplyStatus(other)),
        }
    }

    pub fn encode(&self) -> Bytes {
        let (status, body) = match self {
            Self::Ok(body) => (REPLY_OK, body),
            Self::ServiceError(body) => (REPLY_SERVICE_ERROR, body),
        };
        let mut buf = BytesMut::with_capacity(1 + body.len());
        buf.put_u8(status);
        buf.put_slice(body);
        buf.freeze()
    }
}

/// Ordering class requested for a callback. Preserved, never acted upon.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderingClass {
    #[default]
    Receive,
    Timestamp,
}

impl OrderingClass {
    pub fn tag(self) -> u8 {
        match self {
            Self::Receive => 0,
            Self::Timestamp => 1,
        }
    }
}

impl TryFrom<u8> for OrderingClass {
    type Error = PayloadError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            0 => Ok(Self::Receive),
            1 => Ok(Self::Timestamp),
            other => Err(PayloadError::UnknownOrdering(other)),
        }
    }
}

/// Split a Callback frame payload into its ordering class and opaque body.
pub fn parse_callback(mut payload: Bytes) -> Result<(OrderingClass, Bytes), PayloadError> {
    if payload.is_empty() {
        return Err(PayloadError::Empty("callback"));
    }
    let ordering = OrderingClass::try_from(payload.get_u8())?;
    Ok((ordering, payload))
}

pub fn encode_callback(ordering: OrderingClass, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(ordering.tag());
    buf.put_slice(body);
    buf.freeze()
}

/// Outcome of a handler invocation, reported back to the RTI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAck {
    Succeeded,
    Failed(String),
}

impl CallbackAck {
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Succeeded => Bytes::from_static(&[REPLY_OK]),
            Self::Failed(message) => {
                let mut buf = BytesMut::with_capacity(1 + message.len());
                buf.put_u8(REPLY_SERVICE_ERROR);
                buf.put_slice(message.as_bytes());
                buf.freeze()
            }
        }
    }

    pub fn parse(payload: Bytes) -> Result<Self, PayloadError> {
        match ReplyBody::parse(payload)? {
            ReplyBody::Ok(_) => Ok(Self::Succeeded),
            ReplyBody::ServiceError(message) => {
                Ok(Self::Failed(String::from_utf8_lossy(&message).into_owned()))
            }
        }
    }
}

/// Answer to a new-session request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewSessionReason {
    Success,
    UnsupportedProtocolVersion,
    OutOfResources,
    BadMessage,
    Other(u32),
}

impl NewSessionReason {
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::UnsupportedProtocolVersion => 1,
            Self::OutOfResources => 2,
            Self::BadMessage => 3,
            Self::Other(code) => code,
        }
    }
}

impl From<u32> for NewSessionReason {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::UnsupportedProtocolVersion,
            2 => Self::OutOfResources,
            3 => Self::BadMessage,
            other => Self::Other(other),
        }
    }
}

impl std::fmt::Display for NewSessionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => f.write_str("success"),
            Self::UnsupportedProtocolVersion => f.write_str("unsupported protocol version"),
            Self::OutOfResources => f.write_str("out of resources"),
            Self::BadMessage => f.write_str("bad message"),
            Self::Other(code) => write!(f, "error code {code}"),
        }
    }
}

/// Session bookkeeping carried in Control frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Heartbeat { id: u64 },
    HeartbeatResponse { responding_to: u64 },
    /// The RTI is ending the session.
    Goodbye { reason: String },
    /// First frame on every connection: `[4][version:4]`.
    NewSession { version: u32 },
    /// `[5][reason:4][session_id:8]`. The id is assigned by the RTI.
    NewSessionStatus {
        reason: NewSessionReason,
        session_id: u64,
    },
    /// Orderly end requested by the federate.
    TerminateSession,
    /// The RTI's confirmation of [`ControlMessage::TerminateSession`].
    SessionTerminated,
    /// A kind this client does not know; ignored.
    Unknown { kind: u8 },
}

impl ControlMessage {
    pub fn parse(mut payload: Bytes) -> Result<Self, PayloadError> {
        if payload.is_empty() {
            return Err(PayloadError::Empty("control"));
        }
        let kind = payload.get_u8();
        match kind {
            CONTROL_HEARTBEAT | CONTROL_HEARTBEAT_RESPONSE => {
                if payload.len() < 8 {
                    return Err(PayloadError::TruncatedControl { kind });
                }
                let value = payload.get_u64();
                if kind == CONTROL_HEARTBEAT {
                    Ok(Self::Heartbeat { id: value })
                } else {
                    Ok(Self::HeartbeatResponse {
                        responding_to: value,
                    })
                }
            }
            CONTROL_GOODBYE => Ok(Self::Goodbye {
                reason: String::from_utf8_lossy(&payload).into_owned(),
            }),
            CONTROL_NEW_SESSION => {
                if payload.len() < 4 {
                    return Err(PayloadError::TruncatedControl { kind });
                }
                Ok(Self::NewSession {
                    version: payload.get_u32(),
                })
            }
            CONTROL_NEW_SESSION_STATUS => {
                if payload.len() < 12 {
                    return Err(PayloadError::TruncatedControl { kind });
                }
                let reason = NewSessionReason::from(payload.get_u32());
                Ok(Self::NewSessionStatus {
                    reason,
                    session_id: payload.get_u64(),
                })
            }
            CONTROL_TERMINATE_SESSION => Ok(Self::TerminateSession),
            CONTROL_SESSION_TERMINATED => Ok(Self::SessionTerminated),
            kind => Ok(Self::Unknown { kind }),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(13);
        match self {
            Self::Heartbeat { id } => {
                buf.put_u8(CONTROL_HEARTBEAT);
                buf.put_u64(*id);
            }
            Self::HeartbeatResponse { responding_to } => {
                buf.put_u8(CONTROL_HEARTBEAT_RESPONSE);
                buf.put_u64(*responding_to);
            }
            Self::Goodbye { reason } => {
                buf.put_u8(CONTROL_GOODBYE);
                buf.put_slice(reason.as_bytes());
            }
            Self::NewSession { version } => {
                buf.put_u8(CONTROL_NEW_SESSION);
                buf.put_u32(*version);
            }
            Self::NewSessionStatus { reason, session_id } => {
                buf.put_u8(CONTROL_NEW_SESSION_STATUS);
                buf.put_u32(reason.code());
                buf.put_u64(*session_id);
            }
            Self::TerminateSession => buf.put_u8(CONTROL_TERMINATE_SESSION),
            Self::SessionTerminated => buf.put_u8(CONTROL_SESSION_TERMINATED),
            Self::Unknown { kind } => buf.put_u8(*kind),
        }
        buf.freeze()
    }
}
