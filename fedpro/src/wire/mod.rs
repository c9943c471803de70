//! Wire format for the federate ↔ RTI connection.
//!
//! # Architecture
//!
//! - **frame**: Envelope type and pure encode/decode
//! - **codec**: Streaming codec for AsyncRead/AsyncWrite
//! - **protocol**: The few payload conventions the session engine reads

pub mod codec;
pub mod frame;
pub mod protocol;

pub use codec::{CodecError, DEFAULT_MAX_FRAME_LENGTH, FrameCodec};
pub use frame::{Frame, FrameType, MalformedFrame};
pub use protocol::{
    CallbackAck, ControlMessage, FEDERATE_PROTOCOL_VERSION, NewSessionReason, OrderingClass,
    PayloadError, ReplyBody,
};
