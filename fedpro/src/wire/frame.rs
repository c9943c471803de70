//! Frame envelope: `[length:4][type:1][sequence:8][payload:N]`.
//!
//! - **length**: bytes following the length field (header + payload), big-endian u32
//! - **type**: [`FrameType`] tag
//! - **sequence**: big-endian u64
//! - **payload**: opaque to this layer

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the length prefix.
pub const LENGTH_FIELD_LEN: usize = 4;

/// Size of the header that follows the length prefix: type tag + sequence number.
pub const HEADER_LEN: usize = 1 + 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MalformedFrame {
    #[error("truncated frame: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },

    #[error("declared length {declared} does not match {available} available bytes")]
    LengthMismatch { declared: usize, available: usize },

    #[error("unrecognized frame type tag {0:#04x}")]
    UnknownType(u8),

    #[error("frame exceeds maximum length of {max} bytes")]
    Oversized { max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Service invocation from the federate.
    Call = 1,
    /// Answer to exactly one Call, or a callback acknowledgement from the federate.
    Reply = 2,
    /// Notification pushed by the RTI.
    Callback = 3,
    /// Session bookkeeping (heartbeats, goodbye).
    Control = 4,
}

impl FrameType {
    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Reply => "reply",
            Self::Callback => "callback",
            Self::Control => "control",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = MalformedFrame;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        match tag {
            1 => Ok(Self::Call),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Callback),
            4 => Ok(Self::Control),
            other => Err(MalformedFrame::UnknownType(other)),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub sequence: u64,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            sequence,
            payload: payload.into(),
        }
    }

    pub fn call(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Call, sequence, payload)
    }

    pub fn reply(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Reply, sequence, payload)
    }

    pub fn callback(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Callback, sequence, payload)
    }

    /// Control frames never consume call sequence numbers.
    pub fn control(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Control, 0, payload)
    }

    /// Bytes following the length prefix.
    pub fn body_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Encode the full envelope, length prefix included.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + self.body_len());
        buf.put_u32(self.body_len() as u32);
        self.encode_body(&mut buf);
        buf.freeze()
    }

    /// Decode a complete envelope, length prefix included.
    pub fn decode(bytes: &[u8]) -> Result<Self, MalformedFrame> {
        if bytes.len() < LENGTH_FIELD_LEN {
            return Err(MalformedFrame::Truncated {
                needed: LENGTH_FIELD_LEN,
                have: bytes.len(),
            });
        }
        let mut cursor = bytes;
        let declared = cursor.get_u32() as usize;
        if declared != cursor.len() {
            return Err(MalformedFrame::LengthMismatch {
                declared,
                available: cursor.len(),
            });
        }
        Self::decode_body(Bytes::copy_from_slice(cursor))
    }

    pub(crate) fn encode_body(&self, dst: &mut BytesMut) {
        dst.reserve(self.body_len());
        dst.put_u8(self.frame_type.tag());
        dst.put_u64(self.sequence);
        dst.put_slice(&self.payload);
    }

    /// Decode the bytes following the length prefix.
    pub(crate) fn decode_body(mut body: Bytes) -> Result<Self, MalformedFrame> {
        if body.len() < HEADER_LEN {
            return Err(MalformedFrame::Truncated {
                needed: HEADER_LEN,
                have: body.len(),
            });
        }
        let frame_type = FrameType::try_from(body.get_u8())?;
        let sequence = body.get_u64();
        Ok(Self {
            frame_type,
            sequence,
            payload: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_layout_is_big_endian() {
        let frame = Frame::call(0x0102, Bytes::from_static(b"hi"));
        let bytes = frame.encode();

        assert_eq!(
            bytes.as_ref(),
            &[0, 0, 0, 11, 1, 0, 0, 0, 0, 0, 0, 0x01, 0x02, b'h', b'i']
        );
    }

    #[test]
    fn roundtrip_preserves_fields() {
        let frame = Frame::callback(u64::MAX, Bytes::from_static(&[0, 1, 2, 3]));
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn roundtrip_empty_payload() {
        let frame = Frame::control(Bytes::new());
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.frame_type, FrameType::Control);
        assert_eq!(decoded.sequence, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn decode_rejects_missing_length_prefix() {
        assert_eq!(
            Frame::decode(&[0, 0]),
            Err(MalformedFrame::Truncated { needed: 4, have: 2 })
        );
    }

    #[test]
    fn decode_rejects_length_mismatch() {
        let mut bytes = Frame::reply(7, Bytes::from_static(b"abc")).encode().to_vec();
        bytes.pop();

        assert_eq!(
            Frame::decode(&bytes),
            Err(MalformedFrame::LengthMismatch {
                declared: 12,
                available: 11
            })
        );
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = Frame::reply(7, Bytes::new()).encode().to_vec();
        bytes.push(0xff);

        assert!(matches!(
            Frame::decode(&bytes),
            Err(MalformedFrame::LengthMismatch { .. })
        ));
    }

    #[test]
    fn decode_rejects_truncated_header() {
        // Declared length covers only the type tag.
        let bytes = [0, 0, 0, 1, 1];
        assert_eq!(
            Frame::decode(&bytes),
            Err(MalformedFrame::Truncated { needed: 9, have: 1 })
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut bytes = Frame::call(1, Bytes::new()).encode().to_vec();
        bytes[4] = 0;
        assert_eq!(Frame::decode(&bytes), Err(MalformedFrame::UnknownType(0)));

        bytes[4] = 9;
        assert_eq!(Frame::decode(&bytes), Err(MalformedFrame::UnknownType(9)));
    }
}
