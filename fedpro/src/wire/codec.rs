//! Framed codec for the RTI connection.
//!
//! Uses LengthDelimitedCodec for the 4-byte length prefix and [`Frame`] for the
//! envelope behind it. Works over any AsyncRead/AsyncWrite (TCP, unix sockets,
//! in-memory duplex streams).

use std::io;

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

use super::frame::{Frame, LENGTH_FIELD_LEN, MalformedFrame};

/// Default upper bound for a single frame (length prefix excluded).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Malformed(#[from] MalformedFrame),
}

/// Codec that frames [`Frame`]s with a big-endian u32 length prefix.
pub struct FrameCodec {
    inner: LengthDelimitedCodec,
    max_frame_length: usize,
    /// Declared length of a frame whose prefix has been consumed but whose body has not.
    pending: Option<usize>,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl FrameCodec {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(LENGTH_FIELD_LEN)
                .max_frame_length(max_frame_length)
                .big_endian()
                .new_codec(),
            max_frame_length,
            pending: None,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.pending.is_none() && src.len() >= LENGTH_FIELD_LEN {
            self.pending = Some(u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize);
        }
        let body = match self.inner.decode(src) {
            Ok(Some(body)) => {
                self.pending = None;
                body
            }
            Ok(None) => return Ok(None),
            Err(e) if is_length_error(&e) => {
                return Err(MalformedFrame::Oversized {
                    max: self.max_frame_length,
                }
                .into());
            }
            Err(e) => return Err(e.into()),
        };
        let frame = Frame::decode_body(body.freeze())?;
        tracing::trace!(
            frame_type = %frame.frame_type,
            sequence = frame.sequence,
            payload_bytes = frame.payload.len(),
            "Decoded frame"
        );
        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        match self.pending {
            None if src.is_empty() => Ok(None),
            None => Err(MalformedFrame::Truncated {
                needed: LENGTH_FIELD_LEN,
                have: src.len(),
            }
            .into()),
            Some(declared) => Err(MalformedFrame::Truncated {
                needed: LENGTH_FIELD_LEN + declared,
                have: LENGTH_FIELD_LEN + src.len(),
            }
            .into()),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body_len = item.body_len();
        if body_len > self.max_frame_length {
            return Err(MalformedFrame::Oversized {
                max: self.max_frame_length,
            }
            .into());
        }
        tracing::trace!(
            frame_type = %item.frame_type,
            sequence = item.sequence,
            payload_bytes = item.payload.len(),
            "Encoding frame"
        );
        let mut body = BytesMut::with_capacity(body_len);
        item.encode_body(&mut body);
        self.inner.encode(body.freeze(), dst)?;
        Ok(())
    }
}

fn is_length_error(e: &io::Error) -> bool {
    e.get_ref()
        .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>())
}
