//! Codec for encoding/decoding frames

use crate::frame::Frame;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length header size in bytes
const HEADER_LEN: usize = 4;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
}

/// Frame codec
///
/// Format: `[length: u32 big-endian][payload: bincode serialized Frame]`
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        // Need at least 4 bytes for length header
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut length_bytes = [0u8; HEADER_LEN];
        length_bytes.copy_from_slice(&buf[..HEADER_LEN]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            tracing::warn!(length, max = MAX_FRAME_SIZE, "Peer announced oversized frame");
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < HEADER_LEN + length {
            buf.reserve(HEADER_LEN + length - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let frame_bytes = buf.split_to(length);
        let frame: Frame = bincode::deserialize(&frame_bytes)?;
        tracing::trace!(
            kind = frame.kind(),
            connection_id = ?frame.connection_id(),
            length,
            "Decoded frame"
        );

        Ok(Some(frame))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, buf: &mut BytesMut) -> Result<(), CodecError> {
        let payload = bincode::serialize(&frame)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        buf.reserve(HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(())
    }
}
