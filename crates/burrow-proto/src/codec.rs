//! Codec for encoding/decoding tunnel frames

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream ended inside a frame")]
    TruncatedFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel frame codec
///
/// Works for any serde-encodable wrapper; the agent and tool tunnels share
/// the same framing with different message enums.
pub struct FrameCodec;

impl FrameCodec {
    /// Maximum frame size (16MB)
    pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

    /// Encode a frame to bytes
    ///
    /// Format: [length: u32 BE][payload: bincode serialized message]
    pub fn encode<M: Serialize>(msg: &M) -> Result<Bytes, CodecError> {
        let payload = bincode::serialize(msg)?;

        if payload.len() > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err on error
    pub fn decode<M: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<M>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > Self::MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            return Ok(None);
        }

        let _ = buf.split_to(4);
        let msg_bytes = buf.split_to(length);

        let msg: M = bincode::deserialize(&msg_bytes)?;

        Ok(Some(msg))
    }
}
