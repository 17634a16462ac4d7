//! Length-prefixed message framing.
//!
//! Header layout: 4-byte big-endian payload length, then a 1-byte frame
//! type, then the JSON payload. The length counts the payload only.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtoError, Result};

/// Maximum accepted payload size. Control messages are small; anything
/// bigger indicates a corrupt or hostile stream.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size: 4-byte length + 1-byte type.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Discriminates what a frame's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A client request (`Request`).
    Request = 0x01,
    /// A unary response (`Response`).
    Response = 0x02,
    /// One streamed signal (`PairingPort`).
    Stream = 0x03,
    /// A session-fatal error (`RemoteError`).
    Error = 0x04,
}

impl FrameType {
    /// Human-readable name, used in `UnexpectedFrame` errors.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Stream => "stream",
            Self::Error => "error",
        }
    }
}

impl TryFrom<u8> for FrameType {
    type Error = ProtoError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Request),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Stream),
            0x04 => Ok(Self::Error),
            other => Err(ProtoError::UnknownFrameType(other)),
        }
    }
}

/// One frame on the control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the payload contains.
    pub frame_type: FrameType,
    /// JSON-encoded payload.
    pub payload: Bytes,
}

impl Frame {
    /// Encodes a message as a frame of the given type.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be serialized.
    pub fn encode<T: Serialize>(frame_type: FrameType, msg: &T) -> Result<Self> {
        let payload = serde_json::to_vec(msg)?;
        Ok(Self {
            frame_type,
            payload: Bytes::from(payload),
        })
    }

    /// Decodes this frame's payload into a message.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Codec turning a byte stream into frames and back.
#[derive(Debug)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Creates a codec with the default size limit.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtoError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        if payload_len > self.max_frame_size {
            return Err(ProtoError::FrameTooLarge {
                size: payload_len,
                max: self.max_frame_size,
            });
        }

        if src.len() < FRAME_HEADER_SIZE + payload_len {
            src.reserve(FRAME_HEADER_SIZE + payload_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src.get_u8())?;
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtoError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.payload.len() > self.max_frame_size {
            return Err(ProtoError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        dst.put_u32(u32::try_from(frame.payload.len()).map_err(|_| {
            ProtoError::FrameTooLarge {
                size: frame.payload.len(),
                max: self.max_frame_size,
            }
        })?);
        dst.put_u8(frame.frame_type as u8);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}
