//! Message framing for network transport
//!
//! One frame carries one complete sync message body. The server reads a
//! whole request into memory before replying, so framing is a simple
//! length prefix plus a kind byte and the body's content type.

use crate::body::{BodyError, ContentType};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (64 MB)
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Body error: {0}")]
    Body(#[from] BodyError),
    #[error("Unknown frame kind: {0}")]
    UnknownKind(u8),
}

/// Frame kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client-to-server sync message
    Request = 0,
    /// Server reply
    Response = 1,
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0 => Ok(Self::Request),
            1 => Ok(Self::Response),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

/// A framed message
#[derive(Clone, Debug)]
pub struct Frame {
    /// Request or response
    pub kind: FrameKind,
    /// Encoding of the payload
    pub content_type: ContentType,
    /// Encoded body bytes
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, content_type: ContentType, payload: Vec<u8>) -> Self {
        Self {
            kind,
            content_type,
            payload,
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes kind and content-type bytes)
/// - 1 byte: frame kind
/// - 1 byte: content type
/// - N bytes: payload
#[derive(Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 6 bytes (4 length + kind + content type)
        if src.len() < 6 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if src.len() < 4 + length {
            return Ok(None);
        }

        src.advance(4);
        let kind = FrameKind::try_from(src[0])?;
        let content_type = ContentType::try_from(src[1])?;
        src.advance(2);

        let payload = src.split_to(length - 2).to_vec();
        Ok(Some(Frame {
            kind,
            content_type,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 2 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.put_u32(length as u32);
        dst.put_u8(item.kind as u8);
        dst.put_u8(item.content_type as u8);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
