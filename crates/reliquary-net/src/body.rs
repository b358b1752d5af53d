//! Message body encoding
//!
//! Sync message bodies travel under one of three content types; the
//! compressed form is the default on the wire, the uncompressed forms
//! exist for interop and debugging.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// Ceiling on a decompressed body; guards against compression bombs.
pub const MAX_BODY_SIZE: usize = 64 * 1024 * 1024;

/// Body encoding errors
#[derive(Debug, Error)]
pub enum BodyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decompressed body exceeds {MAX_BODY_SIZE} bytes")]
    TooLarge,
    #[error("unknown content type: {0}")]
    UnknownContentType(String),
}

/// Wire content type of a sync message body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ContentType {
    /// `application/x-reliquary`: zlib-compressed card body
    Compressed = 0,
    /// `application/x-reliquary-uncompressed`
    Uncompressed = 1,
    /// `application/x-reliquary-debug`: alias of the uncompressed form
    Debug = 2,
}

impl ContentType {
    /// MIME name used in the outer envelope.
    pub fn mime(self) -> &'static str {
        match self {
            ContentType::Compressed => "application/x-reliquary",
            ContentType::Uncompressed => "application/x-reliquary-uncompressed",
            ContentType::Debug => "application/x-reliquary-debug",
        }
    }

    /// Parse a MIME name.
    pub fn from_mime(mime: &str) -> Result<Self, BodyError> {
        match mime {
            "application/x-reliquary" => Ok(ContentType::Compressed),
            "application/x-reliquary-uncompressed" => Ok(ContentType::Uncompressed),
            "application/x-reliquary-debug" => Ok(ContentType::Debug),
            other => Err(BodyError::UnknownContentType(other.into())),
        }
    }
}

impl TryFrom<u8> for ContentType {
    type Error = BodyError;

    fn try_from(value: u8) -> Result<Self, BodyError> {
        match value {
            0 => Ok(ContentType::Compressed),
            1 => Ok(ContentType::Uncompressed),
            2 => Ok(ContentType::Debug),
            other => Err(BodyError::UnknownContentType(format!("code {}", other))),
        }
    }
}

/// Encode a card body for the wire under `content_type`.
pub fn encode(content_type: ContentType, body: &[u8]) -> Result<Vec<u8>, BodyError> {
    match content_type {
        ContentType::Compressed => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            Ok(encoder.finish()?)
        }
        ContentType::Uncompressed | ContentType::Debug => Ok(body.to_vec()),
    }
}

/// Decode a wire body back into card bytes.
pub fn decode(content_type: ContentType, payload: &[u8]) -> Result<Vec<u8>, BodyError> {
    match content_type {
        ContentType::Compressed => {
            let mut out = Vec::new();
            let mut decoder = ZlibDecoder::new(payload).take(MAX_BODY_SIZE as u64 + 1);
            decoder.read_to_end(&mut out)?;
            if out.len() > MAX_BODY_SIZE {
                return Err(BodyError::TooLarge);
            }
            Ok(out)
        }
        ContentType::Uncompressed | ContentType::Debug => {
            if payload.len() > MAX_BODY_SIZE {
                return Err(BodyError::TooLarge);
            }
            Ok(payload.to_vec())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compressed_roundtrip() {
        let body = b"pull 0000 1111\nlogin alice nonce sig\n".repeat(100);
        let wire = encode(ContentType::Compressed, &body).unwrap();
        assert!(wire.len() < body.len());
        assert_eq!(decode(ContentType::Compressed, &wire).unwrap(), body);
    }

    #[test]
    fn test_uncompressed_is_identity() {
        let body = b"gimme da39a3ee5e6b4b0d3255bfef95601890afd80709\n";
        for ct in [ContentType::Uncompressed, ContentType::Debug] {
            let wire = encode(ct, body).unwrap();
            assert_eq!(wire, body);
            assert_eq!(decode(ct, &wire).unwrap(), body);
        }
    }

    #[test]
    fn test_mime_roundtrip() {
        for ct in [
            ContentType::Compressed,
            ContentType::Uncompressed,
            ContentType::Debug,
        ] {
            assert_eq!(ContentType::from_mime(ct.mime()).unwrap(), ct);
        }
        assert!(ContentType::from_mime("text/html").is_err());
    }

    #[test]
    fn test_garbage_zlib_rejected() {
        assert!(decode(ContentType::Compressed, b"not zlib data").is_err());
    }
}
