//! Core identifiers and file-entry model for the Reliquary artifact store
//!
//! Artifacts are immutable byte sequences named by the SHA-1 of their
//! content. The 40-character lowercase hex form is the portable name; the
//! integer rid is a repository-local handle and never crosses the wire.

use crate::error::Error;
use serde::{Deserialize, Serialize};

/// Number of raw bytes in an artifact identifier (SHA-1 digest width).
pub const ARTIFACT_ID_BYTES: usize = 20;

/// Number of hex characters in the portable artifact name.
pub const ARTIFACT_ID_HEX: usize = 40;

/// Content address of an artifact: SHA-1 over the uncompressed bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArtifactId(pub [u8; ARTIFACT_ID_BYTES]);

impl ArtifactId {
    /// Parse the 40-character lowercase hex form.
    ///
    /// Uppercase hex is rejected: the canonical name is lowercase and the
    /// sync protocol compares identifiers textually.
    pub fn from_hex(s: &str) -> Result<Self, Error> {
        if s.len() != ARTIFACT_ID_HEX || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::InvalidArtifactId(s.into()));
        }
        let mut bytes = [0u8; ARTIFACT_ID_BYTES];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| Error::InvalidArtifactId(s.into()))?;
        Ok(Self(bytes))
    }

    /// The 40-character lowercase hex form.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get as raw bytes
    pub fn as_bytes(&self) -> &[u8; ARTIFACT_ID_BYTES] {
        &self.0
    }
}

impl std::fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::str::FromStr for ArtifactId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        Self::from_hex(s)
    }
}

/// Repository-local artifact handle.
///
/// Stable within one repository, never portable between repositories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid(pub i64);

impl Rid {
    /// Big-endian key form, so ordered storage iterates in rid order.
    pub fn to_key(self) -> [u8; 8] {
        (self.0 as u64).to_be_bytes()
    }

    /// Recover a rid from its key form.
    pub fn from_key(key: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&key[..8]);
        Rid(u64::from_be_bytes(buf) as i64)
    }
}

impl std::fmt::Display for Rid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permission bits carried on a file entry.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilePerm {
    /// Ordinary file
    #[default]
    Regular,
    /// Executable file ("x")
    Executable,
    /// Symbolic link ("l")
    Link,
}

impl FilePerm {
    /// Wire token for this permission, if any.
    pub fn as_token(self) -> Option<&'static str> {
        match self {
            FilePerm::Regular => None,
            FilePerm::Executable => Some("x"),
            FilePerm::Link => Some("l"),
        }
    }

    /// Parse a wire token. "w" is the explicit spelling of Regular, used
    /// to fill the permission slot when a rename follows.
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "w" => Some(FilePerm::Regular),
            "x" => Some(FilePerm::Executable),
            "l" => Some(FilePerm::Link),
            _ => None,
        }
    }
}

/// One file named by a checkin manifest.
///
/// `uuid` is `None` only inside a delta manifest, where it marks the file
/// as removed relative to the baseline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Repository-relative path
    pub name: String,
    /// Content address of the file blob; None = delete marker
    pub uuid: Option<ArtifactId>,
    /// Permission bits
    pub perm: FilePerm,
    /// Previous path when this entry records a rename
    pub prior_name: Option<String>,
}

impl FileEntry {
    /// Create a plain entry for `name` with content `uuid`.
    pub fn new(name: impl Into<String>, uuid: ArtifactId) -> Self {
        Self {
            name: name.into(),
            uuid: Some(uuid),
            perm: FilePerm::Regular,
            prior_name: None,
        }
    }

    /// True when this entry deletes its file from the baseline.
    pub fn is_delete(&self) -> bool {
        self.uuid.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_artifact_id_hex_roundtrip() {
        let hex = "da39a3ee5e6b4b0d3255bfef95601890afd80709";
        let id = ArtifactId::from_hex(hex).unwrap();
        assert_eq!(id.to_hex(), hex);
        assert_eq!(format!("{}", id), hex);
    }

    #[test]
    fn test_artifact_id_rejects_bad_input() {
        assert!(ArtifactId::from_hex("da39").is_err());
        assert!(ArtifactId::from_hex("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709").is_err());
        assert!(ArtifactId::from_hex("zz39a3ee5e6b4b0d3255bfef95601890afd80709").is_err());
    }

    #[test]
    fn test_rid_key_ordering() {
        let a = Rid(5).to_key();
        let b = Rid(6).to_key();
        let c = Rid(300).to_key();
        assert!(a < b);
        assert!(b < c);
        assert_eq!(Rid::from_key(&c), Rid(300));
    }
}
