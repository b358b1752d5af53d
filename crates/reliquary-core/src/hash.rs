//! Content addressing and sync authentication digests
//!
//! Every artifact is named by the SHA-1 of its uncompressed content.
//! Manifest bodies and cluster inventories carry md5 trailers, and the
//! sync protocol authenticates with a nonce/signature pair derived here.

use crate::types::ArtifactId;
use sha1::{Digest, Sha1};

/// Content address of a byte sequence.
pub fn artifact_id(content: &[u8]) -> ArtifactId {
    let mut hasher = Sha1::new();
    hasher.update(content);
    ArtifactId(hasher.finalize().into())
}

/// SHA-1 of arbitrary bytes as lowercase hex.
pub fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// md5 of arbitrary bytes as lowercase hex (Z-card and cluster trailers).
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Login nonce: SHA-1 over the remainder of the request body.
///
/// The nonce binds the signature to the exact message it closes, so a
/// captured login card cannot be replayed on a different payload.
pub fn request_nonce(body_after_login: &[u8]) -> String {
    sha1_hex(body_after_login)
}

/// Login signature: `SHA1(NONCE || secret)` over the hex nonce text.
pub fn login_signature(nonce_hex: &str, secret: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce_hex.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Project-salted shared secret for a plaintext stored password.
///
/// `SHA1(project_code || "/" || user || "/" || password)`. Peers that
/// store the hashed form use it directly as the secret.
pub fn shared_secret(project_code: &str, user: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(project_code.as_bytes());
    hasher.update(b"/");
    hasher.update(user.as_bytes());
    hasher.update(b"/");
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

/// True when `s` looks like a stored SHA-1 form (40 lowercase hex chars).
pub fn is_sha1_hex(s: &str) -> bool {
    s.len() == 40 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
