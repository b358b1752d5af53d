//! User accounts and capability gating for sync sessions
//!
//! A sync request closes with a `login USER NONCE SIG` card. The nonce is
//! the SHA-1 of the message body above the login card, and the signature
//! is `SHA1(NONCE || secret)`. The stored password may be plaintext or
//! its project-salted SHA-1; both forms are accepted.

use crate::storage::{Storage, StorageError, UserRecord};
use reliquary_core::hash::{is_sha1_hex, login_signature, shared_secret};
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("login signature mismatch")]
    BadSignature,
    #[error("not authorized: {0}")]
    NotAuthorized(&'static str),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// What an authenticated peer may do.
///
/// Capability characters: `o` read, `i` write, `g` clone, `x` private,
/// `s` everything. Writing, cloning and private sync imply reading.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
    pub clone: bool,
    pub private: bool,
}

impl Capabilities {
    /// Parse a capability string from the user table.
    pub fn parse(caps: &str) -> Self {
        let mut out = Capabilities::default();
        for ch in caps.chars() {
            match ch {
                'o' => out.read = true,
                'i' => {
                    out.read = true;
                    out.write = true;
                }
                'g' => {
                    out.read = true;
                    out.clone = true;
                }
                'x' => {
                    out.read = true;
                    out.private = true;
                }
                's' => {
                    out = Capabilities::all();
                }
                _ => {}
            }
        }
        out
    }

    pub fn all() -> Self {
        Capabilities {
            read: true,
            write: true,
            clone: true,
            private: true,
        }
    }
}

/// Secrets a stored password can sign with: the SHA-1 form directly, or
/// the project-salted digest of a plaintext form (with the raw plaintext
/// accepted for peers that never learned the project code).
fn secret_candidates(project_code: &str, user: &UserRecord) -> Vec<String> {
    if is_sha1_hex(&user.pw) {
        vec![user.pw.clone()]
    } else {
        vec![
            shared_secret(project_code, &user.login, &user.pw),
            user.pw.clone(),
        ]
    }
}

/// Verify a login card against the user table.
pub fn verify_login(
    storage: &Storage,
    project_code: &str,
    login: &str,
    nonce: &str,
    sig: &str,
) -> Result<Capabilities, AuthError> {
    let user = storage
        .get_user(login)?
        .ok_or_else(|| AuthError::UnknownUser(login.into()))?;
    let authentic = secret_candidates(project_code, &user)
        .iter()
        .any(|secret| login_signature(nonce, secret) == sig);
    if !authentic {
        return Err(AuthError::BadSignature);
    }
    Ok(Capabilities::parse(&user.caps))
}

/// The signing secret a client uses for `project_code`; mirrors the
/// server-side candidate list.
pub fn client_secret(project_code: &str, login: &str, password: &str) -> String {
    if is_sha1_hex(password) {
        password.to_string()
    } else {
        shared_secret(project_code, login, password)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliquary_core::hash::request_nonce;
    use tempfile::tempdir;

    fn storage_with_user(pw: &str, caps: &str) -> (Storage, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        storage
            .put_user(&UserRecord {
                login: "alice".into(),
                pw: pw.into(),
                caps: caps.into(),
            })
            .unwrap();
        (storage, dir)
    }

    #[test]
    fn test_caps_parsing() {
        let caps = Capabilities::parse("i");
        assert!(caps.read && caps.write);
        assert!(!caps.clone && !caps.private);

        assert_eq!(Capabilities::parse("s"), Capabilities::all());
        assert_eq!(Capabilities::parse(""), Capabilities::default());
    }

    #[test]
    fn test_login_with_plaintext_password() {
        let (storage, _dir) = storage_with_user("hunter2", "oi");
        let nonce = request_nonce(b"pull a b\n");
        let sig = login_signature(&nonce, &client_secret("proj", "alice", "hunter2"));

        let caps = verify_login(&storage, "proj", "alice", &nonce, &sig).unwrap();
        assert!(caps.write);

        assert!(matches!(
            verify_login(&storage, "proj", "alice", &nonce, "0badsig"),
            Err(AuthError::BadSignature)
        ));
        assert!(matches!(
            verify_login(&storage, "proj", "mallory", &nonce, &sig),
            Err(AuthError::UnknownUser(_))
        ));
    }

    #[test]
    fn test_login_with_hashed_password() {
        let hashed = shared_secret("proj", "alice", "hunter2");
        let (storage, _dir) = storage_with_user(&hashed, "g");
        let nonce = request_nonce(b"clone\n");
        // the client derives the same secret from the plaintext
        let sig = login_signature(&nonce, &client_secret("proj", "alice", "hunter2"));
        let caps = verify_login(&storage, "proj", "alice", &nonce, &sig).unwrap();
        assert!(caps.clone && caps.read);
    }

    #[test]
    fn test_wrong_project_code_fails_for_hashed_form() {
        let hashed = shared_secret("proj", "alice", "hunter2");
        let (storage, _dir) = storage_with_user(&hashed, "o");
        let nonce = request_nonce(b"pull a b\n");
        let sig = login_signature(&nonce, &client_secret("other", "alice", "hunter2"));
        assert!(matches!(
            verify_login(&storage, "proj", "alice", &nonce, &sig),
            Err(AuthError::BadSignature)
        ));
    }
}
