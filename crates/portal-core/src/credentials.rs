//! Credential checks against a JSON user file.
//!
//! ```json
//! { "usuarios": [ { "username": "alice", "password": "secret", "name": "Alice" } ] }
//! ```
//!
//! `users` is accepted in place of `usuarios`. A password written as
//! `sha256:<hex>` is compared against the SHA-256 digest of the candidate.
//! Extra fields on a user are kept as opaque metadata.

use serde::Deserialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const SHA256_PREFIX: &str = "sha256:";

/// Anything that can answer "is this username/password pair valid".
pub trait CredentialStore: Send + Sync {
    /// Returns `true` only for a known user with a matching password.
    /// An unavailable store answers `false`.
    fn check(&self, username: &str, password: &str) -> bool;
}

/// One entry of the user file.
#[derive(Debug, Clone, Deserialize)]
pub struct UserRecord {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(flatten)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl UserRecord {
    fn password_matches(&self, candidate: &str) -> bool {
        match self.password.strip_prefix(SHA256_PREFIX) {
            Some(digest) => {
                let Ok(expected) = hex::decode(digest.trim()) else {
                    warn!(username = %self.username, "stored password digest is not valid hex");
                    return false;
                };
                let actual = Sha256::digest(candidate.as_bytes());
                actual.as_slice().ct_eq(&expected).into()
            }
            None => self.password.as_bytes().ct_eq(candidate.as_bytes()).into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserFile {
    #[serde(default, alias = "users")]
    usuarios: Vec<UserRecord>,
}

/// User store backed by a JSON file that is re-read on every check, so edits
/// take effect without a restart.
#[derive(Debug, Clone)]
pub struct JsonUserStore {
    path: PathBuf,
}

impl JsonUserStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all users. `None` if the file is missing or unreadable.
    pub fn users(&self) -> Option<Vec<UserRecord>> {
        if !self.path.exists() {
            warn!(path = %self.path.display(), "users file not found");
            return None;
        }

        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "cannot read users file");
                return None;
            }
        };

        match serde_json::from_str::<UserFile>(&content) {
            Ok(file) => Some(file.usuarios),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "invalid users file");
                None
            }
        }
    }

    /// Find a user by name.
    pub fn lookup(&self, username: &str) -> Option<UserRecord> {
        self.users()?
            .into_iter()
            .find(|u| !u.username.is_empty() && u.username == username)
    }
}

impl CredentialStore for JsonUserStore {
    fn check(&self, username: &str, password: &str) -> bool {
        let valid = self
            .lookup(username)
            .map(|user| user.password_matches(password))
            .unwrap_or(false);

        if valid {
            info!(username, "login accepted");
        } else {
            debug!(username, "login rejected");
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn store_with(content: &str) -> (tempfile::TempDir, JsonUserStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.json");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        (dir, JsonUserStore::new(path))
    }

    #[test]
    fn test_plain_password() {
        let (_dir, store) = store_with(
            r#"{"usuarios": [{"username": "alice", "password": "correct", "rol": "staff"}]}"#,
        );
        assert!(store.check("alice", "correct"));
        assert!(!store.check("alice", "wrong"));
        assert!(!store.check("bob", "correct"));

        let alice = store.lookup("alice").unwrap();
        assert_eq!(alice.metadata.get("rol").and_then(|v| v.as_str()), Some("staff"));
    }

    #[test]
    fn test_hashed_password() {
        let digest = hex::encode(Sha256::digest(b"correct"));
        let (_dir, store) = store_with(&format!(
            r#"{{"users": [{{"username": "alice", "password": "sha256:{digest}"}}]}}"#
        ));
        assert!(store.check("alice", "correct"));
        assert!(!store.check("alice", "sha256:{digest}"));
    }

    #[test]
    fn test_digest_comparison() {
        let digest = hex::encode_upper(Sha256::digest(b"correct"));
        let (_dir, store) = store_with(&format!(
            r#"{{"usuarios": [
                {{"username": "alice", "password": "sha256:{digest}"}},
                {{"username": "bob", "password": "sha256:not-hex"}},
                {{"username": "carol", "password": "sha256:abcd"}}
            ]}}"#
        ));
        // Upper-case hex decodes to the same bytes.
        assert!(store.check("alice", "correct"));
        assert!(!store.check("bob", "correct"));
        // A truncated digest never matches.
        assert!(!store.check("carol", "correct"));
    }

    #[test]
    fn test_plain_password_length_mismatch() {
        let (_dir, store) =
            store_with(r#"{"usuarios": [{"username": "alice", "password": "correct"}]}"#);
        assert!(!store.check("alice", "correc"));
        assert!(!store.check("alice", "correct!"));
    }

    #[test]
    fn test_missing_file_is_false() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonUserStore::new(dir.path().join("absent.json"));
        assert!(!store.check("alice", "correct"));
    }

    #[test]
    fn test_invalid_json_is_false() {
        let (_dir, store) = store_with("{not json");
        assert!(!store.check("alice", "correct"));
    }

    #[test]
    fn test_incomplete_entries_never_match() {
        let (_dir, store) = store_with(r#"{"usuarios": [{"password": ""}]}"#);
        assert!(!store.check("", ""));
    }
}
