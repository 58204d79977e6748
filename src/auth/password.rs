//! Credential Verification
//! Mission: Hash secrets one way and compare them without leaking where they differ

use anyhow::{Context, Result};
use bcrypt::{hash, verify};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::error;

/// A bcrypt hash of a user's password. The plaintext never lives here.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordHash(String);

impl PasswordHash {
    /// Hash `plain` with a fresh salt. Deliberately slow.
    pub fn set(plain: &str, cost: u32) -> Result<Self> {
        let hashed = hash(plain, cost).context("Failed to hash password")?;
        Ok(Self(hashed))
    }

    pub fn from_stored(stored: impl Into<String>) -> Self {
        Self(stored.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// Compare `plain` against this hash using bcrypt's own verification routine.
    pub fn matches(&self, plain: &str) -> bool {
        match verify(plain, &self.0) {
            Ok(valid) => valid,
            Err(e) => {
                error!(error = %e, "Stored password hash is unreadable");
                false
            }
        }
    }
}

impl std::fmt::Debug for PasswordHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordHash(<redacted>)")
    }
}

/// A plaintext secret received from a client. Redacted in `Debug`.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Equality of two secrets in time independent of where they first differ.
///
/// Both sides are reduced to SHA-256 digests so lengths never short-circuit the comparison.
pub fn constant_time_eq(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());

    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
