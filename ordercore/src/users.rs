//! User registration types and password digests.

use std::fmt::Write as _;

use nutype::nutype;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A user's first name.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct FirstName(String);

/// A user's last name.
#[nutype(
    sanitize(trim),
    validate(not_empty, len_char_max = 100),
    derive(
        Debug,
        Clone,
        PartialEq,
        Eq,
        Hash,
        AsRef,
        Deref,
        Display,
        Serialize,
        Deserialize
    )
)]
pub struct LastName(String);

/// Age in years. Only adults may register.
#[nutype(
    validate(greater_or_equal = 18, less_or_equal = 150),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Display,
        Into,
        Serialize,
        Deserialize
    )
)]
pub struct Age(i16);

/// A clear-text password as submitted at registration.
///
/// `Debug` is redacted so the value cannot end up in logs.
#[nutype(
    validate(len_char_min = 8, len_char_max = 128),
    derive(Clone, PartialEq, Eq, AsRef, Deserialize)
)]
pub struct Password(String);

impl std::fmt::Debug for Password {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Password(<redacted>)")
    }
}

/// Salted SHA-256 digest of a password, stored as `salt$hex`.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordDigest(String);

impl PasswordDigest {
    /// Digest `password` under a fresh random salt.
    pub fn compute(password: &Password) -> Self {
        Self::with_salt(&Uuid::new_v4().simple().to_string(), password.as_ref())
    }

    /// The `salt$hex` form written to storage.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn with_salt(salt: &str, password: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(password.as_bytes());
        let hash = hasher.finalize();

        let mut encoded = String::with_capacity(salt.len() + 1 + hash.len() * 2);
        encoded.push_str(salt);
        encoded.push('$');
        for byte in hash {
            let _ = write!(encoded, "{byte:02x}");
        }
        Self(encoded)
    }
}

impl std::fmt::Debug for PasswordDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordDigest(<redacted>)")
    }
}
