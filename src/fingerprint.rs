//! Deterministic identity digests.
//!
//! A fingerprint is the SHA-256 of the identity's UTF-8 bytes. It is the
//! primary key of the vector index and the file stem of the source artifact,
//! so a rebuild from artifacts reproduces exactly the same keys.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Length of a fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

/// Compute the fingerprint of an identity. Never fails; validating the
/// identity is the caller's job.
pub fn fingerprint(identity: &str) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(identity.as_bytes());
    Fingerprint(hasher.finalize().into())
}

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        to_hex(&self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != FINGERPRINT_LEN * 2 || !hex.is_ascii() {
            return None;
        }

        let mut bytes = [0u8; FINGERPRINT_LEN];
        for (idx, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[idx * 2..idx * 2 + 2], 16).ok()?;
        }
        Some(Self(bytes))
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> String {
        let mut hex = self.to_hex();
        hex.truncate(12);
        hex
    }
}

/// Lowercase hex encoding shared by the fingerprint and the cache key.
pub fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid fingerprint: {0:?}")]
pub struct ParseFingerprintError(String);

impl FromStr for Fingerprint {
    type Err = ParseFingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s).ok_or_else(|| ParseFingerprintError(s.to_string()))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_deterministic() {
        let a = fingerprint("https://github.com/rust-lang/rust");
        let b = fingerprint("https://github.com/rust-lang/rust");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_known_vector() {
        // sha256("") is a fixed, well-known digest
        assert_eq!(
            fingerprint("").to_hex(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_distinct_identities_differ() {
        assert_ne!(fingerprint("repoA"), fingerprint("repoB"));
        assert_ne!(fingerprint("repoA"), fingerprint("repoA "));
    }

    #[test]
    fn test_hex_round_trip_and_rejects_garbage() {
        let fp = fingerprint("repoA");
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(fp.to_string(), fp.to_hex());
        assert!(Fingerprint::from_hex("abc").is_none());
        assert!(Fingerprint::from_hex(&"zz".repeat(32)).is_none());
    }

    #[test]
    fn test_serde_as_hex_string() {
        let fp = fingerprint("repoA");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }
}
