//! Content identity for stored images.
//!
//! Every blob is identified by the SHA-1 of its bytes, rendered as 40
//! lowercase hex characters. The same digest doubles as the blob's home
//! directory on disk and as the key looked up on the placement ring.

use crate::error::{Result, ShoalError};
use sha1::{Digest, Sha1};
use std::fmt;

/// Virtual points each node contributes to the placement ring.
pub const REPLICAS: usize = 16;

/// A 20-byte SHA-1 digest in its 40-char lowercase hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageHash {
    hex: String,
}

impl ImageHash {
    /// Hash a blob's contents.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(bytes);
        Self {
            hex: hex::encode(hasher.finalize()),
        }
    }

    /// Parse a hash from its hex form. Anything that is not exactly 40
    /// hex characters is rejected.
    pub fn from_hex(s: &str) -> Result<Self> {
        if s.len() != 40 {
            return Err(ShoalError::MalformedHash(format!(
                "expected 40 hex chars, got {}",
                s.len()
            )));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ShoalError::MalformedHash(
                "non-hex character in hash".to_string(),
            ));
        }
        Ok(Self {
            hex: s.to_ascii_lowercase(),
        })
    }

    pub fn as_hex(&self) -> &str {
        &self.hex
    }

    /// The blob's home directory relative to the store root: the hex
    /// split into 20 two-char segments (`ab/cd/ef/...`).
    pub fn as_path(&self) -> String {
        let parts: Vec<&str> = (0..self.hex.len())
            .step_by(2)
            .map(|i| &self.hex[i..i + 2])
            .collect();
        parts.join("/")
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// The virtual ring keys a node with the given uuid occupies:
/// `sha1(uuid || i)` for i in 0..REPLICAS.
pub fn ring_keys(uuid: &str) -> Vec<String> {
    (0..REPLICAS)
        .map(|i| {
            let mut hasher = Sha1::new();
            hasher.update(format!("{}{}", uuid, i).as_bytes());
            hex::encode(hasher.finalize())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn of_bytes_matches_known_sha1() {
        let hash = ImageHash::of_bytes(b"hello world");
        assert_eq!(hash.as_hex(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(hash.as_hex().len(), 40);
    }

    #[test]
    fn from_hex_accepts_and_normalizes() {
        let hash = ImageHash::from_hex("2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED").unwrap();
        assert_eq!(hash.as_hex(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn from_hex_rejects_bad_length() {
        assert!(matches!(
            ImageHash::from_hex("abc123"),
            Err(ShoalError::MalformedHash(_))
        ));
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        let s = "zz".repeat(20);
        assert!(matches!(
            ImageHash::from_hex(&s),
            Err(ShoalError::MalformedHash(_))
        ));
    }

    #[test]
    fn as_path_splits_into_pairs() {
        let hash = ImageHash::of_bytes(b"hello world");
        let path = hash.as_path();
        assert!(path.starts_with("2a/ae/6c/35/"));
        assert_eq!(path.split('/').count(), 20);
    }

    #[test]
    fn ring_keys_are_deterministic_and_distinct() {
        let a = ring_keys("node-a");
        let b = ring_keys("node-a");
        assert_eq!(a, b);
        assert_eq!(a.len(), REPLICAS);

        let mut deduped = a.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(deduped.len(), REPLICAS);

        assert_ne!(ring_keys("node-b"), a);
    }
}
