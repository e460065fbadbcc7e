use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::geometry::DIGEST_LEN;

/// Content digest naming a blob.
///
/// A `Digest` is the BLAKE3 merkle root of a blob's content. Identical
/// content always produces the same digest, so a digest is both a name and
/// an integrity check: lookup, deduplication, and read-time verification
/// all go through this value.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest([u8; DIGEST_LEN]);

impl Digest {
    /// Wrap a pre-computed 32-byte hash.
    pub const fn from_hash(hash: [u8; DIGEST_LEN]) -> Self {
        Self(hash)
    }

    /// The null digest (all zeros). Used for unallocated node slots.
    pub const fn null() -> Self {
        Self([0u8; DIGEST_LEN])
    }

    /// Returns `true` if this is the null digest.
    pub fn is_null(&self) -> bool {
        self.0 == [0u8; DIGEST_LEN]
    }

    /// The raw 32-byte hash.
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Hex-encoded string representation (the blob's external name).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex form (first 8 characters), for logging.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != DIGEST_LEN {
            return Err(TypeError::InvalidLength {
                expected: DIGEST_LEN,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short_hex())
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Digest> for [u8; DIGEST_LEN] {
    fn from(d: Digest) -> Self {
        d.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest_of(data: &[u8]) -> Digest {
        Digest::from_hash(*blake3::hash(data).as_bytes())
    }

    #[test]
    fn null_is_all_zeros() {
        let null = Digest::null();
        assert!(null.is_null());
        assert_eq!(null.as_bytes(), &[0u8; 32]);
    }

    #[test]
    fn nonzero_hash_is_not_null() {
        assert!(!digest_of(b"hello").is_null());
    }

    #[test]
    fn hex_roundtrip() {
        let d = digest_of(b"roundtrip");
        let parsed = Digest::from_hex(&d.to_hex()).unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn from_hex_rejects_bad_length() {
        let err = Digest::from_hex("abcd").unwrap_err();
        assert!(matches!(err, TypeError::InvalidLength { actual: 2, .. }));
    }

    #[test]
    fn from_hex_rejects_non_hex() {
        assert!(Digest::from_hex("zz").is_err());
    }

    #[test]
    fn display_is_full_hex() {
        let d = digest_of(b"display");
        let s = format!("{d}");
        assert_eq!(s.len(), 64);
        assert_eq!(s, d.to_hex());
    }

    #[test]
    fn short_hex_is_8_chars() {
        assert_eq!(digest_of(b"short").short_hex().len(), 8);
    }

    #[test]
    fn serde_roundtrip() {
        let d = digest_of(b"serde");
        let json = serde_json::to_string(&d).unwrap();
        let parsed: Digest = serde_json::from_str(&json).unwrap();
        assert_eq!(d, parsed);
    }
}
