//! Content-addressed digests used for `sessionId`, `requestId`, and `poolId`.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use serde::{Deserialize, Serialize};

/// A 32-byte digest, hex-printable, used as an opaque content-addressed id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Digest32(pub [u8; 32]);

impl Digest32 {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl std::fmt::Debug for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Digest32({})", self.to_hex())
    }
}

impl std::fmt::Display for Digest32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Digest an arbitrary sequence of byte slices into one `Digest32`.
///
/// Each slice is length-prefixed (u32 LE) before hashing so that
/// `digest(["ab", "c"]) != digest(["a", "bc"])`.
pub fn digest_parts(parts: &[&[u8]]) -> Digest32 {
    let mut engine = sha256::HashEngine::default();
    for part in parts {
        engine.input(&(part.len() as u32).to_le_bytes());
        engine.input(part);
    }
    let hash = sha256::Hash::from_engine(engine);
    Digest32(hash.to_byte_array())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let d = digest_parts(&[b"hello", b"world"]);
        let s = d.to_hex();
        assert_eq!(Digest32::from_hex(&s).unwrap(), d);
    }

    #[test]
    fn length_prefixing_prevents_ambiguity() {
        let a = digest_parts(&[b"ab", b"c"]);
        let b = digest_parts(&[b"a", b"bc"]);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic() {
        let a = digest_parts(&[b"x", b"y", b"z"]);
        let b = digest_parts(&[b"x", b"y", b"z"]);
        assert_eq!(a, b);
    }
}
