//! Content checksums for parked bytes.

use blake3::Hasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn to_hex(&self) -> String {
        // blake3 hex(32b) is 64 hex chars
        let mut s = String::with_capacity(64);
        for b in &self.0 {
            use std::fmt::Write as _;
            let _ = write!(&mut s, "{:02x}", b);
        }
        s
    }
}

impl std::fmt::Display for Hash256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

pub fn hash_bytes(bytes: &[u8]) -> Hash256 {
    hash_segments(std::iter::once(bytes))
}

/// Hash a sequence of segments as if they were one contiguous buffer.
pub fn hash_segments<'a, I>(segments: I) -> Hash256
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut h = Hasher::new();
    for seg in segments {
        h.update(seg);
    }
    Hash256(h.finalize().into())
}
