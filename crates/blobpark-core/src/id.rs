//! Strongly-typed identifiers.
//!
//! Downstream crates should *not* key registries by raw integers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one parkable blob, unique for the lifetime of its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd)]
#[serde(transparent)]
pub struct BlobId(u64);

impl BlobId {
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.0)
    }
}
