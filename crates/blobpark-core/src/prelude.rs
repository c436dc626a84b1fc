//! Convenient re-exports for downstream crates.

pub use crate::config::{ParkingConfig, PolicyKind};
pub use crate::error::{Error, Result};
pub use crate::hash::{hash_bytes, hash_segments, Hash256};
pub use crate::id::BlobId;
