#![forbid(unsafe_code)]
//! blobpark-core: ids, configuration, errors, and checksums shared by the
//! buffer, allocator, and parking crates.
//!
//! No I/O and no threading lives here.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;

pub use config::{ParkingConfig, PolicyKind};
pub use error::{Error, Result};
pub use hash::Hash256;
pub use id::BlobId;
