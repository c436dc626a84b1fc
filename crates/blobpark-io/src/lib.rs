#![forbid(unsafe_code)]
//! blobpark-io: byte-range allocation inside one ephemeral backing file.
//!
//! - `backing`: the positional read/write trait, implemented for `std::fs::File`
//!   and for an in-memory `MemoryBacking` used by tests.
//! - `allocator`: free-list bookkeeping, reservation, write, read, and discard.
//!
//! Only `read` failures are reported as errors; every other disk problem
//! degrades to "stay in memory".

pub mod allocator;
pub mod backing;
pub mod chunk;
pub mod error;

pub use allocator::DiskAllocator;
pub use backing::{open_temp_file, BackingFile, MemoryBacking};
pub use chunk::{DiskMetadata, ReservedChunk};
pub use error::{Error, Result};
