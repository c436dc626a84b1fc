#![forbid(unsafe_code)]
//! blobpark-mem: the growable append-only buffer a blob's bytes live in while
//! resident, its point-in-time snapshots, and byte footprint tracking.
//!
//! The writer side (`GrowableBuffer`) is single-owner; snapshots are `Send +
//! Sync` and may be read from any thread while the writer keeps appending.

pub mod buffer;
pub mod tracking;

pub use buffer::{GrowableBuffer, Segments, Snapshot, SnapshotReader, DEFAULT_MIN_BLOCK_SIZE};
pub use tracking::FootprintTracker;
