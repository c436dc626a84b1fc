#![forbid(unsafe_code)]
//! blobpark: park large immutable blobs on disk under memory pressure.
//!
//! Umbrella crate over the workspace members. Most users only need
//! `ParkingService` and `ParkableBlob`.

pub use blobpark_core as core;
pub use blobpark_exec as exec;
pub use blobpark_io as io;
pub use blobpark_mem as mem;

pub use blobpark_core::{BlobId, ParkingConfig, PolicyKind};
pub use blobpark_exec::{ParkableBlob, ParkingManager, ParkingService, ParkingStats, PinGuard};

pub mod prelude {
    pub use blobpark_core::prelude::*;
    pub use blobpark_exec::{
        Error as ParkingError, ParkAttempt, ParkableBlob, ParkingManager, ParkingService,
    };
    pub use blobpark_mem::{Snapshot, SnapshotReader};
}
