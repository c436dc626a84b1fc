#![forbid(unsafe_code)]
//! blobpark-exec: parkable blobs and the manager that moves them between
//! memory and disk.
//!
//! Every blob belongs to one owning sequence (`OwnerSequence`). Mutation,
//! completion handling and destruction run there; blocking disk writes run on
//! a `BlockingPool`. `ParkingService` wires both to tokio; `ManualRunner`
//! drives them by hand in tests.

pub mod blob;
pub mod error;
pub mod manager;
pub mod policy;
pub mod runtime;
pub mod stats;
pub mod task;
pub mod testing;

pub use blob::{Ineligible, ParkAttempt, ParkableBlob, PinGuard};
pub use error::{Error, Result};
pub use manager::{ParkingManager, SweepSummary};
pub use policy::{BlobUsage, DelayedPolicy, ImmediatePolicy, ParkingPolicy};
pub use runtime::{OwnerThread, ParkingService, TokioWorkers};
pub use stats::ParkingStats;
pub use task::{BlockingPool, OwnerSequence, Task, TaskRunners};
pub use testing::ManualRunner;
