//! Execution seams.
//!
//! Parking code never touches threads directly. It posts closures to the
//! blob's owning sequence and hands blocking I/O to a pool, so production can
//! run on tokio while tests step everything by hand.

use std::sync::Arc;
use std::time::{Duration, Instant};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A serial execution context. Tasks run one at a time in posting order.
pub trait OwnerSequence: Send + Sync {
    fn post(&self, task: Task);

    fn post_delayed(&self, delay: Duration, task: Task);

    /// True when called from a task running on this sequence.
    fn is_current(&self) -> bool;

    /// Clock used for policy decisions.
    fn now(&self) -> Instant;
}

/// Pool for work that may block on disk.
pub trait BlockingPool: Send + Sync {
    fn spawn_blocking(&self, task: Task);
}

#[derive(Clone)]
pub struct TaskRunners {
    pub owner: Arc<dyn OwnerSequence>,
    pub workers: Arc<dyn BlockingPool>,
}

impl std::fmt::Debug for TaskRunners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunners").finish_non_exhaustive()
    }
}
