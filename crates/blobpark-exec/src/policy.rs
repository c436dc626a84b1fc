//! When a frozen blob becomes worth parking.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use blobpark_core::config::{ParkingConfig, PolicyKind};

/// Timestamps a policy may look at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobUsage {
    pub frozen_at: Option<Instant>,
    pub last_used: Option<Instant>,
}

impl BlobUsage {
    /// The later of freezing and last use.
    pub fn last_activity(&self) -> Option<Instant> {
        match (self.frozen_at, self.last_used) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Only consulted for blobs that already pass the structural checks
/// (frozen, large enough, unpinned, no live snapshots).
pub trait ParkingPolicy: Send + Sync + fmt::Debug {
    fn is_parkable(&self, usage: &BlobUsage, now: Instant) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediatePolicy;

impl ParkingPolicy for ImmediatePolicy {
    fn is_parkable(&self, _usage: &BlobUsage, _now: Instant) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DelayedPolicy {
    delay: Duration,
}

impl DelayedPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl ParkingPolicy for DelayedPolicy {
    fn is_parkable(&self, usage: &BlobUsage, now: Instant) -> bool {
        match usage.last_activity() {
            Some(at) => now.saturating_duration_since(at) >= self.delay,
            None => false,
        }
    }
}

pub fn policy_from_config(cfg: &ParkingConfig) -> Arc<dyn ParkingPolicy> {
    match cfg.policy {
        PolicyKind::Immediate => Arc::new(ImmediatePolicy),
        PolicyKind::Delayed => Arc::new(DelayedPolicy::new(cfg.parking_delay())),
    }
}
