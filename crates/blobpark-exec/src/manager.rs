//! Registry of parkable blobs and the debounced parking sweep.
//!
//! Blobs are tracked by `Weak` reference in exactly one of two registries:
//! resident (bytes in memory, possibly also on disk) or on disk (bytes only on
//! disk). The registry lock is never held while calling into a blob.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, trace};

use blobpark_core::config::ParkingConfig;
use blobpark_core::BlobId;
use blobpark_io::DiskAllocator;

use crate::blob::{BlobImpl, Ineligible, ParkAttempt, ParkableBlob};
use crate::policy::{policy_from_config, ParkingPolicy};
use crate::stats::ParkingStats;
use crate::task::TaskRunners;

#[derive(Default)]
struct Registries {
    resident: HashMap<BlobId, Weak<BlobImpl>>,
    on_disk: HashMap<BlobId, Weak<BlobImpl>>,
    sweep_scheduled: bool,
}

#[derive(Default)]
struct Counters {
    parks: AtomicU64,
    unparks: AtomicU64,
    write_failures: AtomicU64,
    sweeps: AtomicU64,
}

struct ManagerInner {
    config: ParkingConfig,
    allocator: DiskAllocator,
    runners: TaskRunners,
    policy: Arc<dyn ParkingPolicy>,
    registries: Mutex<Registries>,
    next_id: AtomicU64,
    counters: Counters,
}

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepSummary {
    pub examined: usize,
    pub writes_scheduled: usize,
    pub discarded: usize,
    pub transient: usize,
    pub permanent: usize,
}

/// Shared handle; cheap to clone.
#[derive(Clone)]
pub struct ParkingManager {
    inner: Arc<ManagerInner>,
}

impl ParkingManager {
    /// Manager with the policy named by `config`.
    pub fn new(config: ParkingConfig, allocator: DiskAllocator, runners: TaskRunners) -> Self {
        let policy = policy_from_config(&config);
        Self::with_policy(config, allocator, runners, policy)
    }

    pub fn with_policy(
        config: ParkingConfig,
        allocator: DiskAllocator,
        runners: TaskRunners,
        policy: Arc<dyn ParkingPolicy>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                allocator,
                runners,
                policy,
                registries: Mutex::new(Registries::default()),
                next_id: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &ParkingConfig {
        &self.inner.config
    }

    pub fn allocator(&self) -> &DiskAllocator {
        &self.inner.allocator
    }

    pub fn runners(&self) -> &TaskRunners {
        &self.inner.runners
    }

    pub fn policy(&self) -> &dyn ParkingPolicy {
        &*self.inner.policy
    }

    pub fn create_blob(&self) -> ParkableBlob {
        ParkableBlob::new(self)
    }

    pub(crate) fn next_id(&self) -> BlobId {
        BlobId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn add(&self, blob: &Arc<BlobImpl>) {
        self.inner
            .registries
            .lock()
            .resident
            .insert(blob.id(), Arc::downgrade(blob));
        trace!(id = %blob.id(), "registered");
        self.schedule_sweep_if_needed();
    }

    /// Forget a blob. Unknown ids are ignored.
    pub(crate) fn remove(&self, id: BlobId) {
        let mut reg = self.inner.registries.lock();
        reg.resident.remove(&id);
        reg.on_disk.remove(&id);
    }

    pub(crate) fn on_parked(&self, id: BlobId) {
        let mut reg = self.inner.registries.lock();
        if let Some(weak) = reg.resident.remove(&id) {
            reg.on_disk.insert(id, weak);
            self.inner.counters.parks.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn on_unparked(&self, id: BlobId) {
        {
            let mut reg = self.inner.registries.lock();
            if let Some(weak) = reg.on_disk.remove(&id) {
                reg.resident.insert(id, weak);
            }
        }
        self.inner.counters.unparks.fetch_add(1, Ordering::Relaxed);
        self.schedule_sweep_if_needed();
    }

    pub(crate) fn record_write_failure(&self) {
        self.inner
            .counters
            .write_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Post a sweep after `sweep_interval` unless one is already pending or
    /// the allocator cannot write.
    pub fn schedule_sweep_if_needed(&self) {
        if !self.inner.allocator.may_write() {
            return;
        }
        {
            let mut reg = self.inner.registries.lock();
            if reg.sweep_scheduled {
                return;
            }
            reg.sweep_scheduled = true;
        }
        let manager = self.clone();
        self.inner.runners.owner.post_delayed(
            self.inner.config.sweep_interval(),
            Box::new(move || {
                manager.sweep();
            }),
        );
    }

    /// Run a sweep on the owner as soon as possible, e.g. under memory
    /// pressure. Does not disturb an already scheduled sweep.
    pub fn request_sweep_now(&self) {
        let manager = self.clone();
        self.inner.runners.owner.post(Box::new(move || {
            manager.sweep_resident();
        }));
    }

    /// Try to park every resident blob. Runs on the owner.
    pub fn sweep(&self) -> SweepSummary {
        self.inner.registries.lock().sweep_scheduled = false;
        self.sweep_resident()
    }

    fn sweep_resident(&self) -> SweepSummary {
        debug_assert!(self.inner.runners.owner.is_current());
        let mut summary = SweepSummary::default();
        if !self.inner.allocator.may_write() {
            debug!("disk writes disabled; sweep skipped");
            return summary;
        }

        let candidates: Vec<Weak<BlobImpl>> = self
            .inner
            .registries
            .lock()
            .resident
            .values()
            .cloned()
            .collect();
        self.inner.counters.sweeps.fetch_add(1, Ordering::Relaxed);

        for weak in candidates {
            let Some(blob) = weak.upgrade() else {
                continue;
            };
            summary.examined += 1;
            match blob.try_park() {
                ParkAttempt::WriteScheduled => summary.writes_scheduled += 1,
                ParkAttempt::Discarded => summary.discarded += 1,
                ParkAttempt::Skipped(reason) if reason.is_transient() => summary.transient += 1,
                ParkAttempt::Skipped(Ineligible::WritesDisabled) => {
                    summary.permanent += 1;
                    break;
                }
                ParkAttempt::Skipped(_) => summary.permanent += 1,
            }
        }

        debug!(
            examined = summary.examined,
            writes = summary.writes_scheduled,
            discarded = summary.discarded,
            transient = summary.transient,
            permanent = summary.permanent,
            "parking sweep"
        );
        if summary.transient > 0 {
            self.schedule_sweep_if_needed();
        }
        summary
    }

    pub fn statistics(&self) -> ParkingStats {
        let (resident, on_disk) = {
            let reg = self.inner.registries.lock();
            (
                reg.resident.values().cloned().collect::<Vec<_>>(),
                reg.on_disk.values().cloned().collect::<Vec<_>>(),
            )
        };
        let sum = |list: Vec<Weak<BlobImpl>>| -> (usize, u64) {
            list.iter()
                .filter_map(Weak::upgrade)
                .fold((0, 0), |(n, bytes), b| (n + 1, bytes + b.size() as u64))
        };
        let (resident_blobs, resident_bytes) = sum(resident);
        let (on_disk_blobs, on_disk_bytes) = sum(on_disk);
        let (disk_allocated_bytes, disk_peak_bytes) = self.inner.allocator.disk_footprint();
        let c = &self.inner.counters;
        ParkingStats {
            resident_blobs,
            resident_bytes,
            on_disk_blobs,
            on_disk_bytes,
            disk_allocated_bytes,
            disk_peak_bytes,
            disk_file_tail: self.inner.allocator.file_tail(),
            parks: c.parks.load(Ordering::Relaxed),
            unparks: c.unparks.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            sweeps: c.sweeps.load(Ordering::Relaxed),
            writes_enabled: self.inner.allocator.may_write(),
        }
    }

    pub fn resident_count(&self) -> usize {
        self.inner.registries.lock().resident.len()
    }

    pub fn on_disk_count(&self) -> usize {
        self.inner.registries.lock().on_disk.len()
    }

    pub fn is_tracked(&self, id: BlobId) -> bool {
        let reg = self.inner.registries.lock();
        reg.resident.contains_key(&id) || reg.on_disk.contains_key(&id)
    }

    pub fn is_registered_on_disk(&self, id: BlobId) -> bool {
        self.inner.registries.lock().on_disk.contains_key(&id)
    }

    pub fn sweep_scheduled(&self) -> bool {
        self.inner.registries.lock().sweep_scheduled
    }
}

impl std::fmt::Debug for ParkingManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reg = self.inner.registries.lock();
        f.debug_struct("ParkingManager")
            .field("resident", &reg.resident.len())
            .field("on_disk", &reg.on_disk.len())
            .field("sweep_scheduled", &reg.sweep_scheduled)
            .field("policy", &self.inner.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use blobpark_core::config::PolicyKind;
    use blobpark_io::MemoryBacking;

    use crate::testing::ManualRunner;

    fn manager_with(cfg: ParkingConfig) -> (Arc<ManualRunner>, ParkingManager) {
        let runner = ManualRunner::new();
        let allocator = DiskAllocator::from_config(&cfg);
        allocator
            .provide_file(Arc::new(MemoryBacking::new()))
            .unwrap();
        (runner.clone(), ParkingManager::new(cfg, allocator, runner.runners()))
    }

    fn cfg() -> ParkingConfig {
        ParkingConfig {
            min_parking_size: 10,
            min_block_size: 16,
            sweep_interval_ms: 100,
            ..ParkingConfig::default()
        }
    }

    #[test]
    fn sweep_is_debounced() {
        let (runner, manager) = manager_with(cfg());
        let a = manager.create_blob();
        let b = manager.create_blob();
        assert!(manager.sweep_scheduled());
        assert_eq!(runner.pending_delayed_tasks(), 1);
        a.append(&[0u8; 20]).unwrap();
        b.append(&[0u8; 20]).unwrap();
        a.freeze();
        b.freeze();
        assert_eq!(runner.pending_delayed_tasks(), 1);

        runner.advance(Duration::from_millis(100));
        assert_eq!(manager.on_disk_count(), 2);
        assert_eq!(manager.resident_count(), 0);
        assert!(!manager.sweep_scheduled());
    }

    #[test]
    fn transient_reasons_reschedule() {
        let (runner, manager) = manager_with(cfg());
        let blob = manager.create_blob();
        blob.append(&[1u8; 32]).unwrap();

        // Not frozen yet: transient, so another sweep is queued.
        runner.advance(Duration::from_millis(100));
        assert!(manager.sweep_scheduled());

        blob.freeze();
        runner.advance(Duration::from_millis(100));
        assert!(!blob.is_resident());
        assert!(manager.is_registered_on_disk(blob.id()));
        assert!(!manager.sweep_scheduled());
    }

    #[test]
    fn small_blob_leaves_registry_on_freeze() {
        let (runner, manager) = manager_with(cfg());
        let blob = manager.create_blob();
        blob.append(b"tiny").unwrap();
        assert!(manager.is_tracked(blob.id()));
        blob.freeze();
        assert!(!manager.is_tracked(blob.id()));

        runner.advance(Duration::from_millis(100));
        assert!(blob.is_resident());
        assert_eq!(blob.try_park(), ParkAttempt::Skipped(Ineligible::TooSmall));
    }

    #[test]
    fn delayed_policy_waits_before_parking() {
        let (runner, manager) = manager_with(ParkingConfig {
            policy: PolicyKind::Delayed,
            parking_delay_ms: 250,
            ..cfg()
        });
        let blob = manager.create_blob();
        blob.append(&[2u8; 64]).unwrap();
        blob.freeze();

        runner.advance(Duration::from_millis(100));
        assert!(blob.is_resident());
        runner.advance(Duration::from_millis(100));
        assert!(blob.is_resident());
        runner.advance(Duration::from_millis(100));
        assert!(!blob.is_resident());

        // Use resets the clock.
        blob.unpark().unwrap();
        runner.advance(Duration::from_millis(200));
        assert!(blob.is_resident());
        runner.advance(Duration::from_millis(100));
        assert!(!blob.is_resident());
    }

    #[test]
    fn request_sweep_now_runs_immediately() {
        let (runner, manager) = manager_with(cfg());
        let blob = manager.create_blob();
        blob.append(&[4u8; 40]).unwrap();
        blob.freeze();

        manager.request_sweep_now();
        runner.run_until_idle();
        assert!(!blob.is_resident());
        assert_eq!(runner.elapsed(), Duration::ZERO);
    }

    #[test]
    fn statistics_track_both_registries() {
        let (runner, manager) = manager_with(cfg());
        let parked = manager.create_blob();
        parked.append(&[1u8; 100]).unwrap();
        parked.freeze();
        let resident = manager.create_blob();
        resident.append(&[1u8; 30]).unwrap();

        manager.request_sweep_now();
        runner.run_until_idle();

        let stats = manager.statistics();
        assert_eq!(stats.resident_blobs, 1);
        assert_eq!(stats.resident_bytes, 30);
        assert_eq!(stats.on_disk_blobs, 1);
        assert_eq!(stats.on_disk_bytes, 100);
        assert_eq!(stats.disk_allocated_bytes, 100);
        assert_eq!(stats.parks, 1);
        assert!(stats.writes_enabled);
    }

    #[test]
    fn no_sweeps_without_backing_file() {
        let runner = ManualRunner::new();
        let cfg = cfg();
        let manager = ParkingManager::new(
            cfg.clone(),
            DiskAllocator::from_config(&cfg),
            runner.runners(),
        );
        let blob = manager.create_blob();
        blob.append(&[0u8; 50]).unwrap();
        blob.freeze();
        assert!(!manager.sweep_scheduled());
        assert_eq!(runner.pending_delayed_tasks(), 0);
        assert_eq!(
            blob.try_park(),
            ParkAttempt::Skipped(Ineligible::WritesDisabled)
        );
    }
}
