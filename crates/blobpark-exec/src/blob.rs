//! Parkable blobs.
//!
//! A blob is appended to, frozen once, and from then on its bytes may live in
//! memory, on disk, or briefly in both. All state sits behind one lock per
//! blob; the manager's lock is only ever taken while holding it, never the
//! other way round.
//!
//! Parking writes through a snapshot on the blocking pool. The completion is
//! posted back to the owner and re-checks eligibility before dropping the
//! resident copy, so a reader that took a snapshot or pinned the blob in the
//! meantime keeps the memory copy alive (the disk copy is kept for reuse).

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};

use blobpark_core::BlobId;
use blobpark_io::DiskMetadata;
use blobpark_mem::{GrowableBuffer, Snapshot, SnapshotReader};

use crate::error::{Error, Result};
use crate::manager::ParkingManager;
use crate::policy::BlobUsage;

/// Why a blob was not parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ineligible {
    /// A write for this blob is already running.
    InFlight,
    NotFrozen,
    /// Below `min_parking_size`; never parked.
    TooSmall,
    Pinned,
    /// A snapshot handed out earlier is still alive.
    HasSnapshots,
    /// The policy wants the blob to stay resident for now.
    TooRecent,
    /// Nothing resident to drop.
    AlreadyOnDisk,
    /// The allocator has no room within its capacity.
    NoDiskSpace,
    /// No backing file, or a previous write failed.
    WritesDisabled,
}

impl Ineligible {
    /// Whether a later sweep may succeed without outside help.
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            Ineligible::InFlight
                | Ineligible::NotFrozen
                | Ineligible::Pinned
                | Ineligible::HasSnapshots
                | Ineligible::TooRecent
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkAttempt {
    /// A disk write was started; the resident copy goes when it completes.
    WriteScheduled,
    /// A disk copy already existed and the resident copy was dropped.
    Discarded,
    Skipped(Ineligible),
}

impl ParkAttempt {
    pub fn parked(self) -> bool {
        !matches!(self, ParkAttempt::Skipped(_))
    }
}

struct BlobState {
    buffer: Option<GrowableBuffer>,
    on_disk: Option<DiskMetadata>,
    size: usize,
    frozen: bool,
    pin_depth: usize,
    parking_in_flight: bool,
    usage: BlobUsage,
}

pub(crate) struct BlobImpl {
    id: BlobId,
    manager: ParkingManager,
    state: Mutex<BlobState>,
}

impl BlobImpl {
    fn new(id: BlobId, manager: ParkingManager) -> Self {
        let buffer = GrowableBuffer::with_min_block_size(manager.config().min_block_size);
        Self {
            id,
            manager,
            state: Mutex::new(BlobState {
                buffer: Some(buffer),
                on_disk: None,
                size: 0,
                frozen: false,
                pin_depth: 0,
                parking_in_flight: false,
                usage: BlobUsage::default(),
            }),
        }
    }

    pub(crate) fn id(&self) -> BlobId {
        self.id
    }

    pub(crate) fn size(&self) -> usize {
        self.state.lock().size
    }

    fn append(&self, data: &[u8], reserve: usize) -> Result<()> {
        let mut st = self.state.lock();
        if st.frozen {
            return Err(Error::Frozen(self.id));
        }
        let min_block = self.manager.config().min_block_size;
        st.buffer
            .get_or_insert_with(|| GrowableBuffer::with_min_block_size(min_block))
            .append(data, reserve);
        st.size += data.len();
        Ok(())
    }

    fn freeze(&self) {
        let now = self.manager.runners().owner.now();
        let mut st = self.state.lock();
        if st.frozen {
            return;
        }
        st.frozen = true;
        st.usage.frozen_at = Some(now);
        let size = st.size;
        drop(st);

        if size < self.manager.config().min_parking_size {
            debug!(id = %self.id, size, "frozen below parking threshold; untracked");
            self.manager.remove(self.id);
        } else {
            trace!(id = %self.id, size, "frozen");
            self.manager.schedule_sweep_if_needed();
        }
    }

    /// Structural checks plus the policy. `None` means parkable.
    fn ineligibility(&self, st: &BlobState) -> Option<Ineligible> {
        if !st.frozen {
            return Some(Ineligible::NotFrozen);
        }
        if st.size < self.manager.config().min_parking_size {
            return Some(Ineligible::TooSmall);
        }
        if st.pin_depth > 0 {
            return Some(Ineligible::Pinned);
        }
        let buffer = match st.buffer.as_ref() {
            Some(b) => b,
            None => return Some(Ineligible::AlreadyOnDisk),
        };
        if !buffer.has_no_outstanding_snapshots() {
            return Some(Ineligible::HasSnapshots);
        }
        let now = self.manager.runners().owner.now();
        if !self.manager.policy().is_parkable(&st.usage, now) {
            return Some(Ineligible::TooRecent);
        }
        None
    }

    pub(crate) fn try_park(self: &Arc<Self>) -> ParkAttempt {
        let mut st = self.state.lock();
        if st.parking_in_flight {
            return ParkAttempt::Skipped(Ineligible::InFlight);
        }
        if let Some(reason) = self.ineligibility(&st) {
            return ParkAttempt::Skipped(reason);
        }
        if st.on_disk.is_some() {
            self.discard_resident(&mut st);
            return ParkAttempt::Discarded;
        }

        let allocator = self.manager.allocator().clone();
        let chunk = match allocator.try_reserve(st.size) {
            Some(chunk) => chunk,
            None if allocator.may_write() => {
                return ParkAttempt::Skipped(Ineligible::NoDiskSpace)
            }
            None => return ParkAttempt::Skipped(Ineligible::WritesDisabled),
        };
        let snapshot = match st.buffer.as_mut() {
            Some(buffer) => buffer.make_snapshot(),
            None => return ParkAttempt::Skipped(Ineligible::AlreadyOnDisk),
        };
        st.parking_in_flight = true;
        drop(st);

        debug!(id = %self.id, offset = chunk.offset(), size = chunk.size(), "park write scheduled");
        let blob = Arc::clone(self);
        let owner = Arc::clone(&self.manager.runners().owner);
        self.manager.runners().workers.spawn_blocking(Box::new(move || {
            let metadata = allocator.write_segments(chunk, snapshot.segments());
            // The completion must not see this snapshot as a live reader.
            drop(snapshot);
            let completion = WriteCompletion {
                blob,
                metadata: Some(metadata),
            };
            owner.post(Box::new(move || completion.run()));
        }));
        ParkAttempt::WriteScheduled
    }

    /// The completion was dropped without running (the owner has stopped).
    /// Give the range back and leave the blob resident.
    fn abandon_write(&self, metadata: Option<DiskMetadata>) {
        let mut st = self.state.lock();
        st.parking_in_flight = false;
        match metadata {
            Some(metadata) => {
                self.manager.allocator().discard(metadata);
                debug!(id = %self.id, "park completion dropped; disk copy released");
            }
            None => self.manager.record_write_failure(),
        }
    }

    fn on_write_complete(&self, metadata: Option<DiskMetadata>) {
        let mut st = self.state.lock();
        st.parking_in_flight = false;
        let Some(metadata) = metadata else {
            self.manager.record_write_failure();
            debug!(id = %self.id, "park write failed; staying resident");
            return;
        };
        st.on_disk = Some(metadata);

        match self.ineligibility(&st) {
            None => self.discard_resident(&mut st),
            Some(reason) => {
                debug!(id = %self.id, ?reason, "written but kept resident");
                drop(st);
                self.manager.schedule_sweep_if_needed();
            }
        }
    }

    fn discard_resident(&self, st: &mut BlobState) {
        st.buffer = None;
        self.manager.on_parked(self.id);
        debug!(id = %self.id, size = st.size, "resident copy dropped");
    }

    /// Bring the bytes back into memory if needed. Always stamps last use.
    fn unpark_locked(&self, st: &mut BlobState) -> Result<()> {
        st.usage.last_used = Some(self.manager.runners().owner.now());
        if st.buffer.is_some() {
            return Ok(());
        }
        let metadata = st.on_disk.as_ref().ok_or(Error::Missing(self.id))?;
        let mut bytes = vec![0u8; metadata.size() as usize];
        self.manager
            .allocator()
            .read(metadata, &mut bytes)
            .map_err(|source| Error::Unpark {
                id: self.id,
                source,
            })?;
        st.buffer = Some(GrowableBuffer::from_bytes(
            Bytes::from(bytes),
            self.manager.config().min_block_size,
        ));
        self.manager.on_unparked(self.id);
        debug!(id = %self.id, size = st.size, "unparked");
        Ok(())
    }

    fn unpark(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.unpark_locked(&mut st)
    }

    fn pin(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.unpark_locked(&mut st)?;
        st.pin_depth += 1;
        Ok(())
    }

    fn unpin(&self) {
        let mut st = self.state.lock();
        debug_assert!(st.pin_depth > 0, "unbalanced unpin");
        st.pin_depth = st.pin_depth.saturating_sub(1);
    }

    fn data(&self) -> Result<Snapshot> {
        let mut st = self.state.lock();
        self.unpark_locked(&mut st)?;
        st.buffer
            .as_mut()
            .map(GrowableBuffer::make_snapshot)
            .ok_or(Error::Missing(self.id))
    }

    fn data_copy(&self) -> Result<Vec<u8>> {
        let mut st = self.state.lock();
        self.unpark_locked(&mut st)?;
        st.buffer
            .as_ref()
            .map(GrowableBuffer::copy_to_vec)
            .ok_or(Error::Missing(self.id))
    }
}

impl Drop for BlobImpl {
    fn drop(&mut self) {
        let st = self.state.get_mut();
        let teardown = Teardown {
            manager: self.manager.clone(),
            id: self.id,
            buffer: st.buffer.take(),
            metadata: st.on_disk.take(),
        };

        let owner = Arc::clone(&self.manager.runners().owner);
        if owner.is_current() {
            drop(teardown);
        } else {
            trace!(id = %self.id, "forwarding destruction to owner");
            owner.post(Box::new(move || drop(teardown)));
        }
    }
}

/// Result of a disk write on its way back to the owner. If the owner drops
/// it unrun, the write is abandoned instead of leaking its range.
struct WriteCompletion {
    blob: Arc<BlobImpl>,
    metadata: Option<Option<DiskMetadata>>,
}

impl WriteCompletion {
    fn run(mut self) {
        if let Some(metadata) = self.metadata.take() {
            self.blob.on_write_complete(metadata);
        }
    }
}

impl Drop for WriteCompletion {
    fn drop(&mut self) {
        if let Some(metadata) = self.metadata.take() {
            self.blob.abandon_write(metadata);
        }
    }
}

/// What is left of a destroyed blob. Released where it is dropped: on the
/// owner normally, or wherever an unrun owner task is dropped after shutdown.
struct Teardown {
    manager: ParkingManager,
    id: BlobId,
    buffer: Option<GrowableBuffer>,
    metadata: Option<DiskMetadata>,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.manager.remove(self.id);
        if let Some(metadata) = self.metadata.take() {
            self.manager.allocator().discard(metadata);
        }
        drop(self.buffer.take());
        trace!(id = %self.id, "destroyed");
    }
}

/// Client handle to a blob. Clones share the blob.
#[derive(Clone)]
pub struct ParkableBlob {
    inner: Arc<BlobImpl>,
}

impl ParkableBlob {
    /// Create an empty, unfrozen blob registered with `manager`.
    pub fn new(manager: &ParkingManager) -> Self {
        let inner = Arc::new(BlobImpl::new(manager.next_id(), manager.clone()));
        manager.add(&inner);
        Self { inner }
    }

    pub fn id(&self) -> BlobId {
        self.inner.id
    }

    /// Fails with `Error::Frozen` once the blob is frozen.
    pub fn append(&self, data: &[u8]) -> Result<()> {
        self.inner.append(data, 0)
    }

    /// Like `append`, but a new block, if one is needed, gets room for
    /// `reserve` more bytes. Useful when the final size is known up front.
    pub fn append_with_reserve(&self, data: &[u8], reserve: usize) -> Result<()> {
        self.inner.append(data, reserve)
    }

    /// Irrevocably stop accepting appends. Idempotent.
    pub fn freeze(&self) {
        self.inner.freeze()
    }

    /// Try to move the blob to disk. True if a write was started or the
    /// resident copy was dropped in favor of an existing disk copy.
    pub fn maybe_park(&self) -> bool {
        self.try_park().parked()
    }

    pub fn try_park(&self) -> ParkAttempt {
        self.inner.try_park()
    }

    /// Synchronously read the bytes back if they are only on disk.
    ///
    /// An error means the bytes cannot be recovered; the blob stays parked.
    pub fn unpark(&self) -> Result<()> {
        self.inner.unpark()
    }

    /// Keep the bytes resident until the guard drops.
    pub fn pin(&self) -> Result<PinGuard> {
        self.inner.pin()?;
        Ok(PinGuard {
            blob: Arc::clone(&self.inner),
        })
    }

    /// Zero-copy view of the bytes, unparking first. The blob cannot be
    /// parked while the snapshot (or a clone of it) is alive.
    pub fn data(&self) -> Result<Snapshot> {
        self.inner.data()
    }

    pub fn reader(&self) -> Result<SnapshotReader> {
        self.inner.data().map(SnapshotReader::new)
    }

    /// Contiguous copy of the bytes, unparking first.
    pub fn data_copy(&self) -> Result<Vec<u8>> {
        self.inner.data_copy()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.state.lock().frozen
    }

    /// True if a disk copy exists (the bytes may also be resident).
    pub fn is_on_disk(&self) -> bool {
        self.inner.state.lock().on_disk.is_some()
    }

    pub fn is_resident(&self) -> bool {
        self.inner.state.lock().buffer.is_some()
    }

    pub fn is_parking_in_flight(&self) -> bool {
        self.inner.state.lock().parking_in_flight
    }

    pub fn pin_depth(&self) -> usize {
        self.inner.state.lock().pin_depth
    }
}

impl std::fmt::Debug for ParkableBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.inner.state.lock();
        f.debug_struct("ParkableBlob")
            .field("id", &self.inner.id)
            .field("size", &st.size)
            .field("frozen", &st.frozen)
            .field("resident", &st.buffer.is_some())
            .field("on_disk", &st.on_disk.is_some())
            .field("pin_depth", &st.pin_depth)
            .finish()
    }
}

/// Holds a blob resident. Dropping it unpins.
pub struct PinGuard {
    blob: Arc<BlobImpl>,
}

impl PinGuard {
    pub fn data(&self) -> Result<Snapshot> {
        self.blob.data()
    }
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.blob.unpin();
    }
}

impl std::fmt::Debug for PinGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PinGuard").field("id", &self.blob.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use blobpark_core::config::ParkingConfig;
    use blobpark_io::{DiskAllocator, MemoryBacking};

    use crate::testing::ManualRunner;

    fn setup(cfg: ParkingConfig) -> (Arc<ManualRunner>, ParkingManager, Arc<MemoryBacking>) {
        let runner = ManualRunner::new();
        let allocator = DiskAllocator::from_config(&cfg);
        let backing = Arc::new(MemoryBacking::new());
        allocator.provide_file(backing.clone()).unwrap();
        let manager = ParkingManager::new(cfg, allocator, runner.runners());
        (runner, manager, backing)
    }

    fn small_cfg() -> ParkingConfig {
        ParkingConfig {
            min_parking_size: 16,
            min_block_size: 8,
            ..ParkingConfig::default()
        }
    }

    fn frozen_blob(manager: &ParkingManager, bytes: &[u8]) -> ParkableBlob {
        let blob = ParkableBlob::new(manager);
        blob.append(bytes).unwrap();
        blob.freeze();
        blob
    }

    #[test]
    fn append_after_freeze_is_rejected() {
        let (_runner, manager, _) = setup(small_cfg());
        let blob = ParkableBlob::new(&manager);
        blob.append(b"abc").unwrap();
        blob.append(b"def").unwrap();
        assert_eq!(blob.size(), 6);
        blob.freeze();
        assert!(matches!(blob.append(b"x"), Err(Error::Frozen(id)) if id == blob.id()));
        assert_eq!(blob.data_copy().unwrap(), b"abcdef");
    }

    #[test]
    fn reserve_hint_sizes_the_next_block() {
        let (_runner, manager, _) = setup(small_cfg());
        let hinted = ParkableBlob::new(&manager);
        hinted.append_with_reserve(&[1u8; 4], 92).unwrap();
        for _ in 0..23 {
            hinted.append(&[2u8; 4]).unwrap();
        }
        assert_eq!(hinted.size(), 96);
        assert_eq!(hinted.data().unwrap().segments().count(), 1);

        let plain = ParkableBlob::new(&manager);
        for _ in 0..24 {
            plain.append(&[2u8; 4]).unwrap();
        }
        assert_eq!(plain.data().unwrap().segments().count(), 12);

        hinted.freeze();
        assert!(matches!(
            hinted.append_with_reserve(b"x", 10),
            Err(Error::Frozen(_))
        ));
    }

    #[test]
    fn unfrozen_blob_is_not_parked() {
        let (_runner, manager, _) = setup(small_cfg());
        let blob = ParkableBlob::new(&manager);
        blob.append(&[1u8; 64]).unwrap();
        assert_eq!(
            blob.try_park(),
            ParkAttempt::Skipped(Ineligible::NotFrozen)
        );
    }

    #[test]
    fn park_then_unpark_restores_bytes() {
        let (runner, manager, backing) = setup(small_cfg());
        let payload: Vec<u8> = (0..100u8).collect();
        let blob = frozen_blob(&manager, &payload);

        assert_eq!(blob.try_park(), ParkAttempt::WriteScheduled);
        assert!(blob.is_parking_in_flight());
        assert!(blob.is_resident());
        runner.run_until_idle();

        assert!(!blob.is_parking_in_flight());
        assert!(blob.is_on_disk());
        assert!(!blob.is_resident());
        assert_eq!(backing.write_count(), 1);

        assert_eq!(blob.data_copy().unwrap(), payload);
        assert!(blob.is_resident());
        assert!(blob.is_on_disk());
    }

    #[test]
    fn pin_blocks_parking_until_guard_drops() {
        let (runner, manager, _) = setup(small_cfg());
        let blob = frozen_blob(&manager, &[7u8; 32]);

        let guard = blob.pin().unwrap();
        let nested = blob.pin().unwrap();
        assert_eq!(blob.pin_depth(), 2);
        assert_eq!(blob.try_park(), ParkAttempt::Skipped(Ineligible::Pinned));
        drop(nested);
        assert_eq!(guard.data().unwrap().len(), 32);
        drop(guard);
        assert_eq!(blob.pin_depth(), 0);

        assert!(blob.maybe_park());
        runner.run_until_idle();
        assert!(!blob.is_resident());
    }

    #[test]
    fn live_snapshot_blocks_parking() {
        let (_runner, manager, _) = setup(small_cfg());
        let blob = frozen_blob(&manager, &[1u8; 32]);
        let snapshot = blob.data().unwrap();
        assert_eq!(
            blob.try_park(),
            ParkAttempt::Skipped(Ineligible::HasSnapshots)
        );
        drop(snapshot);
        assert_eq!(blob.try_park(), ParkAttempt::WriteScheduled);
    }

    #[test]
    fn reader_streams_parked_bytes() {
        use std::io::Read;

        let (runner, manager, _) = setup(small_cfg());
        let payload: Vec<u8> = (0..200u8).collect();
        let blob = frozen_blob(&manager, &payload);
        blob.maybe_park();
        runner.run_until_idle();
        assert!(!blob.is_resident());

        let mut reader = blob.reader().unwrap();
        assert_eq!(reader.size(), payload.len());
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn corrupted_disk_copy_is_a_hard_error() {
        let (runner, manager, backing) = setup(small_cfg());
        let blob = frozen_blob(&manager, &[9u8; 40]);
        blob.maybe_park();
        runner.run_until_idle();

        backing.corrupt(3);
        let err = blob.unpark().unwrap_err();
        assert!(matches!(
            err,
            Error::Unpark {
                source: blobpark_io::Error::ChecksumMismatch { .. },
                ..
            }
        ));
        assert!(!blob.is_resident());
        assert!(blob.is_on_disk());
    }

    #[test]
    fn failed_write_keeps_blob_resident_and_disables_parking() {
        let (runner, manager, backing) = setup(small_cfg());
        backing.fail_writes(true);
        let blob = frozen_blob(&manager, &[5u8; 64]);

        assert_eq!(blob.try_park(), ParkAttempt::WriteScheduled);
        runner.run_until_idle();
        assert!(blob.is_resident());
        assert!(!blob.is_on_disk());
        assert!(!manager.allocator().may_write());
        assert_eq!(
            blob.try_park(),
            ParkAttempt::Skipped(Ineligible::WritesDisabled)
        );
        assert_eq!(manager.statistics().write_failures, 1);
        assert_eq!(blob.data_copy().unwrap(), vec![5u8; 64]);
    }

    #[test]
    fn dropping_parked_blob_frees_its_range() {
        let (runner, manager, _) = setup(small_cfg());
        let blob = frozen_blob(&manager, &[3u8; 48]);
        blob.maybe_park();
        runner.run_until_idle();
        assert_eq!(manager.allocator().allocated_bytes(), 48);

        drop(blob);
        assert_eq!(manager.allocator().allocated_bytes(), 0);
        assert_eq!(manager.allocator().free_chunks(), vec![(0, 48)]);
        manager.allocator().check_invariants().unwrap();
    }
}
