//! Disk chunk allocator over one backing file.
//!
//! The free list maps offset -> size and is guarded by one lock together with
//! the logical file tail. Ranges are removed from the free list at reservation
//! time, before any I/O, so concurrent reservations never overlap. Reads and
//! writes run outside the lock.
//!
//! Placement: exact fit first, otherwise the largest free chunk strictly larger
//! than the request (split, remainder stays free), otherwise extend the tail.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use blobpark_core::config::ParkingConfig;
use blobpark_core::hash::hash_segments;
use blobpark_mem::FootprintTracker;

use crate::backing::BackingFile;
use crate::chunk::{DiskMetadata, ReservedChunk};
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct FreeList {
    free: BTreeMap<u64, u64>,
    tail: u64,
    allocated: u64,
}

impl FreeList {
    fn take(&mut self, size: u64, capacity: Option<u64>) -> Option<u64> {
        let exact = self
            .free
            .iter()
            .find(|&(_, &s)| s == size)
            .map(|(&o, _)| o);
        if let Some(offset) = exact {
            self.free.remove(&offset);
            self.allocated += size;
            trace!(offset, size, "reserved exact fit");
            return Some(offset);
        }

        // Worst fit: the largest oversized chunk, lowest offset on ties.
        let largest = self
            .free
            .iter()
            .filter(|&(_, &s)| s > size)
            .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(a.0)))
            .map(|(&o, &s)| (o, s));
        if let Some((offset, chunk)) = largest {
            self.free.remove(&offset);
            self.free.insert(offset + size, chunk - size);
            self.allocated += size;
            trace!(offset, size, remainder = chunk - size, "reserved split chunk");
            return Some(offset);
        }

        let end = self.tail.checked_add(size)?;
        if capacity.map_or(false, |cap| end > cap) {
            return None;
        }
        let offset = self.tail;
        self.tail = end;
        self.allocated += size;
        trace!(offset, size, "reserved at tail");
        Some(offset)
    }

    /// Free a range, merging once with each contiguous neighbour.
    fn release(&mut self, offset: u64, size: u64) {
        let mut start = offset;
        let mut len = size;
        if let Some((&left, &left_size)) = self.free.range(..offset).next_back() {
            if left + left_size == offset {
                self.free.remove(&left);
                start = left;
                len += left_size;
            }
        }
        if let Some(right_size) = self.free.remove(&(offset + size)) {
            len += right_size;
        }
        self.free.insert(start, len);
        self.allocated -= size;
    }

    fn check(&self) -> std::result::Result<(), String> {
        let free: u64 = self.free.values().sum();
        if free + self.allocated != self.tail {
            return Err(format!(
                "free {free} + allocated {} != tail {}",
                self.allocated, self.tail
            ));
        }
        let mut prev: Option<(u64, u64)> = None;
        for (&o, &s) in &self.free {
            if let Some((po, ps)) = prev {
                if po + ps >= o {
                    return Err(format!("free chunks {po}+{ps} and {o} touch or overlap"));
                }
            }
            prev = Some((o, s));
        }
        Ok(())
    }
}

pub(crate) struct AllocatorInner {
    state: Mutex<FreeList>,
    file: OnceLock<Arc<dyn BackingFile>>,
    may_write: AtomicBool,
    capacity: Option<u64>,
    verify_checksums: bool,
    footprint: FootprintTracker,
}

impl AllocatorInner {
    pub(crate) fn release(&self, offset: u64, size: u64) {
        self.state.lock().release(offset, size);
        self.footprint.sub(size);
    }
}

/// Shared handle to the process-wide chunk allocator. Cheap to clone.
#[derive(Clone)]
pub struct DiskAllocator {
    inner: Arc<AllocatorInner>,
}

impl DiskAllocator {
    /// An inert allocator; nothing can be reserved until `provide_file`.
    pub fn new(capacity: Option<u64>, verify_checksums: bool) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                state: Mutex::new(FreeList::default()),
                file: OnceLock::new(),
                may_write: AtomicBool::new(false),
                capacity,
                verify_checksums,
                footprint: FootprintTracker::new(),
            }),
        }
    }

    pub fn from_config(cfg: &ParkingConfig) -> Self {
        Self::new(cfg.max_disk_bytes, cfg.verify_checksums)
    }

    /// Hand over the backing file. Accepted once; enables writing.
    pub fn provide_file(&self, file: Arc<dyn BackingFile>) -> Result<()> {
        self.inner
            .file
            .set(file)
            .map_err(|_| Error::AlreadyProvided)?;
        self.inner.may_write.store(true, Ordering::Release);
        info!(capacity = ?self.inner.capacity, "disk allocator enabled");
        Ok(())
    }

    /// False until a file is provided, and forever after a failed write.
    pub fn may_write(&self) -> bool {
        self.inner.may_write.load(Ordering::Acquire)
    }

    /// Permanently stop handing out chunks.
    pub fn disable_writes(&self) {
        self.inner.may_write.store(false, Ordering::Release);
    }

    /// Claim `size` bytes, or `None` if writing is disabled or capacity is
    /// exhausted. Never an error.
    pub fn try_reserve(&self, size: usize) -> Option<ReservedChunk> {
        if size == 0 || !self.may_write() {
            return None;
        }
        let size = size as u64;
        let offset = self.inner.state.lock().take(size, self.inner.capacity);
        match offset {
            Some(offset) => {
                self.inner.footprint.add(size);
                Some(ReservedChunk::new(Arc::clone(&self.inner), offset, size))
            }
            None => {
                debug!(size, capacity = ?self.inner.capacity, "no room for chunk");
                None
            }
        }
    }

    /// Blocking write of `data` into `chunk`. `None` on failure, after which
    /// the allocator refuses all further writes.
    pub fn write(&self, chunk: ReservedChunk, data: &[u8]) -> Option<DiskMetadata> {
        self.write_segments(chunk, std::iter::once(data))
    }

    /// Like `write`, for data split across several buffers.
    pub fn write_segments<'a, I>(&self, chunk: ReservedChunk, segments: I) -> Option<DiskMetadata>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        if !self.may_write() {
            return None;
        }
        let file = self.inner.file.get()?;
        let segments: Vec<&[u8]> = segments.into_iter().collect();
        let total: u64 = segments.iter().map(|s| s.len() as u64).sum();
        if total != chunk.size() {
            warn!(
                expected = chunk.size(),
                actual = total,
                "write size does not match reservation"
            );
            return None;
        }

        let mut pos = chunk.offset();
        for seg in &segments {
            if let Err(e) = file.write_all_at(pos, seg) {
                warn!(error = %e, offset = chunk.offset(), size = chunk.size(), "disk write failed; disabling writes");
                self.disable_writes();
                return None;
            }
            pos += seg.len() as u64;
        }

        let checksum = hash_segments(segments.iter().copied());
        let (offset, size) = chunk.into_range();
        trace!(offset, size, "chunk written");
        Some(DiskMetadata::new(offset, size, checksum))
    }

    /// Blocking read of exactly `metadata.size()` bytes into `out`.
    ///
    /// An error here means the only copy of the bytes is unreachable.
    pub fn read(&self, metadata: &DiskMetadata, out: &mut [u8]) -> Result<()> {
        if out.len() as u64 != metadata.size() {
            return Err(Error::BufferSize {
                expected: metadata.size(),
                actual: out.len(),
            });
        }
        let file = self.inner.file.get().ok_or(Error::NoBackingFile)?;
        file.read_exact_at(metadata.offset(), out)
            .map_err(|source| Error::Read {
                offset: metadata.offset(),
                size: metadata.size(),
                source,
            })?;
        if self.inner.verify_checksums && hash_segments([&out[..]]) != metadata.checksum() {
            return Err(Error::ChecksumMismatch {
                offset: metadata.offset(),
                size: metadata.size(),
            });
        }
        Ok(())
    }

    /// Return a written range to the free list.
    pub fn discard(&self, metadata: DiskMetadata) {
        self.inner.release(metadata.offset(), metadata.size());
    }

    /// Logical end of the file: every byte below it is free or allocated.
    pub fn file_tail(&self) -> u64 {
        self.inner.state.lock().tail
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.inner.state.lock().allocated
    }

    /// Free chunks as `(offset, size)`, ordered by offset.
    pub fn free_chunks(&self) -> Vec<(u64, u64)> {
        self.inner
            .state
            .lock()
            .free
            .iter()
            .map(|(&o, &s)| (o, s))
            .collect()
    }

    /// Live allocated bytes and their high-water mark.
    pub fn disk_footprint(&self) -> (u64, u64) {
        (self.inner.footprint.current(), self.inner.footprint.peak())
    }

    /// Accounting and adjacency invariants of the free list.
    pub fn check_invariants(&self) -> blobpark_core::Result<()> {
        self.inner
            .state
            .lock()
            .check()
            .map_err(blobpark_core::Error::Invariant)
    }
}

impl std::fmt::Debug for DiskAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("DiskAllocator")
            .field("may_write", &self.may_write())
            .field("tail", &state.tail)
            .field("allocated", &state.allocated)
            .field("free_chunks", &state.free.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backing::MemoryBacking;

    fn allocator(capacity: Option<u64>) -> (DiskAllocator, Arc<MemoryBacking>) {
        let backing = Arc::new(MemoryBacking::new());
        let alloc = DiskAllocator::new(capacity, true);
        alloc.provide_file(backing.clone()).unwrap();
        (alloc, backing)
    }

    fn write_n(alloc: &DiskAllocator, size: usize) -> DiskMetadata {
        let chunk = alloc.try_reserve(size).expect("reserve");
        alloc.write(chunk, &vec![0xabu8; size]).expect("write")
    }

    #[test]
    fn inert_until_file_provided() {
        let alloc = DiskAllocator::new(None, true);
        assert!(!alloc.may_write());
        assert!(alloc.try_reserve(10).is_none());
        alloc.provide_file(Arc::new(MemoryBacking::new())).unwrap();
        assert!(alloc.may_write());
        let err = alloc
            .provide_file(Arc::new(MemoryBacking::new()))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyProvided));
    }

    #[test]
    fn sequential_discards_merge_left() {
        let (alloc, _) = allocator(None);
        let chunks: Vec<_> = (0..4).map(|_| write_n(&alloc, 100)).collect();
        let offsets: Vec<_> = chunks.iter().map(|m| m.offset()).collect();
        assert_eq!(offsets, vec![0, 100, 200, 300]);

        let mut expected_len = 0;
        for meta in chunks {
            alloc.discard(meta);
            expected_len += 100;
            assert_eq!(alloc.free_chunks(), vec![(0, expected_len)]);
            alloc.check_invariants().unwrap();
        }
        assert_eq!(alloc.free_chunks(), vec![(0, 400)]);
    }

    #[test]
    fn allocated_gap_blocks_merge() {
        let (alloc, _) = allocator(None);
        let mut chunks: Vec<Option<DiskMetadata>> =
            (0..4).map(|_| Some(write_n(&alloc, 100))).collect();
        for idx in [3, 2, 0] {
            alloc.discard(chunks[idx].take().unwrap());
            alloc.check_invariants().unwrap();
        }
        assert_eq!(alloc.free_chunks(), vec![(0, 100), (200, 200)]);
        assert_eq!(alloc.allocated_bytes(), 100);

        // Freeing the gap collapses everything into one chunk.
        alloc.discard(chunks[1].take().unwrap());
        assert_eq!(alloc.free_chunks(), vec![(0, 400)]);
    }

    #[test]
    fn exact_fit_then_worst_fit_split() {
        let (alloc, _) = allocator(None);
        let hole_small = write_n(&alloc, 1000); // [0, 1000)
        let _spacer_a = write_n(&alloc, 10); // [1000, 1010)
        let hole_large = write_n(&alloc, 1500); // [1010, 2510)
        let _spacer_b = write_n(&alloc, 10); // [2510, 2520)
        alloc.discard(hole_small);
        alloc.discard(hole_large);
        assert_eq!(alloc.free_chunks(), vec![(0, 1000), (1010, 1500)]);

        let exact = alloc.try_reserve(1000).unwrap();
        assert_eq!(exact.offset(), 0);
        assert_eq!(alloc.free_chunks(), vec![(1010, 1500)]);
        drop(exact);
        assert_eq!(alloc.free_chunks(), vec![(0, 1000), (1010, 1500)]);

        let split = alloc.try_reserve(999).unwrap();
        assert_eq!(split.offset(), 1010);
        assert_eq!(alloc.free_chunks(), vec![(0, 1000), (2009, 501)]);
        alloc.check_invariants().unwrap();
        assert_eq!(alloc.file_tail(), 2520);
    }

    #[test]
    fn dropped_reservation_returns_range() {
        let (alloc, backing) = allocator(None);
        let chunk = alloc.try_reserve(64).unwrap();
        assert_eq!(alloc.allocated_bytes(), 64);
        drop(chunk);
        assert_eq!(alloc.allocated_bytes(), 0);
        assert_eq!(alloc.free_chunks(), vec![(0, 64)]);
        assert_eq!(backing.write_count(), 0);
        assert_eq!(alloc.disk_footprint(), (0, 64));
    }

    #[test]
    fn write_read_roundtrip_across_segments() {
        let (alloc, _) = allocator(None);
        let chunk = alloc.try_reserve(11).unwrap();
        let meta = alloc
            .write_segments(chunk, [&b"hello"[..], &b" "[..], &b"world"[..]])
            .unwrap();
        let mut out = vec![0u8; 11];
        alloc.read(&meta, &mut out).unwrap();
        assert_eq!(out, b"hello world");

        let mut wrong = vec![0u8; 3];
        assert!(matches!(
            alloc.read(&meta, &mut wrong),
            Err(Error::BufferSize { .. })
        ));
    }

    #[test]
    fn failed_write_is_sticky_and_releases_range() {
        let (alloc, backing) = allocator(None);
        backing.fail_writes(true);
        let chunk = alloc.try_reserve(32).unwrap();
        assert!(alloc.write(chunk, &[1u8; 32]).is_none());
        assert!(!alloc.may_write());
        assert_eq!(alloc.allocated_bytes(), 0);
        alloc.check_invariants().unwrap();

        backing.fail_writes(false);
        assert!(alloc.try_reserve(32).is_none());
    }

    #[test]
    fn size_mismatch_keeps_writes_enabled() {
        let (alloc, _) = allocator(None);
        let chunk = alloc.try_reserve(8).unwrap();
        assert!(alloc.write(chunk, b"short").is_none());
        assert!(alloc.may_write());
        assert_eq!(alloc.allocated_bytes(), 0);
    }

    #[test]
    fn read_failures_are_errors() {
        let (alloc, backing) = allocator(None);
        let meta = write_n(&alloc, 16);
        let mut out = vec![0u8; 16];

        backing.corrupt(meta.offset() + 3);
        assert!(matches!(
            alloc.read(&meta, &mut out),
            Err(Error::ChecksumMismatch { .. })
        ));

        backing.fail_reads(true);
        let err = alloc.read(&meta, &mut out).unwrap_err();
        assert!(err.to_string().contains("injected read failure"));
    }

    #[test]
    fn capacity_limits_tail_growth_but_not_reuse() {
        let (alloc, _) = allocator(Some(250));
        let a = write_n(&alloc, 100);
        let _b = write_n(&alloc, 100);
        assert!(alloc.try_reserve(100).is_none());
        alloc.discard(a);
        let again = alloc.try_reserve(100).unwrap();
        assert_eq!(again.offset(), 0);
    }

    #[test]
    fn accounting_holds_over_mixed_operations() {
        let (alloc, _) = allocator(None);
        let mut live: Vec<DiskMetadata> = Vec::new();
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        for step in 0..500 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            if live.is_empty() || seed % 3 != 0 {
                let size = 1 + (seed % 300) as usize;
                live.push(write_n(&alloc, size));
            } else {
                let idx = (seed as usize / 3) % live.len();
                alloc.discard(live.swap_remove(idx));
            }
            alloc
                .check_invariants()
                .unwrap_or_else(|e| panic!("step {step}: {e}"));
        }
        let live_bytes: u64 = live.iter().map(|m| m.size()).sum();
        assert_eq!(alloc.allocated_bytes(), live_bytes);
        for meta in live {
            alloc.discard(meta);
        }
        assert_eq!(alloc.free_chunks(), vec![(0, alloc.file_tail())]);
    }
}
