//! Handles for allocated byte ranges.

use std::sync::Arc;

use blobpark_core::Hash256;

use crate::allocator::AllocatorInner;

/// Location of bytes successfully written to the backing file.
///
/// Deliberately not `Clone`: exactly one owner may hand it back to
/// `DiskAllocator::discard`.
#[derive(Debug, PartialEq, Eq)]
pub struct DiskMetadata {
    offset: u64,
    size: u64,
    checksum: Hash256,
}

impl DiskMetadata {
    pub(crate) fn new(offset: u64, size: u64, checksum: Hash256) -> Self {
        Self {
            offset,
            size,
            checksum,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn checksum(&self) -> Hash256 {
        self.checksum
    }
}

/// Exclusive claim on a range that has not been written yet.
///
/// Consumed by `DiskAllocator::write`; dropped unwritten, the range goes back
/// to the free list.
pub struct ReservedChunk {
    inner: Arc<AllocatorInner>,
    range: Option<(u64, u64)>,
}

impl ReservedChunk {
    pub(crate) fn new(inner: Arc<AllocatorInner>, offset: u64, size: u64) -> Self {
        Self {
            inner,
            range: Some((offset, size)),
        }
    }

    pub fn offset(&self) -> u64 {
        self.range.map_or(0, |(o, _)| o)
    }

    pub fn size(&self) -> u64 {
        self.range.map_or(0, |(_, s)| s)
    }

    /// Take the range without releasing it; the caller now owns it.
    pub(crate) fn into_range(mut self) -> (u64, u64) {
        self.range.take().unwrap_or_default()
    }
}

impl Drop for ReservedChunk {
    fn drop(&mut self) {
        if let Some((offset, size)) = self.range.take() {
            self.inner.release(offset, size);
        }
    }
}

impl std::fmt::Debug for ReservedChunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReservedChunk")
            .field("offset", &self.offset())
            .field("size", &self.size())
            .finish()
    }
}
