//! Growable append-only buffer (writer side).
//!
//! Appends fill the current block until it is full, then allocate a new block
//! sized `max(remaining + reserve, min_block_size)`. Nothing is ever copied
//! when a snapshot is taken: the written part of the current block is published
//! into the shared chain and the snapshot records the length at that instant.

mod block;
mod snapshot;

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use block::{Block, Head};

pub use snapshot::{Segments, Snapshot, SnapshotReader};

/// Floor for new block allocations, so byte-at-a-time appends do not produce
/// a chain of tiny blocks.
pub const DEFAULT_MIN_BLOCK_SIZE: usize = 4096;

pub struct GrowableBuffer {
    // Declared before `head` so the tail link is released first on drop and
    // the head can unlink the chain iteratively.
    tail: Option<Arc<Block>>,
    head: Arc<Head>,
    /// Written but unpublished bytes of the current block; its spare capacity
    /// is the room left in that block.
    pending: BytesMut,
    len: usize,
    min_block_size: usize,
}

impl GrowableBuffer {
    pub fn new() -> Self {
        Self::with_min_block_size(DEFAULT_MIN_BLOCK_SIZE)
    }

    pub fn with_min_block_size(min_block_size: usize) -> Self {
        Self {
            tail: None,
            head: Arc::new(Head::new()),
            pending: BytesMut::new(),
            len: 0,
            min_block_size: min_block_size.max(1),
        }
    }

    /// Rebuild a buffer around bytes read back from disk, without copying.
    pub fn from_bytes(bytes: Bytes, min_block_size: usize) -> Self {
        let mut buf = Self::with_min_block_size(min_block_size);
        if !bytes.is_empty() {
            buf.len = bytes.len();
            buf.link(bytes);
        }
        buf
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `data`. When the current block fills up, the next block is sized
    /// for the rest of `data` plus `reserve` more bytes the caller expects.
    pub fn append(&mut self, mut data: &[u8], reserve: usize) {
        self.len += data.len();
        while !data.is_empty() {
            let room = self.pending.capacity() - self.pending.len();
            if room == 0 {
                self.publish();
                let size = data.len().saturating_add(reserve).max(self.min_block_size);
                self.pending = BytesMut::with_capacity(size);
                continue;
            }
            let n = room.min(data.len());
            self.pending.extend_from_slice(&data[..n]);
            data = &data[n..];
        }
    }

    /// O(1) point-in-time view over everything appended so far.
    pub fn make_snapshot(&mut self) -> Snapshot {
        self.publish();
        Snapshot::new(Arc::clone(&self.head), self.tail.clone(), self.len)
    }

    /// True when only the writer holds the chain, i.e. dropping this buffer
    /// actually frees its memory.
    pub fn has_no_outstanding_snapshots(&self) -> bool {
        Arc::strong_count(&self.head) == 1
    }

    /// Copy the full contents out, including unpublished bytes.
    pub fn copy_to_vec(&self) -> Vec<u8> {
        let published = self.len - self.pending.len();
        let mut out = Vec::with_capacity(self.len);
        for seg in Segments::new(self.head.first(), self.tail.as_ref(), published) {
            out.extend_from_slice(seg);
        }
        out.extend_from_slice(&self.pending);
        out
    }

    fn publish(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let written = self.pending.split().freeze();
        self.link(written);
    }

    fn link(&mut self, data: Bytes) {
        let block = Arc::new(Block::new(data));
        self.head.link_after(self.tail.as_ref(), Arc::clone(&block));
        self.tail = Some(block);
    }

    #[cfg(test)]
    fn published_links(&self) -> usize {
        Segments::new(self.head.first(), self.tail.as_ref(), self.len - self.pending.len()).count()
    }
}

impl Default for GrowableBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GrowableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableBuffer")
            .field("len", &self.len)
            .field("pending", &self.pending.len())
            .field("holders", &Arc::strong_count(&self.head))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_tracks_every_append() {
        let mut buf = GrowableBuffer::with_min_block_size(16);
        let mut expected = 0;
        for i in 0..50usize {
            let chunk = vec![i as u8; i % 7];
            buf.append(&chunk, 0);
            expected += chunk.len();
            assert_eq!(buf.len(), expected);
        }
        let copy = buf.copy_to_vec();
        assert_eq!(copy.len(), expected);
    }

    #[test]
    fn new_blocks_respect_floor_and_reserve() {
        let mut buf = GrowableBuffer::with_min_block_size(8);
        buf.append(b"abc", 0);
        // First block: max(3 + 0, 8) = 8 bytes, 5 left.
        assert_eq!(buf.pending.capacity(), 8);
        buf.append(b"defghij", 100);
        // 5 bytes fill the first block; the second is sized 2 + 100.
        assert_eq!(buf.pending.len(), 2);
        assert!(buf.pending.capacity() >= 102);
        assert_eq!(buf.published_links(), 1);
        assert_eq!(buf.copy_to_vec(), b"abcdefghij");
    }

    #[test]
    fn snapshot_counts_as_holder_until_dropped() {
        let mut buf = GrowableBuffer::new();
        buf.append(b"hello", 0);
        assert!(buf.has_no_outstanding_snapshots());
        let snap = buf.make_snapshot();
        let clone = snap.clone();
        assert!(!buf.has_no_outstanding_snapshots());
        drop(snap);
        assert!(!buf.has_no_outstanding_snapshots());
        drop(clone);
        assert!(buf.has_no_outstanding_snapshots());
    }

    #[test]
    fn snapshot_of_partially_filled_block_continues_in_same_block() {
        let mut buf = GrowableBuffer::with_min_block_size(64);
        buf.append(b"0123", 0);
        let snap = buf.make_snapshot();
        buf.append(b"4567", 0);
        // Writer keeps filling the same allocation after publishing.
        assert_eq!(buf.pending.len(), 4);
        assert_eq!(snap.copy_to_vec(), b"0123");
        assert_eq!(buf.copy_to_vec(), b"01234567");
    }

    #[test]
    fn from_bytes_is_one_link() {
        let buf = GrowableBuffer::from_bytes(Bytes::from_static(b"parked"), 16);
        assert_eq!(buf.len(), 6);
        assert_eq!(buf.published_links(), 1);
        assert_eq!(buf.copy_to_vec(), b"parked");
        let empty = GrowableBuffer::from_bytes(Bytes::new(), 16);
        assert!(empty.is_empty());
    }

    #[test]
    fn long_chain_drops_without_recursion() {
        let mut buf = GrowableBuffer::with_min_block_size(1);
        let snap_early = {
            buf.append(b"x", 0);
            buf.make_snapshot()
        };
        for _ in 0..200_000 {
            buf.append(b"y", 0);
        }
        let snap_late = buf.make_snapshot();
        assert_eq!(snap_late.len(), 200_001);
        drop(buf);
        drop(snap_late);
        assert_eq!(snap_early.copy_to_vec(), b"x");
    }

    #[test]
    fn reader_dropped_last_releases_long_chain_iteratively() {
        let mut buf = GrowableBuffer::with_min_block_size(1);
        // One-byte blocks, so one link per byte.
        for _ in 0..200_000 {
            buf.append(b"z", 0);
        }
        let mut reader = buf.make_snapshot().reader();
        drop(buf);
        // Park the cursor on a link in the middle of the chain.
        for _ in 0..1000 {
            assert_eq!(&reader.next_segment().unwrap()[..], b"z");
        }
        // A small stack fails fast if the release recurses.
        std::thread::Builder::new()
            .stack_size(2 * 1024 * 1024)
            .spawn(move || drop(reader))
            .unwrap()
            .join()
            .unwrap();
    }
}
