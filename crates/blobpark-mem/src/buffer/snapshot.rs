//! Read-only views over a prefix of a `GrowableBuffer`.

use std::io;
use std::sync::Arc;

use bytes::Bytes;

use super::block::{Block, Head};

/// Immutable point-in-time view. Cloning is cheap and adds a holder.
#[derive(Clone)]
pub struct Snapshot {
    tail: Option<Arc<Block>>,
    head: Arc<Head>,
    len: usize,
}

impl Snapshot {
    pub(crate) fn new(head: Arc<Head>, tail: Option<Arc<Block>>, len: usize) -> Self {
        Self { tail, head, len }
    }

    /// Length captured when the snapshot was taken; never changes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Contiguous segments in order, ending exactly at `len()`.
    pub fn segments(&self) -> Segments<'_> {
        Segments::new(self.head.first(), self.tail.as_ref(), self.len)
    }

    pub fn copy_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for seg in self.segments() {
            out.extend_from_slice(seg);
        }
        out
    }

    pub fn reader(&self) -> SnapshotReader {
        SnapshotReader::new(self.clone())
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot").field("len", &self.len).finish()
    }
}

/// Iterator over the visible part of each link.
pub struct Segments<'a> {
    next: Option<&'a Block>,
    tail: Option<&'a Block>,
    remaining: usize,
}

impl<'a> Segments<'a> {
    pub(crate) fn new(
        first: Option<&'a Arc<Block>>,
        tail: Option<&'a Arc<Block>>,
        len: usize,
    ) -> Self {
        Self {
            next: first.map(|b| &**b),
            tail: tail.map(|b| &**b),
            remaining: len,
        }
    }
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let block = self.next?;
        let take = block.data.len().min(self.remaining);
        self.remaining -= take;
        // Links published after the capture are never visited.
        let at_tail = self.tail.map_or(false, |t| std::ptr::eq(t, block));
        self.next = if at_tail {
            None
        } else {
            block.next.get().map(|b| &**b)
        };
        Some(&block.data[..take])
    }
}

/// Cursor over a snapshot handing out zero-copy `Bytes` segments.
pub struct SnapshotReader {
    // Released before the snapshot so the head sees an unshared chain.
    cursor: Option<Arc<Block>>,
    snapshot: Snapshot,
    /// Byte position of `cursor`'s first byte.
    block_start: usize,
    position: usize,
}

impl SnapshotReader {
    pub fn new(snapshot: Snapshot) -> Self {
        let cursor = if snapshot.is_empty() {
            None
        } else {
            snapshot.head.first().cloned()
        };
        Self {
            snapshot,
            cursor,
            block_start: 0,
            position: 0,
        }
    }

    /// Total bytes readable through this reader.
    pub fn size(&self) -> usize {
        self.snapshot.len
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.snapshot.len - self.position
    }

    /// Next contiguous run of bytes, or `None` once the snapshot is exhausted.
    pub fn next_segment(&mut self) -> Option<Bytes> {
        let seg = self.peek_segment()?;
        self.position += seg.len();
        Some(seg)
    }

    /// The contiguous run starting at `position`, independent of the cursor.
    pub fn segment_at(&self, position: usize) -> Option<Bytes> {
        if position >= self.snapshot.len {
            return None;
        }
        let mut start = 0;
        let mut link = self.snapshot.head.first();
        while let Some(block) = link {
            let visible = self.visible_len(block, start);
            if position < start + visible {
                return Some(block.data.slice(position - start..visible));
            }
            start += block.data.len();
            link = block.next.get();
        }
        None
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
    }

    fn visible_len(&self, block: &Block, block_start: usize) -> usize {
        block.data.len().min(self.snapshot.len - block_start)
    }

    fn peek_segment(&mut self) -> Option<Bytes> {
        while let Some(block) = self.cursor.clone() {
            let visible = self.visible_len(&block, self.block_start);
            if self.position < self.block_start + visible {
                let offset = self.position - self.block_start;
                return Some(block.data.slice(offset..visible));
            }
            if self.block_start + visible >= self.snapshot.len {
                self.cursor = None;
                break;
            }
            self.block_start += block.data.len();
            self.cursor = block.next.get().cloned();
        }
        None
    }
}

impl io::Read for SnapshotReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let Some(seg) = self.peek_segment() else {
            return Ok(0);
        };
        let n = seg.len().min(buf.len());
        buf[..n].copy_from_slice(&seg[..n]);
        self.position += n;
        Ok(n)
    }
}
