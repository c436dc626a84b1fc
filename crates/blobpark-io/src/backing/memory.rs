//! In-memory backing store for tests.
//!
//! Grows on write like a sparse file and can be told to fail reads or writes,
//! or to corrupt stored bytes, so disk failure paths can be exercised.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::BackingFile;

#[derive(Default)]
pub struct MemoryBacking {
    data: Mutex<Vec<u8>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
    reads: AtomicUsize,
}

impl MemoryBacking {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every following read fail with an I/O error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Flip every bit of the byte at `offset`, if it exists.
    pub fn corrupt(&self, offset: u64) {
        let mut data = self.data.lock();
        if let Some(b) = data.get_mut(offset as usize) {
            *b = !*b;
        }
    }

    /// Number of successful `write_all_at` calls.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BackingFile for MemoryBacking {
    fn write_all_at(&self, offset: u64, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected write failure"));
        }
        let start = offset as usize;
        let end = start + bytes.len();
        let mut data = self.data.lock();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "injected read failure"));
        }
        let start = offset as usize;
        let end = start + buf.len();
        let data = self.data.lock();
        if end > data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("range {start}..{end} exceeds size {}", data.len()),
            ));
        }
        buf.copy_from_slice(&data[start..end]);
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sparse_write_then_read() {
        let store = MemoryBacking::new();
        store.write_all_at(4, b"abcd").unwrap();
        assert_eq!(store.len(), 8);
        let mut out = [0xffu8; 8];
        store.read_exact_at(0, &mut out).unwrap();
        assert_eq!(&out, b"\0\0\0\0abcd");
        assert_eq!(store.write_count(), 1);
    }

    #[test]
    fn injected_failures() {
        let store = MemoryBacking::new();
        store.fail_writes(true);
        assert!(store.write_all_at(0, b"x").is_err());
        assert_eq!(store.write_count(), 0);
        store.fail_writes(false);
        store.write_all_at(0, b"x").unwrap();
        store.fail_reads(true);
        let mut out = [0u8; 1];
        assert!(store.read_exact_at(0, &mut out).is_err());
    }

    #[test]
    fn out_of_range_read_is_eof() {
        let store = MemoryBacking::new();
        let mut out = [0u8; 2];
        let err = store.read_exact_at(0, &mut out).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
