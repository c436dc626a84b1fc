//! Positional I/O over the allocator's backing store.
//!
//! - `file`: `std::fs::File` (the production backing, opened by `open_temp_file`).
//! - `memory`: `MemoryBacking`, an in-memory store with fault injection.

mod file;
mod memory;

use std::fs::{self, File};
use std::io;
use std::path::Path;

pub use memory::MemoryBacking;

/// Random-access byte store. Calls never overlap on the same range: the
/// allocator hands each range to exactly one writer.
pub trait BackingFile: Send + Sync {
    /// Write all of `data` starting at `offset`, extending the store if needed.
    fn write_all_at(&self, offset: u64, data: &[u8]) -> io::Result<()>;

    /// Fill `buf` from `offset`. Short reads are errors.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// Open an anonymous read/write file that disappears with the process.
///
/// `dir` defaults to the OS temp directory and is created if missing.
pub fn open_temp_file(dir: Option<&Path>) -> io::Result<File> {
    match dir {
        Some(d) => {
            fs::create_dir_all(d)?;
            tempfile::tempfile_in(d)
        }
        None => tempfile::tempfile(),
    }
}
