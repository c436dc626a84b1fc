use std::io;

use thiserror::Error;

/// Result type local to blobpark-io.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backing file was already provided")]
    AlreadyProvided,

    #[error("no backing file has been provided")]
    NoBackingFile,

    #[error("read of {size} bytes at offset {offset} failed: {source}")]
    Read {
        offset: u64,
        size: u64,
        #[source]
        source: io::Error,
    },

    #[error("checksum mismatch for chunk at offset {offset} ({size} bytes)")]
    ChecksumMismatch { offset: u64, size: u64 },

    #[error("output buffer holds {actual} bytes, chunk holds {expected}")]
    BufferSize { expected: u64, actual: usize },
}
