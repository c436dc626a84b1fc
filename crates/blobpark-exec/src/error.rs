use thiserror::Error;

use blobpark_core::BlobId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} is frozen; appends are rejected")]
    Frozen(BlobId),

    #[error("unparking {id} failed: {source}")]
    Unpark {
        id: BlobId,
        #[source]
        source: blobpark_io::Error,
    },

    #[error("{0} has neither resident data nor a disk copy")]
    Missing(BlobId),

    #[error(transparent)]
    Disk(#[from] blobpark_io::Error),

    #[error(transparent)]
    Core(#[from] blobpark_core::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("runtime: {0}")]
    Runtime(String),
}

pub type Result<T> = std::result::Result<T, Error>;
