//! Chain links shared between the writer and its snapshots.
//!
//! A block allocation is filled by the writer in a private `BytesMut`. Written
//! bytes become visible to readers only when they are *published*: frozen into
//! an immutable `Bytes` window over the same allocation and linked at the end of
//! the chain. A block may therefore be published as several consecutive links
//! when snapshots are taken while it is still filling.

use std::sync::{Arc, OnceLock};

use bytes::Bytes;

pub(crate) struct Block {
    pub(crate) data: Bytes,
    /// Written once by the writer, when the following link is published.
    pub(crate) next: OnceLock<Arc<Block>>,
}

impl Block {
    pub(crate) fn new(data: Bytes) -> Self {
        Self {
            data,
            next: OnceLock::new(),
        }
    }
}

/// First link of the chain. Its `Arc` strong count is the number of holders:
/// the writer plus every live snapshot.
pub(crate) struct Head {
    first: OnceLock<Arc<Block>>,
}

impl Head {
    pub(crate) fn new() -> Self {
        Self {
            first: OnceLock::new(),
        }
    }

    pub(crate) fn first(&self) -> Option<&Arc<Block>> {
        self.first.get()
    }

    /// Link `block` after `tail` (or as the first link). Writer only.
    pub(crate) fn link_after(&self, tail: Option<&Arc<Block>>, block: Arc<Block>) {
        let slot = match tail {
            Some(t) => &t.next,
            None => &self.first,
        };
        if slot.set(block).is_err() {
            unreachable!("chain links are written once by the single writer");
        }
    }
}

impl Drop for Block {
    // Unlink iteratively; recursive Arc drops overflow the stack on long chains.
    // A link still shared elsewhere is left to its last holder, whose drop
    // continues the walk from there.
    fn drop(&mut self) {
        let mut next = self.next.take();
        while let Some(link) = next {
            match Arc::try_unwrap(link) {
                Ok(mut block) => next = block.next.take(),
                Err(_) => break,
            }
        }
    }
}
