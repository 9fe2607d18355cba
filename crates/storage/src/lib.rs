//! Backing stores for the event box-tree.
//!
//! A backing store is an opaque, byte-addressable container.  The box-tree
//! only needs three things from it: read `len` bytes at an offset, append
//! bytes and learn where they landed, and rewrite a previously appended
//! region of the same size in place.  Appending is the preferred way to
//! persist a payload, because the size of a box's payload changes between
//! saves and an append never disturbs the last good copy.

use std::sync::Arc;

pub mod block;
pub mod error;
pub mod memory_impl;
pub mod metrics;
pub mod posixio_impl;


pub use block::{block_len, decode_block, decode_owned_block, encode_block, Magic};
pub use error::StorageError;
pub use memory_impl::MemoryStore;
pub use posixio_impl::FileStore;

/// Extension for container files created with a generated name.
pub const STORE_FILE_EXTENSION: &str = ".boxtree";

/// A byte-addressable persistent container.
pub trait BackingStore: Send + Sync {
    /// Reads `len` bytes starting at `offset`.  If successful, the result is
    /// exactly `len` bytes long; reading past the end is an error rather than
    /// a short result.
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError>;

    /// Appends `bytes` to the end of the store and returns the offset at which
    /// they were written.  The offset is only meaningful once this returns
    /// `Ok`.
    fn append(&self, bytes: &[u8]) -> Result<u64, StorageError>;

    /// Overwrites `bytes.len()` bytes at `offset`.  The whole range must lie
    /// within data previously appended.
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError>;

    /// Returns the current size of the store in bytes.
    fn size(&self) -> Result<u64, StorageError>;

    /// Makes previous writes durable.  A no-op for stores that are not
    /// persistent.
    fn sync(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

impl<S> BackingStore for Arc<S>
where
    S: BackingStore + ?Sized,
{
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        (**self).read(offset, len)
    }

    fn append(&self, bytes: &[u8]) -> Result<u64, StorageError> {
        (**self).append(bytes)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).write_at(offset, bytes)
    }

    fn size(&self) -> Result<u64, StorageError> {
        (**self).size()
    }

    fn sync(&self) -> Result<(), StorageError> {
        (**self).sync()
    }
}

impl<S> BackingStore for Box<S>
where
    S: BackingStore + ?Sized,
{
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        (**self).read(offset, len)
    }

    fn append(&self, bytes: &[u8]) -> Result<u64, StorageError> {
        (**self).append(bytes)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        (**self).write_at(offset, bytes)
    }

    fn size(&self) -> Result<u64, StorageError> {
        (**self).size()
    }

    fn sync(&self) -> Result<(), StorageError> {
        (**self).sync()
    }
}

/// A dynamically chosen store.
pub type Store = Arc<dyn BackingStore>;
