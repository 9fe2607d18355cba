//! [BackingStore] implementation using memory.
//!
//! This is useful for tests and for trees small enough that persistence
//! across sessions does not matter.

use metrics::counter;
use std::sync::RwLock;

use crate::metrics::{
    describe_store_metrics, READS_FAILED, READS_SUCCESS, TOTAL_BYTES_READ, TOTAL_BYTES_WRITTEN,
    WRITES_FAILED, WRITES_SUCCESS,
};
use crate::{BackingStore, StorageError};

/// A growable byte array standing in for a container file.
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: RwLock<Vec<u8>>,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        describe_store_metrics();
        Self::default()
    }

    /// Returns a copy of the store contents, for inspecting what was written.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }
}

impl BackingStore for MemoryStore {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        let data = self.data.read().unwrap();
        let size = data.len() as u64;
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= size => {
                counter!(TOTAL_BYTES_READ).increment(len as u64);
                counter!(READS_SUCCESS).increment(1);
                Ok(data[offset as usize..end as usize].to_vec())
            }
            _ => {
                counter!(READS_FAILED).increment(1);
                Err(StorageError::ShortRead { offset, len, size })
            }
        }
    }

    fn append(&self, bytes: &[u8]) -> Result<u64, StorageError> {
        let mut data = self.data.write().unwrap();
        let offset = data.len() as u64;
        data.extend_from_slice(bytes);
        counter!(TOTAL_BYTES_WRITTEN).increment(bytes.len() as u64);
        counter!(WRITES_SUCCESS).increment(1);
        Ok(offset)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().unwrap();
        let size = data.len() as u64;
        match offset.checked_add(bytes.len() as u64) {
            Some(end) if end <= size => {
                data[offset as usize..end as usize].copy_from_slice(bytes);
                counter!(TOTAL_BYTES_WRITTEN).increment(bytes.len() as u64);
                counter!(WRITES_SUCCESS).increment(1);
                Ok(())
            }
            _ => {
                counter!(WRITES_FAILED).increment(1);
                Err(StorageError::WriteOutOfRange {
                    offset,
                    len: bytes.len(),
                    size,
                })
            }
        }
    }

    fn size(&self) -> Result<u64, StorageError> {
        Ok(self.data.read().unwrap().len() as u64)
    }
}
