//! Persisted layout of a tree.
//!
//! A container starts with a fixed-size header block at offset 0.  The header
//! points at the most recent index block, which describes every box of the
//! tree: its region, role, cached aggregate and, for leaves, where the saved
//! payload lives.  Leaf payloads and indexes are appended; only the header
//! is rewritten in place, after the index it points to is written, so a
//! reader always finds a complete index.
//!
//! The index itself is JSON, since it is small relative to the event
//! payloads and is read once per open.

use boxtree_storage::{
    block_len, decode_block, decode_owned_block, encode_block, BackingStore, Magic, StorageError,
};
use serde::{Deserialize, Serialize};

use crate::controller::SplitPolicy;
use crate::extents::Extents;
use crate::node::Statistics;

pub(crate) const HEADER_MAGIC: Magic = *b"BXHD";
pub(crate) const INDEX_MAGIC: Magic = *b"BXIX";

/// Version of the container layout.
pub const FORMAT_VERSION: u64 = 1;

const HEADER_PAYLOAD_LEN: usize = 32;

/// Size of the header block at the start of every container.
pub const HEADER_LEN: usize = block_len(HEADER_PAYLOAD_LEN);

const NO_INDEX: u64 = u64::MAX;

/// The fixed-size block at offset 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Header {
    pub(crate) dimensions: u64,

    /// Offset and length of the current index block.
    pub(crate) index: Option<(u64, u64)>,
}

impl Header {
    pub(crate) fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions as u64,
            index: None,
        }
    }

    fn encode(&self) -> Vec<u8> {
        let (offset, len) = self.index.unwrap_or((NO_INDEX, 0));
        let mut payload = Vec::with_capacity(HEADER_PAYLOAD_LEN);
        payload.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        payload.extend_from_slice(&self.dimensions.to_le_bytes());
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(&len.to_le_bytes());
        encode_block(HEADER_MAGIC, 0, &payload)
    }

    /// Writes the header of a new, empty container.
    pub(crate) fn initialize(&self, store: &dyn BackingStore) -> Result<(), StorageError> {
        let offset = store.append(&self.encode())?;
        if offset != 0 {
            return Err(StorageError::Corrupt(format!(
                "header landed at offset {offset} instead of the start of the store"
            )));
        }
        Ok(())
    }

    /// Replaces the header of an existing container.
    pub(crate) fn write(&self, store: &dyn BackingStore) -> Result<(), StorageError> {
        store.write_at(0, &self.encode())
    }

    pub(crate) fn read(store: &dyn BackingStore) -> Result<Self, StorageError> {
        let block = store.read(0, HEADER_LEN)?;
        let (_, payload) = decode_block(HEADER_MAGIC, &block)?;
        let field = |i: usize| {
            let mut buf = [0; 8];
            buf.copy_from_slice(&payload[i * 8..i * 8 + 8]);
            u64::from_le_bytes(buf)
        };
        let version = field(0);
        if version != FORMAT_VERSION {
            return Err(StorageError::Corrupt(format!(
                "unsupported container version {version} (expected {FORMAT_VERSION})"
            )));
        }
        let offset = field(2);
        Ok(Self {
            dimensions: field(1),
            index: (offset != NO_INDEX).then(|| (offset, field(3))),
        })
    }
}

/// Persisted role of one box.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum IndexedRole {
    Leaf {
        /// Offset of the saved payload, or `None` for a leaf that was never
        /// saved (which must be empty).
        file_offset: Option<u64>,
        file_event_count: u64,
    },
    Grid {
        fan_out: usize,
        /// Positions of the children in [`TreeIndex::nodes`].
        children: Vec<usize>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexedNode {
    pub(crate) id: u64,
    pub(crate) depth: usize,
    pub(crate) extents: Extents,
    pub(crate) statistics: Statistics,
    pub(crate) role: IndexedRole,
}

/// Everything needed to reopen a tree, apart from the payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub(crate) struct TreeIndex {
    pub(crate) event_kind: String,
    pub(crate) dimensions: usize,
    pub(crate) policy: SplitPolicy,
    pub(crate) next_id: u64,

    /// Every box, root first.
    pub(crate) nodes: Vec<IndexedNode>,
}

impl TreeIndex {
    /// Appends the index to `store` and returns its offset and length.
    pub(crate) fn append(&self, store: &dyn BackingStore) -> Result<(u64, u64), StorageError> {
        let json = serde_json::to_vec(self)
            .map_err(|e| StorageError::Corrupt(format!("cannot serialize tree index: {e}")))?;
        let block = encode_block(INDEX_MAGIC, 0, &json);
        let offset = store.append(&block)?;
        Ok((offset, block.len() as u64))
    }

    pub(crate) fn read(store: &dyn BackingStore, header: &Header) -> Result<Self, StorageError> {
        let Some((offset, len)) = header.index else {
            return Err(StorageError::Corrupt(
                "container has no index; it was never flushed".into(),
            ));
        };
        let block = store.read(offset, len as usize)?;
        let json = decode_owned_block(INDEX_MAGIC, 0, &block)?;
        let index: TreeIndex = serde_json::from_slice(json)
            .map_err(|e| StorageError::Corrupt(format!("cannot parse tree index: {e}")))?;
        index.validate(header)?;
        Ok(index)
    }

    fn validate(&self, header: &Header) -> Result<(), StorageError> {
        if self.dimensions as u64 != header.dimensions {
            return Err(StorageError::Corrupt(format!(
                "index has {} dimensions but header has {}",
                self.dimensions, header.dimensions
            )));
        }
        if self.nodes.is_empty() {
            return Err(StorageError::Corrupt("index has no root".into()));
        }
        for node in &self.nodes {
            if node.extents.dimensions() != self.dimensions {
                return Err(StorageError::Corrupt(format!(
                    "box {} has {} dimensions",
                    node.id,
                    node.extents.dimensions()
                )));
            }
            match &node.role {
                IndexedRole::Grid { children, .. } => {
                    if let Some(bad) = children.iter().find(|&&c| c == 0 || c >= self.nodes.len()) {
                        return Err(StorageError::Corrupt(format!(
                            "box {} refers to missing child {bad}",
                            node.id
                        )));
                    }
                }
                IndexedRole::Leaf {
                    file_offset: None,
                    file_event_count,
                } if *file_event_count != 0 || node.statistics.events != 0 => {
                    return Err(StorageError::Corrupt(format!(
                        "box {} has events but no saved payload",
                        node.id
                    )));
                }
                IndexedRole::Leaf {
                    file_event_count, ..
                } if *file_event_count != node.statistics.events => {
                    return Err(StorageError::Corrupt(format!(
                        "box {} saved {file_event_count} events but its aggregate counts {}",
                        node.id, node.statistics.events
                    )));
                }
                IndexedRole::Leaf { .. } => (),
            }
        }
        Ok(())
    }
}
