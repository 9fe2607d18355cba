//! Write-back buffer for leaf payloads.
//!
//! The [`DiskBuffer`] tracks which leaves have their payload in memory, how
//! many bytes each one holds, and in what order they were last used.  When
//! the total grows past the configured ceiling it writes back and releases
//! the least recently used payloads until it fits again.
//!
//! The buffer only ever refers to nodes by [`NodeRef`]; the tree's arena
//! owns the nodes themselves.  Nodes that are in use are pinned and are
//! never chosen for eviction.
//!
//! The buffer's lock is never held while a node's lock is taken: eviction
//! picks a victim, releases the buffer lock, pages the victim out, and only
//! then retakes the buffer lock to record the result.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::{Arc, Mutex};

use boxtree_storage::{BackingStore, StorageError};
use metrics::{counter, gauge};
use tracing::{debug, warn};

use crate::config::DiskBufferConfig;
use crate::metrics::{BOX_EVICTIONS, BYTES_EVICTED, RESIDENT_BYTES};
use crate::node::{Eviction, NodeRef, Saveable};

/// A node's position in the buffer's recency order.  Handles compare in
/// order of use: a larger handle was used more recently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CursorHandle(u64);

/// Looks up the node behind a [`NodeRef`].
pub trait PageResolver {
    fn resolve(&self, node: NodeRef) -> Option<Arc<dyn Saveable>>;
}

/// What a release pass did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReleaseReport {
    /// Payloads dropped from memory.
    pub evicted: usize,

    /// Of those, payloads that had to be written back first.
    pub saved: usize,

    /// Bytes of resident payload released.
    pub bytes_released: usize,

    /// Candidates passed over because they were in use.
    pub skipped: usize,
}

impl std::ops::AddAssign for ReleaseReport {
    fn add_assign(&mut self, rhs: Self) {
        self.evicted += rhs.evicted;
        self.saved += rhs.saved;
        self.bytes_released += rhs.bytes_released;
        self.skipped += rhs.skipped;
    }
}

/// How a node's residency changed while it was pinned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unpin {
    /// No change worth recording.
    Unchanged,

    /// The node's payload is loaded and occupies this many bytes.
    Resident(usize),

    /// The node no longer has a pageable payload (for instance, it split
    /// into a grid).
    Released,
}

struct Entry {
    /// Resident bytes of the payload.
    bytes: usize,

    /// Serial number for LRU purposes.  Nodes with higher serial numbers
    /// have been used more recently.
    serial: u64,
}

struct BufferInner {
    /// Resident nodes.
    entries: HashMap<NodeRef, Entry>,

    /// Map from LRU serial number to node, for nodes that are not pinned.
    /// The element with the smallest serial number was least recently used.
    lru: BTreeMap<u64, NodeRef>,

    /// Number of outstanding pins per node.
    pins: HashMap<NodeRef, usize>,

    /// Serial number to use the next time we touch a node.
    next_serial: u64,

    /// Sum over `entries[*].bytes`.
    resident_bytes: usize,

    /// Bytes added since the last release check.
    accumulated_bytes: usize,
}

impl BufferInner {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            pins: HashMap::new(),
            next_serial: 0,
            resident_bytes: 0,
            accumulated_bytes: 0,
        }
    }

    #[allow(dead_code)]
    fn check_invariants(&self) {
        let mut bytes = 0;
        let mut unpinned = 0;
        for (node, entry) in self.entries.iter() {
            bytes += entry.bytes;
            if !self.is_pinned(*node) {
                unpinned += 1;
                assert_eq!(self.lru.get(&entry.serial), Some(node));
            }
        }
        assert_eq!(self.lru.len(), unpinned);
        assert_eq!(bytes, self.resident_bytes);
    }

    fn debug_check_invariants(&self) {
        #[cfg(debug_assertions)]
        self.check_invariants()
    }

    fn is_pinned(&self, node: NodeRef) -> bool {
        self.pins.contains_key(&node)
    }

    /// Moves `node` to the most recently used position.
    fn touch(&mut self, node: NodeRef) -> Option<CursorHandle> {
        let pinned = self.is_pinned(node);
        let entry = self.entries.get_mut(&node)?;
        self.lru.remove(&entry.serial);
        entry.serial = self.next_serial;
        self.next_serial += 1;
        if !pinned {
            self.lru.insert(entry.serial, node);
        }
        Some(CursorHandle(entry.serial))
    }

    fn upsert(&mut self, node: NodeRef, bytes: usize) -> CursorHandle {
        match self.entries.get_mut(&node) {
            Some(entry) => {
                self.resident_bytes = self.resident_bytes - entry.bytes + bytes;
                entry.bytes = bytes;
            }
            None => {
                self.entries.insert(
                    node,
                    Entry {
                        bytes,
                        serial: self.next_serial,
                    },
                );
                self.resident_bytes += bytes;
            }
        }
        // An entry always exists at this point.
        self.touch(node).unwrap_or(CursorHandle(self.next_serial))
    }

    fn remove(&mut self, node: NodeRef) -> Option<usize> {
        let entry = self.entries.remove(&node)?;
        self.lru.remove(&entry.serial);
        self.resident_bytes -= entry.bytes;
        Some(entry.bytes)
    }

    /// Removes `node` only if it has not been touched since it had LRU
    /// serial `serial`.  A node that was re-tracked in the meantime is
    /// resident again and must stay.
    fn remove_unchanged(&mut self, node: NodeRef, serial: u64) -> Option<usize> {
        match self.entries.get(&node) {
            Some(entry) if entry.serial == serial => self.remove(node),
            _ => None,
        }
    }

    fn pin(&mut self, node: NodeRef) {
        *self.pins.entry(node).or_insert(0) += 1;
        if let Some(entry) = self.entries.get(&node) {
            self.lru.remove(&entry.serial);
        }
    }

    fn unpin(&mut self, node: NodeRef) {
        match self.pins.get_mut(&node) {
            Some(count) if *count > 1 => *count -= 1,
            Some(_) => {
                self.pins.remove(&node);
                self.touch(node);
            }
            None => warn!("unpinning {node:?}, which is not pinned"),
        }
    }
}

/// Tracks resident leaf payloads and releases them under a byte budget.
pub struct DiskBuffer {
    config: DiskBufferConfig,
    inner: Mutex<BufferInner>,
}

impl Debug for DiskBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("DiskBuffer")
            .field("config", &self.config)
            .field("tracked", &inner.entries.len())
            .field("resident_bytes", &inner.resident_bytes)
            .finish()
    }
}

impl DiskBuffer {
    pub fn new(config: DiskBufferConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BufferInner::new()),
        }
    }

    pub fn config(&self) -> &DiskBufferConfig {
        &self.config
    }

    /// Starts tracking `node` as resident with `bytes` of payload, or updates
    /// its size if it is already tracked.  Either way the node becomes the
    /// most recently used.
    pub fn track(&self, node: NodeRef, bytes: usize) -> CursorHandle {
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.upsert(node, bytes);
        inner.debug_check_invariants();
        gauge!(RESIDENT_BYTES).set(inner.resident_bytes as f64);
        cursor
    }

    /// Marks `node` as most recently used.  Returns `None` if it is not
    /// tracked.
    pub fn touch(&self, node: NodeRef) -> Option<CursorHandle> {
        let mut inner = self.inner.lock().unwrap();
        let cursor = inner.touch(node);
        inner.debug_check_invariants();
        cursor
    }

    /// Returns `node`'s current position in the recency order.
    pub fn position(&self, node: NodeRef) -> Option<CursorHandle> {
        let inner = self.inner.lock().unwrap();
        inner
            .entries
            .get(&node)
            .map(|entry| CursorHandle(entry.serial))
    }

    /// Pins `node`, excluding it from eviction until a matching
    /// [`DiskBuffer::unpin`].  Pins nest.
    pub fn pin(&self, node: NodeRef) {
        let mut inner = self.inner.lock().unwrap();
        inner.pin(node);
        inner.debug_check_invariants();
    }

    /// Releases one pin on `node`, recording how its residency changed.  The
    /// node becomes most recently used.
    pub fn unpin(&self, node: NodeRef, change: Unpin) {
        let mut inner = self.inner.lock().unwrap();
        match change {
            Unpin::Unchanged => (),
            Unpin::Resident(bytes) => {
                inner.upsert(node, bytes);
            }
            Unpin::Released => {
                inner.remove(node);
            }
        }
        inner.unpin(node);
        inner.debug_check_invariants();
    }

    pub fn is_pinned(&self, node: NodeRef) -> bool {
        self.inner.lock().unwrap().is_pinned(node)
    }

    pub fn resident_bytes(&self) -> usize {
        self.inner.lock().unwrap().resident_bytes
    }

    pub fn tracked(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Tracked nodes, least recently used first.  Pinned nodes are not
    /// included.
    pub fn lru_order(&self) -> Vec<NodeRef> {
        self.inner.lock().unwrap().lru.values().copied().collect()
    }

    /// Writes back and releases least recently used payloads until at most
    /// `ceiling` bytes are resident, or until every unpinned payload has been
    /// tried once.
    ///
    /// A payload whose write-back fails stays resident and dirty, and the
    /// error is returned after the buffer's bookkeeping has been restored.
    pub fn release_if_over_budget(
        &self,
        resolver: &dyn PageResolver,
        store: &dyn BackingStore,
        ceiling: usize,
    ) -> Result<ReleaseReport, StorageError> {
        let mut report = ReleaseReport::default();
        let mut remaining = self.inner.lock().unwrap().lru.len();
        while remaining > 0 {
            remaining -= 1;

            // Pin the victim for the duration of the eviction, so that it
            // cannot be chosen twice.
            let (serial, node) = {
                let mut inner = self.inner.lock().unwrap();
                if inner.resident_bytes <= ceiling {
                    break;
                }
                let Some((serial, node)) = inner.lru.pop_first() else {
                    break;
                };
                *inner.pins.entry(node).or_insert(0) += 1;
                (serial, node)
            };

            let outcome = match resolver.resolve(node) {
                Some(saveable) => saveable.evict(store),
                None => Ok(Eviction::NotResident),
            };

            let mut inner = self.inner.lock().unwrap();
            match outcome {
                Ok(Eviction::Evicted { saved, .. }) => {
                    // Another thread may have reloaded the node and tracked
                    // it again after the eviction.
                    let bytes = inner.remove_unchanged(node, serial).unwrap_or(0);
                    report.evicted += 1;
                    report.saved += saved as usize;
                    report.bytes_released += bytes;
                    counter!(BOX_EVICTIONS).increment(1);
                    counter!(BYTES_EVICTED).increment(bytes as u64);
                }
                Ok(Eviction::NotResident) => {
                    inner.remove_unchanged(node, serial);
                }
                Ok(Eviction::Busy) => report.skipped += 1,
                Err(error) => {
                    inner.unpin(node);
                    inner.debug_check_invariants();
                    gauge!(RESIDENT_BYTES).set(inner.resident_bytes as f64);
                    warn!("failed to write back {node:?}: {error}");
                    return Err(error);
                }
            }
            inner.unpin(node);
            inner.debug_check_invariants();
        }

        let inner = self.inner.lock().unwrap();
        gauge!(RESIDENT_BYTES).set(inner.resident_bytes as f64);
        if inner.resident_bytes > ceiling {
            debug!(
                "{} bytes still resident after release pass, above ceiling of {ceiling}",
                inner.resident_bytes
            );
        }
        Ok(report)
    }

    /// Records `added_bytes` of new payload.  Once at least `threshold` bytes
    /// have accumulated since the last check, the resident ceiling is
    /// enforced and the report of that pass is returned; otherwise nothing
    /// happens and the result is `None`.
    pub fn release_accumulated(
        &self,
        resolver: &dyn PageResolver,
        store: &dyn BackingStore,
        added_bytes: usize,
        threshold: usize,
    ) -> Result<Option<ReleaseReport>, StorageError> {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.accumulated_bytes += added_bytes;
            if inner.accumulated_bytes < threshold {
                return Ok(None);
            }
            inner.accumulated_bytes = 0;
        }
        self.release_if_over_budget(resolver, store, self.config.max_resident_bytes)
            .map(Some)
    }
}
