//! The pageable contract.
//!
//! A box whose payload can be moved between memory and the backing store
//! implements [`Saveable`].  The disk buffer drives every transition through
//! this trait, so it never needs to know what kind of box it is paging.
//!
//! A leaf's payload is always in exactly one of three states:
//!
//! * **Unloaded**: not in memory.  The store holds the only copy.
//! * **Clean**: in memory and identical to the last saved copy (or empty
//!   and never saved).  It can be dropped without writing anything.
//! * **Dirty**: in memory and changed since the last save.  It must be saved
//!   before it is dropped.
//!
//! A failed save or load leaves the state exactly as it was, so a dirty
//! payload is never lost to an I/O error.

use boxtree_storage::{BackingStore, StorageError};
use serde::{Deserialize, Serialize};

/// `file_offset` of a payload that has never been saved.
pub const UNASSIGNED_OFFSET: u64 = u64::MAX;

/// Where a payload lives and whether memory and store agree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageState {
    pub loaded: bool,
    pub dirty: bool,

    /// Whether any copy of the payload has ever been written.
    pub ever_saved: bool,

    /// Offset of the last saved copy, or [`UNASSIGNED_OFFSET`].
    pub file_offset: u64,

    /// Number of events in the last saved copy.
    pub file_event_count: u64,

    /// Bytes of memory the payload occupies while loaded.
    pub resident_bytes: usize,
}

impl PageState {
    /// A brand-new, empty, in-memory payload.
    pub fn new() -> Self {
        Self {
            loaded: true,
            dirty: false,
            ever_saved: false,
            file_offset: UNASSIGNED_OFFSET,
            file_event_count: 0,
            resident_bytes: 0,
        }
    }

    /// A payload known only by its saved copy.
    pub fn on_disk(file_offset: u64, file_event_count: u64) -> Self {
        Self {
            loaded: false,
            dirty: false,
            ever_saved: true,
            file_offset,
            file_event_count,
            resident_bytes: 0,
        }
    }

    pub fn residency(&self) -> Residency {
        match (self.loaded, self.dirty) {
            (false, _) => Residency::Unloaded,
            (true, false) => Residency::Clean,
            (true, true) => Residency::Dirty,
        }
    }

    /// Records a successful save of `event_count` events at `file_offset`.
    /// The payload only becomes clean if it did not change while the save
    /// was in flight.
    pub(crate) fn commit_save(&mut self, file_offset: u64, event_count: u64, unchanged: bool) {
        self.ever_saved = true;
        self.file_offset = file_offset;
        self.file_event_count = event_count;
        if unchanged {
            self.dirty = false;
        }
    }
}

impl Default for PageState {
    fn default() -> Self {
        Self::new()
    }
}

/// See the [module documentation](self).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Residency {
    Unloaded,
    Clean,
    Dirty,
}

/// Result of asking a box to release its payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Eviction {
    /// The payload was dropped, after being written back if `saved`.
    Evicted { freed: usize, saved: bool },

    /// The box is in use or changed while being written back; it stays
    /// resident.
    Busy,

    /// Nothing was resident.
    NotResident,
}

/// A box whose payload can be paged to and from a backing store.
pub trait Saveable: Send + Sync {
    /// The id the payload is stored under.
    fn box_id(&self) -> u64;

    fn page_state(&self) -> Option<PageState>;

    fn resident_size(&self) -> usize;

    /// Brings the payload into memory.  Does nothing if it is already
    /// loaded, so concurrent or repeated loads are harmless.
    fn load_from_store(&self, store: &dyn BackingStore) -> Result<(), StorageError>;

    /// Writes the payload to `store` if it is dirty.  On failure the payload
    /// stays dirty.
    fn save_to_store(&self, store: &dyn BackingStore) -> Result<(), StorageError>;

    /// Drops the payload from memory, saving it first if it is dirty.  A box
    /// that is currently in use is never evicted.
    fn evict(&self, store: &dyn BackingStore) -> Result<Eviction, StorageError>;

    fn is_loaded(&self) -> bool {
        self.page_state().is_some_and(|page| page.loaded)
    }

    fn is_dirty(&self) -> bool {
        self.page_state().is_some_and(|page| page.dirty)
    }

    fn was_saved(&self) -> bool {
        self.page_state().is_some_and(|page| page.ever_saved)
    }
}
