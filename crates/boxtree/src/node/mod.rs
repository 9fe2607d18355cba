//! Boxes of the tree.
//!
//! Every box lives in the tree's arena as a [`Node`] and is addressed by a
//! [`NodeRef`].  A node's role is either a [`LeafBox`], which holds events,
//! or a [`GridBox`], which divides its region among `fan_out^N` children.
//! A leaf becomes a grid in place when it splits, so a `NodeRef` stays valid
//! for the lifetime of the tree.
//!
//! Each node has two locks.  `body` guards the role and is only ever held
//! for short, in-memory state changes.  `io` serializes the paging
//! transitions (load, save, evict) of the node against each other and is
//! held across the store I/O, so that a slow transfer never blocks readers
//! of the node's aggregate.  When both are needed, `io` is taken first.

use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use boxtree_storage::{
    block_len, decode_owned_block, encode_block, BackingStore, Magic, StorageError,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::event::{decode_events, encode_events, Event};
use crate::extents::Extents;
use crate::metrics::{BOX_LOADS, BOX_SAVES};

pub(crate) mod grid;
pub(crate) mod leaf;
pub mod saveable;

pub(crate) use grid::GridBox;
pub(crate) use leaf::LeafBox;
pub use saveable::{Eviction, PageState, Residency, Saveable, UNASSIGNED_OFFSET};

/// Magic number of blocks holding a leaf's events.
pub(crate) const EVENTS_MAGIC: Magic = *b"BXEV";

/// Handle to a node in the tree's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) usize);

impl NodeRef {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Aggregate signal and squared error over a set of events.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub signal: f64,
    pub error_squared: f64,
    pub events: u64,
}

impl Statistics {
    pub fn of<E: Event>(events: &[E]) -> Self {
        let mut statistics = Self::default();
        for event in events {
            statistics.accumulate(event);
        }
        statistics.events = events.len() as u64;
        statistics
    }

    /// Adds `event`'s signal and error.  The event count is maintained by the
    /// caller.
    pub(crate) fn accumulate<E: Event>(&mut self, event: &E) {
        self.signal += event.signal();
        self.error_squared += event.error_squared();
    }

    /// Standard error of the summed signal.
    pub fn error(&self) -> f64 {
        self.error_squared.sqrt()
    }
}

impl AddAssign for Statistics {
    fn add_assign(&mut self, rhs: Self) {
        self.signal += rhs.signal;
        self.error_squared += rhs.error_squared;
        self.events += rhs.events;
    }
}

impl Add for Statistics {
    type Output = Statistics;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl Sum for Statistics {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Statistics::default(), Add::add)
    }
}

#[derive(Debug)]
pub(crate) enum NodeBody<E> {
    Leaf(LeafBox<E>),
    Grid(GridBox),
}

/// What kind of box a node currently is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Leaf,
    Grid,
}

/// A snapshot of one node, for inspection.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeInfo {
    pub id: u64,
    pub depth: usize,
    pub extents: Extents,
    pub kind: NodeKind,
    pub event_count: u64,
    pub children: Vec<NodeRef>,

    /// Paging state, for leaves.
    pub page: Option<PageState>,
}

/// Outcome of writing a leaf's payload back to the store.
enum WriteBack {
    /// Nothing needed saving.
    Clean,
    /// The payload was saved and is now clean.
    Saved,
    /// A copy was saved, but the payload changed during the write.
    Superseded,
}

/// A box in the tree's arena.
#[derive(Debug)]
pub struct Node<E> {
    id: u64,
    depth: usize,
    extents: Extents,

    /// Number of operations currently using this node.  A busy node is never
    /// evicted.
    busy: AtomicUsize,

    io: Mutex<()>,
    body: Mutex<NodeBody<E>>,
}

impl<E: Event> Node<E> {
    pub(crate) fn new(id: u64, depth: usize, extents: Extents, body: NodeBody<E>) -> Self {
        Self {
            id,
            depth,
            extents,
            busy: AtomicUsize::new(0),
            io: Mutex::new(()),
            body: Mutex::new(body),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    pub(crate) fn body(&self) -> MutexGuard<'_, NodeBody<E>> {
        self.body.lock().unwrap()
    }

    pub(crate) fn mark_busy(&self) {
        self.busy.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn clear_busy(&self) {
        self.busy.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire) > 0
    }

    pub fn info(&self) -> NodeInfo {
        let body = self.body();
        let (kind, event_count, children, page) = match &*body {
            NodeBody::Leaf(leaf) => (NodeKind::Leaf, leaf.event_count, Vec::new(), Some(leaf.page)),
            NodeBody::Grid(grid) => (
                NodeKind::Grid,
                grid.statistics.events,
                grid.children.clone(),
                None,
            ),
        };
        NodeInfo {
            id: self.id,
            depth: self.depth,
            extents: self.extents.clone(),
            kind,
            event_count,
            children,
            page,
        }
    }

    fn read_payload(
        &self,
        store: &dyn BackingStore,
        offset: u64,
        count: u64,
    ) -> Result<Vec<E>, StorageError> {
        let dimensions = self.extents.dimensions();
        let len = block_len(count as usize * E::record_len(dimensions));
        let block = store.read(offset, len)?;
        let payload = decode_owned_block(EVENTS_MAGIC, self.id, &block)?;
        let events = decode_events::<E>(payload, dimensions)?;
        if events.len() as u64 != count {
            return Err(StorageError::Corrupt(format!(
                "box {} expected {count} events at offset {offset}, found {}",
                self.id,
                events.len()
            )));
        }
        Ok(events)
    }

    /// Saves a dirty payload.  The caller holds `io`.
    fn write_back(&self, store: &dyn BackingStore) -> Result<WriteBack, StorageError> {
        let (payload, generation, count, in_place) = {
            let mut body = self.body();
            let NodeBody::Leaf(leaf) = &mut *body else {
                return Ok(WriteBack::Clean);
            };
            if !leaf.page.loaded || !leaf.page.dirty {
                return Ok(WriteBack::Clean);
            }
            leaf.refresh();
            let count = leaf.events.len() as u64;
            let in_place = (leaf.page.ever_saved && leaf.page.file_event_count == count)
                .then_some(leaf.page.file_offset);
            (
                encode_events(&leaf.events, self.extents.dimensions()),
                leaf.generation,
                count,
                in_place,
            )
        };

        let block = encode_block(EVENTS_MAGIC, self.id, &payload);
        let offset = match in_place {
            Some(offset) => {
                store.write_at(offset, &block)?;
                offset
            }
            None => store.append(&block)?,
        };
        counter!(BOX_SAVES).increment(1);
        trace!("saved {count} events of box {} at offset {offset}", self.id);

        let mut body = self.body();
        match &mut *body {
            NodeBody::Leaf(leaf) => {
                let unchanged = leaf.generation == generation;
                leaf.page.commit_save(offset, count, unchanged);
                Ok(if unchanged {
                    WriteBack::Saved
                } else {
                    WriteBack::Superseded
                })
            }
            NodeBody::Grid(_) => Ok(WriteBack::Superseded),
        }
    }
}

impl<E: Event> Saveable for Node<E> {
    fn box_id(&self) -> u64 {
        self.id
    }

    fn page_state(&self) -> Option<PageState> {
        match &*self.body() {
            NodeBody::Leaf(leaf) => Some(leaf.page),
            NodeBody::Grid(_) => None,
        }
    }

    fn resident_size(&self) -> usize {
        match &*self.body() {
            NodeBody::Leaf(leaf) => leaf.resident_size(),
            NodeBody::Grid(_) => 0,
        }
    }

    fn load_from_store(&self, store: &dyn BackingStore) -> Result<(), StorageError> {
        let _io = self.io.lock().unwrap();
        let (offset, count) = match &*self.body() {
            NodeBody::Leaf(leaf) if !leaf.page.loaded => {
                (leaf.page.file_offset, leaf.page.file_event_count)
            }
            _ => return Ok(()),
        };

        let events = if offset == UNASSIGNED_OFFSET {
            if count != 0 {
                return Err(StorageError::Corrupt(format!(
                    "box {} has {count} events but no saved payload",
                    self.id
                )));
            }
            Vec::new()
        } else {
            self.read_payload(store, offset, count)?
        };

        if let NodeBody::Leaf(leaf) = &mut *self.body() {
            leaf.install(events);
        }
        counter!(BOX_LOADS).increment(1);
        trace!("loaded {count} events of box {} from offset {offset}", self.id);
        Ok(())
    }

    fn save_to_store(&self, store: &dyn BackingStore) -> Result<(), StorageError> {
        let _io = self.io.lock().unwrap();
        self.write_back(store).map(|_| ())
    }

    fn evict(&self, store: &dyn BackingStore) -> Result<Eviction, StorageError> {
        let _io = self.io.lock().unwrap();
        if self.is_busy() {
            return Ok(Eviction::Busy);
        }
        let saved = match self.write_back(store)? {
            WriteBack::Clean => false,
            WriteBack::Saved => true,
            WriteBack::Superseded => return Ok(Eviction::Busy),
        };

        let mut body = self.body();
        match &mut *body {
            NodeBody::Leaf(leaf) if leaf.page.loaded => {
                if leaf.page.dirty || self.is_busy() {
                    Ok(Eviction::Busy)
                } else {
                    Ok(Eviction::Evicted {
                        freed: leaf.unload(),
                        saved,
                    })
                }
            }
            _ => Ok(Eviction::NotResident),
        }
    }
}
