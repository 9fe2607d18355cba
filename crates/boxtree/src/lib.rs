//! An out-of-core, multi-dimensional event box-tree.
//!
//! Events (a signal, its squared error, and `N` coordinates) are inserted
//! into a [`BoxTree`] that adaptively subdivides its region of space: a leaf
//! box that holds too many events becomes a grid of `fan_out^N` equal
//! children.  Leaf payloads live in memory while they are in use and are
//! written back to a [`BackingStore`](boxtree_storage::BackingStore) and
//! released by the [`DiskBuffer`] when the resident total exceeds its
//! budget, so a tree can hold far more events than fit in memory.
//!
//! ```
//! use std::sync::Arc;
//! use boxtree::{BoxTree, BoxTreeConfig, Extents, LeanEvent};
//! use boxtree_storage::MemoryStore;
//!
//! let tree = BoxTree::new(
//!     BoxTreeConfig::default(),
//!     Extents::cube(2, 0.0, 1.0).unwrap(),
//!     Arc::new(MemoryStore::new()),
//! )
//! .unwrap();
//! tree.insert(LeanEvent::new(1.0, 1.0, &[0.25, 0.75])).unwrap();
//! assert_eq!(tree.statistics().events, 1);
//! ```

pub mod buffer;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod extents;
pub mod index;
pub mod memory;
pub mod metrics;
pub mod node;
pub mod tree;


pub use buffer::{CursorHandle, DiskBuffer, PageResolver, ReleaseReport, Unpin};
pub use config::{BoxTreeConfig, DiskBufferConfig};
pub use controller::{BoxController, SplitPolicy};
pub use error::{BoxTreeError, ConfigurationError, InsertError};
pub use event::{Coordinates, Event, ExtendedEvent, LeanEvent};
pub use extents::{Extents, Interval};
pub use memory::{FixedMemory, MemoryMonitor, MemoryProbe, MemorySnapshot, Releasable, SystemMemory};
pub use node::{
    Eviction, NodeInfo, NodeKind, NodeRef, PageState, Residency, Saveable, Statistics,
};
pub use tree::{BoxTree, FlushReport, LeafIter, LeafView, TreeShape};
