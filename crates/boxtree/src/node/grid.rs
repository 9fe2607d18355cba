//! Grid boxes: interior boxes that partition their region among children.

use crate::extents::Extents;
use crate::node::{NodeRef, Statistics};

/// Contents of a grid box.
///
/// A grid holds no events of its own.  Its aggregate is the sum over its
/// children and is cached; any insertion below the grid marks the cache
/// stale.  `version` counts invalidations, so a reader that recomputed the
/// sum without holding the lock only stores it if nothing changed meanwhile.
#[derive(Debug)]
pub(crate) struct GridBox {
    pub(crate) children: Vec<NodeRef>,
    pub(crate) fan_out: usize,
    pub(crate) statistics: Statistics,
    pub(crate) stale: bool,
    pub(crate) version: u64,
}

impl GridBox {
    /// A grid over `children`, whose combined aggregate is `statistics`.
    pub(crate) fn new(children: Vec<NodeRef>, fan_out: usize, statistics: Statistics) -> Self {
        Self {
            children,
            fan_out,
            statistics,
            stale: false,
            version: 0,
        }
    }

    /// The child whose region holds `coordinates`.
    pub(crate) fn child_for(&self, extents: &Extents, coordinates: &[f64]) -> NodeRef {
        self.children[extents.child_index(coordinates, self.fan_out)]
    }

    pub(crate) fn invalidate(&mut self) {
        self.stale = true;
        self.version += 1;
    }

    /// Stores an aggregate computed at `version`, unless the grid has been
    /// invalidated since.
    pub(crate) fn cache(&mut self, statistics: Statistics, version: u64) {
        if self.version == version {
            self.statistics = statistics;
            self.stale = false;
        }
    }
}
