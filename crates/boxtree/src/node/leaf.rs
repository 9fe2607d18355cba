//! Leaf boxes: the boxes that actually hold events.

use std::mem::size_of;

use crate::controller::BoxController;
use crate::error::InsertError;
use crate::event::Event;
use crate::extents::Extents;
use crate::node::saveable::PageState;
use crate::node::Statistics;

/// Contents of a leaf box.
///
/// `events` is the resident payload; while the leaf is unloaded it is empty
/// and `event_count` and `statistics` remember what the saved copy holds.
#[derive(Debug)]
pub(crate) struct LeafBox<E> {
    pub(crate) events: Vec<E>,
    pub(crate) event_count: u64,

    /// Aggregate over `events`.  Signal and error are only meaningful when
    /// `stale` is false; the event count is always exact.
    pub(crate) statistics: Statistics,
    pub(crate) stale: bool,

    pub(crate) page: PageState,

    /// Incremented on every change to the payload, so that a save performed
    /// without holding the node's lock can tell whether it saved the latest
    /// contents.
    pub(crate) generation: u64,
}

impl<E: Event> LeafBox<E> {
    /// An empty leaf.  It starts clean: there is nothing to save.
    pub(crate) fn new() -> Self {
        Self {
            events: Vec::new(),
            event_count: 0,
            statistics: Statistics::default(),
            stale: false,
            page: PageState::new(),
            generation: 0,
        }
    }

    /// A leaf holding `events`, which exist only in memory and so start
    /// dirty.
    pub(crate) fn with_events(events: Vec<E>) -> Self {
        let mut leaf = Self::new();
        if !events.is_empty() {
            leaf.statistics = Statistics::of(&events);
            leaf.event_count = events.len() as u64;
            leaf.events = events;
            leaf.page.dirty = true;
        }
        leaf.page.resident_bytes = leaf.resident_size();
        leaf
    }

    /// A leaf restored from a persisted index, whose payload is still in the
    /// store.
    pub(crate) fn restored(statistics: Statistics, page: PageState) -> Self {
        Self {
            events: Vec::new(),
            event_count: statistics.events,
            statistics,
            stale: false,
            page,
            generation: 0,
        }
    }

    /// Adds `event` to the payload, which must be loaded.  With `batched`,
    /// the aggregate is left stale for later recomputation instead of being
    /// updated.
    pub(crate) fn insert(
        &mut self,
        id: u64,
        extents: &Extents,
        event: E,
        batched: bool,
    ) -> Result<(), InsertError> {
        debug_assert!(self.page.loaded);
        if !extents.contains(event.coordinates()) {
            return Err(InsertError::OutOfBounds {
                box_id: id,
                coordinates: event.coordinates().to_vec(),
            });
        }
        if batched {
            self.stale = true;
        } else {
            self.statistics.accumulate(&event);
        }
        self.statistics.events += 1;
        self.event_count += 1;
        self.events.push(event);
        self.changed();
        Ok(())
    }

    fn changed(&mut self) {
        self.page.dirty = true;
        self.page.resident_bytes = self.resident_size();
        self.generation += 1;
    }

    /// Recomputes a stale aggregate.  Only possible while loaded; an
    /// unloaded leaf is never stale because eviction refreshes it first.
    pub(crate) fn refresh(&mut self) {
        if self.stale && self.page.loaded {
            self.statistics = Statistics::of(&self.events);
            self.stale = false;
        }
    }

    pub(crate) fn statistics(&mut self) -> Statistics {
        self.refresh();
        self.statistics
    }

    /// Whether this leaf holds too many events for the controller's policy
    /// and is still shallow enough to split.
    pub(crate) fn split_candidate(&self, controller: &BoxController, depth: usize) -> bool {
        controller.should_split(self.event_count) && !controller.max_depth_reached(depth)
    }

    /// Memory attributable to the resident payload.
    pub(crate) fn resident_size(&self) -> usize {
        if !self.page.loaded {
            return 0;
        }
        self.events.capacity() * size_of::<E>()
            + self.events.iter().map(Event::heap_bytes).sum::<usize>()
    }

    /// Installs a payload read from the store.  Does nothing if a payload is
    /// already resident.
    pub(crate) fn install(&mut self, events: Vec<E>) {
        if self.page.loaded {
            return;
        }
        debug_assert_eq!(events.len() as u64, self.event_count);
        self.events = events;
        self.page.loaded = true;
        self.page.dirty = false;
        self.page.resident_bytes = self.resident_size();
    }

    /// Drops the resident payload, returning the bytes freed.  The caller
    /// must have saved it first if it was dirty.
    pub(crate) fn unload(&mut self) -> usize {
        debug_assert!(!self.page.dirty);
        self.refresh();
        let freed = self.resident_size();
        self.events = Vec::new();
        self.page.loaded = false;
        self.page.resident_bytes = 0;
        freed
    }

    /// Consumes the leaf and distributes its events among `fan_out^N`
    /// children covering `extents`, in [`Extents::child_index`] order.  The
    /// payload must be loaded.
    pub(crate) fn split(self, extents: &Extents, fan_out: usize) -> Vec<(Extents, LeafBox<E>)> {
        debug_assert!(self.page.loaded);
        let regions = extents.partition(fan_out);
        let mut buckets: Vec<Vec<E>> = regions.iter().map(|_| Vec::new()).collect();
        for event in self.events {
            buckets[extents.child_index(event.coordinates(), fan_out)].push(event);
        }
        regions
            .into_iter()
            .zip(buckets)
            .map(|(region, events)| (region, LeafBox::with_events(events)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DiskBufferConfig;
    use crate::controller::SplitPolicy;
    use crate::event::LeanEvent;
    use crate::memory::{FixedMemory, MemoryMonitor};
    use crate::node::saveable::Residency;
    use boxtree_storage::MemoryStore;
    use std::sync::Arc;

    fn event(signal: f64, x: f64, y: f64) -> LeanEvent {
        LeanEvent::new(signal, signal * signal, &[x, y])
    }

    #[test]
    fn insert_marks_dirty_and_updates_aggregate() {
        let extents = Extents::cube(2, 0.0, 1.0).unwrap();
        let mut leaf = LeafBox::new();
        assert_eq!(leaf.page.residency(), Residency::Clean);

        leaf.insert(7, &extents, event(2.0, 0.5, 0.5), false).unwrap();
        assert_eq!(leaf.page.residency(), Residency::Dirty);
        assert_eq!(leaf.statistics().signal, 2.0);
        assert_eq!(leaf.statistics().error_squared, 4.0);
        assert_eq!(leaf.event_count, 1);
        assert!(leaf.page.resident_bytes > 0);
    }

    #[test]
    fn out_of_bounds_leaves_leaf_unchanged() {
        let extents = Extents::cube(2, 0.0, 1.0).unwrap();
        let mut leaf = LeafBox::new();
        let error = leaf
            .insert(3, &extents, event(1.0, 1.0, 0.5), false)
            .unwrap_err();
        assert_eq!(
            error,
            InsertError::OutOfBounds {
                box_id: 3,
                coordinates: vec![1.0, 0.5]
            }
        );
        assert_eq!(leaf.event_count, 0);
        assert_eq!(leaf.page.residency(), Residency::Clean);
    }

    #[test]
    fn batched_insert_recomputes_lazily() {
        let extents = Extents::cube(2, 0.0, 1.0).unwrap();
        let mut leaf = LeafBox::new();
        for i in 0..4 {
            leaf.insert(0, &extents, event(i as f64, 0.1, 0.1), true)
                .unwrap();
        }
        assert!(leaf.stale);
        assert_eq!(leaf.statistics().signal, 6.0);
        assert_eq!(leaf.statistics().events, 4);
        assert!(!leaf.stale);
    }

    #[test]
    fn split_partitions_every_event() {
        let extents = Extents::cube(2, 0.0, 2.0).unwrap();
        let mut leaf = LeafBox::new();
        for (x, y) in [(0.5, 0.5), (1.5, 0.5), (0.5, 1.5), (1.5, 1.5), (1.9, 1.9)] {
            leaf.insert(0, &extents, event(1.0, x, y), false).unwrap();
        }

        let children = leaf.split(&extents, 2);
        assert_eq!(children.len(), 4);
        let counts: Vec<u64> = children.iter().map(|(_, c)| c.event_count).collect();
        assert_eq!(counts, vec![1, 1, 1, 2]);
        for (region, child) in &children {
            assert!(child.events.iter().all(|e| region.contains(&e.coordinates)));
            assert_eq!(child.page.dirty, child.event_count > 0);
        }
    }

    #[test]
    fn split_candidate_respects_depth() {
        let controller = BoxController::new(
            2,
            SplitPolicy {
                split_threshold: 10,
                max_depth: 3,
                fan_out: 2,
            },
            DiskBufferConfig::default(),
            Arc::new(MemoryStore::new()),
            MemoryMonitor::with_probe(FixedMemory::new(0, 0)),
        )
        .unwrap();
        let mut leaf = LeafBox::<LeanEvent>::new();
        leaf.event_count = 11;
        assert!(leaf.split_candidate(&controller, 2));
        assert!(!leaf.split_candidate(&controller, 3));
        leaf.event_count = 10;
        assert!(!leaf.split_candidate(&controller, 0));
    }
}
