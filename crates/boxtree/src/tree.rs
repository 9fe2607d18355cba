//! The box-tree.
//!
//! A [`BoxTree`] covers a fixed region of `N`-dimensional space.  It starts
//! as a single leaf; whenever a leaf holds more events than the split
//! threshold it becomes a grid of `fan_out^N` equal children, until the
//! maximum depth is reached.  Leaf payloads are paged to the backing store
//! by the [`DiskBuffer`](crate::DiskBuffer) when the resident total exceeds
//! its budget and paged back in when an operation needs them.
//!
//! Every operation takes `&self` and may be called from many threads at
//! once.  A thread that works on a leaf pins it first, so it is never
//! evicted underneath it.

use std::mem::size_of;
use std::sync::{Arc, MutexGuard, RwLock};
use std::thread;

use boxtree_storage::{StorageError, Store};
use metrics::counter;
use tracing::{debug, info};

use crate::buffer::{PageResolver, ReleaseReport, Unpin};
use crate::config::BoxTreeConfig;
use crate::controller::{BoxController, SplitPolicy};
use crate::error::{BoxTreeError, ConfigurationError, InsertError};
use crate::event::Event;
use crate::extents::Extents;
use crate::index::{Header, IndexedNode, IndexedRole, TreeIndex};
use crate::memory::{MemoryMonitor, Releasable};
use crate::metrics::{describe_tree_metrics, BOX_SPLITS, INDEX_WRITES};
use crate::node::{
    GridBox, LeafBox, Node, NodeBody, NodeInfo, NodeKind, NodeRef, PageState, Saveable,
    Statistics,
};

#[cfg(test)]
mod tests;

/// The root always occupies the first arena slot.
const ROOT: NodeRef = NodeRef(0);

/// A leaf's contents, as seen by a query.
#[derive(Clone, Debug, PartialEq)]
pub struct LeafView<E> {
    pub node: NodeRef,
    pub id: u64,
    pub depth: usize,
    pub extents: Extents,
    pub statistics: Statistics,
    pub events: Vec<E>,
}

/// Summary of a tree's structure.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TreeShape {
    pub grids: usize,
    pub leaves: usize,
    pub max_depth: usize,
    pub events: u64,
    pub loaded_leaves: usize,
    pub dirty_leaves: usize,
}

/// What [`BoxTree::flush`] wrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FlushReport {
    /// Leaf payloads written back.
    pub saved: usize,
    pub index_offset: u64,
    pub index_len: u64,
}

/// Leaves created by a split, and the number of splits performed.
#[derive(Default)]
struct SplitResult {
    splits: usize,
    leaves: Vec<NodeRef>,
}

enum Visit<E> {
    Leaf(LeafView<E>),
    Grid(Vec<NodeRef>),
}

/// Marks a node in use for as long as it lives.
///
/// While a guard exists the node is pinned in the disk buffer and its busy
/// count is raised, so neither the buffer nor a direct eviction will drop its
/// payload.  On drop, `change` tells the buffer what became of the payload.
struct BusyGuard<'a, E: Event> {
    tree: &'a BoxTree<E>,
    node_ref: NodeRef,
    node: Arc<Node<E>>,
    change: Unpin,
}

impl<'a, E: Event> BusyGuard<'a, E> {
    fn new(tree: &'a BoxTree<E>, node_ref: NodeRef) -> Self {
        tree.controller.buffer().pin(node_ref);
        let node = tree.node(node_ref);
        node.mark_busy();
        Self {
            tree,
            node_ref,
            node,
            change: Unpin::Unchanged,
        }
    }
}

impl<E: Event> Drop for BusyGuard<'_, E> {
    fn drop(&mut self) {
        self.node.clear_busy();
        self.tree
            .controller
            .buffer()
            .unpin(self.node_ref, self.change);
    }
}

fn residency<E: Event>(body: &NodeBody<E>) -> Unpin {
    match body {
        NodeBody::Leaf(leaf) if leaf.page.loaded => Unpin::Resident(leaf.page.resident_bytes),
        NodeBody::Leaf(_) => Unpin::Unchanged,
        NodeBody::Grid(_) => Unpin::Released,
    }
}

/// An out-of-core, multi-dimensional event tree.
pub struct BoxTree<E: Event> {
    config: BoxTreeConfig,
    extents: Extents,
    controller: Arc<BoxController>,
    arena: RwLock<Vec<Arc<Node<E>>>>,
}

impl<E: Event> std::fmt::Debug for BoxTree<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxTree")
            .field("extents", &self.extents)
            .field("controller", &self.controller)
            .field("nodes", &self.node_count())
            .finish()
    }
}

impl<E: Event> BoxTree<E> {
    /// Creates an empty tree over `extents`, persisting payloads to `store`,
    /// which must be empty.
    pub fn new(config: BoxTreeConfig, extents: Extents, store: Store) -> Result<Self, BoxTreeError> {
        Self::with_monitor(config, extents, store, MemoryMonitor::system())
    }

    /// Like [`BoxTree::new`], with a specific memory monitor.
    pub fn with_monitor(
        config: BoxTreeConfig,
        extents: Extents,
        store: Store,
        monitor: MemoryMonitor,
    ) -> Result<Self, BoxTreeError> {
        describe_tree_metrics();
        let dimensions = extents.dimensions();
        config.validate(dimensions)?;
        let size = store.size()?;
        if size != 0 {
            return Err(ConfigurationError::StoreNotEmpty(size).into());
        }
        Header::new(dimensions).initialize(&*store)?;

        let controller = Arc::new(BoxController::new(
            dimensions,
            config.split_policy(),
            config.buffer.clone(),
            store,
            monitor,
        )?);
        let root = Node::new(
            controller.allocate_id(),
            0,
            extents.clone(),
            NodeBody::Leaf(LeafBox::new()),
        );
        let tree = Self {
            config,
            extents,
            controller,
            arena: RwLock::new(vec![Arc::new(root)]),
        };
        tree.controller.buffer().track(ROOT, 0);
        info!("created {dimensions}-dimensional box tree over {}", tree.extents);
        Ok(tree)
    }

    /// Reopens a tree from a store written by [`BoxTree::flush`].  Every
    /// leaf starts unloaded; payloads are read on first use.
    ///
    /// The split policy is the one the tree was built with; the policy
    /// fields of `config` are ignored.
    pub fn open(config: BoxTreeConfig, store: Store) -> Result<Self, BoxTreeError> {
        Self::open_with_monitor(config, store, MemoryMonitor::system())
    }

    /// Like [`BoxTree::open`], with a specific memory monitor.
    pub fn open_with_monitor(
        config: BoxTreeConfig,
        store: Store,
        monitor: MemoryMonitor,
    ) -> Result<Self, BoxTreeError> {
        describe_tree_metrics();
        let header = Header::read(&*store)?;
        let index = TreeIndex::read(&*store, &header)?;
        if index.event_kind != E::KIND {
            return Err(ConfigurationError::EventKindMismatch {
                expected: E::KIND,
                found: index.event_kind,
            }
            .into());
        }

        let config = BoxTreeConfig {
            split_threshold: index.policy.split_threshold,
            max_depth: index.policy.max_depth,
            fan_out: index.policy.fan_out,
            ..config
        };
        config.validate(index.dimensions)?;

        let controller = Arc::new(BoxController::new(
            index.dimensions,
            index.policy,
            config.buffer.clone(),
            store,
            monitor,
        )?);
        controller.reserve_ids(index.next_id);
        let events = index.nodes[0].statistics.events;
        if events > 0 {
            controller.freeze();
        }

        let extents = index.nodes[0].extents.clone();
        let nodes: Vec<Arc<Node<E>>> = index
            .nodes
            .into_iter()
            .map(|node| {
                let body = match node.role {
                    IndexedRole::Leaf {
                        file_offset: Some(offset),
                        file_event_count,
                    } => NodeBody::Leaf(LeafBox::restored(
                        node.statistics,
                        PageState::on_disk(offset, file_event_count),
                    )),
                    IndexedRole::Leaf {
                        file_offset: None, ..
                    } => NodeBody::Leaf(LeafBox::new()),
                    IndexedRole::Grid { fan_out, children } => NodeBody::Grid(GridBox::new(
                        children.into_iter().map(NodeRef).collect(),
                        fan_out,
                        node.statistics,
                    )),
                };
                Arc::new(Node::new(node.id, node.depth, node.extents, body))
            })
            .collect();

        info!(
            "reopened box tree over {extents} with {} boxes and {events} events",
            nodes.len()
        );
        Ok(Self {
            config,
            extents,
            controller,
            arena: RwLock::new(nodes),
        })
    }

    pub fn config(&self) -> &BoxTreeConfig {
        &self.config
    }

    pub fn controller(&self) -> &BoxController {
        &self.controller
    }

    pub fn extents(&self) -> &Extents {
        &self.extents
    }

    pub fn dimensions(&self) -> usize {
        self.extents.dimensions()
    }

    pub fn root(&self) -> NodeRef {
        ROOT
    }

    pub fn split_policy(&self) -> SplitPolicy {
        self.controller.policy()
    }

    /// Changes the split policy.  Fails once any event has been inserted.
    pub fn configure(
        &self,
        split_threshold: usize,
        max_depth: usize,
        fan_out: usize,
    ) -> Result<(), ConfigurationError> {
        self.controller
            .configure(split_threshold, max_depth, fan_out)
    }

    fn node(&self, node_ref: NodeRef) -> Arc<Node<E>> {
        self.arena.read().unwrap()[node_ref.0].clone()
    }

    fn push_node(&self, node: Node<E>) -> NodeRef {
        let mut arena = self.arena.write().unwrap();
        arena.push(Arc::new(node));
        NodeRef(arena.len() - 1)
    }

    pub fn node_count(&self) -> usize {
        self.arena.read().unwrap().len()
    }

    pub fn node_info(&self, node_ref: NodeRef) -> Option<NodeInfo> {
        let node = self.arena.read().unwrap().get(node_ref.0).cloned();
        node.map(|node| node.info())
    }

    /// Locks `node` with its payload resident, loading it first if needed.
    /// The caller must hold a [`BusyGuard`] on it, so that the payload cannot
    /// be evicted again before the lock is taken.
    fn lock_loaded<'n>(
        &self,
        node: &'n Node<E>,
    ) -> Result<MutexGuard<'n, NodeBody<E>>, StorageError> {
        loop {
            let body = node.body();
            match &*body {
                NodeBody::Leaf(leaf) if !leaf.page.loaded => {
                    drop(body);
                    node.load_from_store(self.controller.store())?;
                }
                _ => return Ok(body),
            }
        }
    }

    fn check_coordinates(&self, coordinates: &[f64]) -> Result<(), InsertError> {
        if coordinates.len() != self.dimensions() {
            return Err(InsertError::DimensionMismatch {
                expected: self.dimensions(),
                found: coordinates.len(),
            });
        }
        if !self.extents.contains(coordinates) {
            return Err(InsertError::OutOfBounds {
                box_id: self.node(ROOT).id(),
                coordinates: coordinates.to_vec(),
            });
        }
        Ok(())
    }

    /// Inserts `event`, splitting the receiving leaf if it now exceeds the
    /// split threshold.
    ///
    /// The insertion may trigger a release of resident payloads.  If writing
    /// one of them back fails, the error is returned; the event itself has
    /// been inserted and the payload that failed to save stays resident.
    pub fn insert(&self, event: E) -> Result<(), BoxTreeError> {
        self.insert_event(event, true)
    }

    /// Inserts many events without splitting.  Aggregates are recomputed
    /// lazily.  Call [`BoxTree::finalize`] afterward to split overfull
    /// leaves.  Returns the number of events inserted.
    pub fn add_events<I>(&self, events: I) -> Result<usize, BoxTreeError>
    where
        I: IntoIterator<Item = E>,
    {
        let mut count = 0;
        for event in events {
            self.insert_event(event, false)?;
            count += 1;
        }
        Ok(count)
    }

    fn insert_event(&self, event: E, split: bool) -> Result<(), BoxTreeError> {
        self.check_coordinates(event.coordinates())?;
        self.controller.freeze();
        let added = size_of::<E>() + event.heap_bytes();

        let mut path = Vec::new();
        let mut current = ROOT;
        loop {
            let node = self.node(current);
            let next = match &*node.body() {
                NodeBody::Grid(grid) => Some(grid.child_for(node.extents(), event.coordinates())),
                NodeBody::Leaf(_) => None,
            };
            if let Some(child) = next {
                path.push(current);
                current = child;
                continue;
            }

            let mut guard = BusyGuard::new(self, current);
            let mut body = self.lock_loaded(&guard.node)?;
            let NodeBody::Leaf(leaf) = &mut *body else {
                // Another thread split this leaf after we routed to it.
                continue;
            };
            leaf.insert(guard.node.id(), guard.node.extents(), event, !split)?;

            let created = if split && leaf.split_candidate(&self.controller, guard.node.depth()) {
                self.split_locked(&guard.node, &mut body)
            } else {
                SplitResult::default()
            };
            guard.change = residency(&body);
            drop(body);
            self.track_leaves(created.leaves);
            break;
        }

        for grid in path.into_iter().rev() {
            self.invalidate(grid);
        }
        self.after_insert(added)
    }

    fn invalidate(&self, node_ref: NodeRef) {
        if let NodeBody::Grid(grid) = &mut *self.node(node_ref).body() {
            grid.invalidate();
        }
    }

    /// Gives the disk buffer (and, if configured, the memory monitor) a
    /// chance to release memory after `added` bytes were inserted.
    fn after_insert(&self, added: usize) -> Result<(), BoxTreeError> {
        let buffer = self.controller.buffer();
        let released = buffer.release_accumulated(
            self,
            self.controller.store(),
            added,
            buffer.config().accumulation_bytes,
        )?;
        if released.is_some() {
            if let Some(ratio) = self.config.memory_release_ratio {
                self.controller.monitor().request_release(ratio, self)?;
            }
        }
        Ok(())
    }

    /// Replaces the leaf in `body`, which belongs to `node` and is locked and
    /// loaded, by a grid of new children.  Children that are themselves over
    /// the threshold are split in turn.
    ///
    /// The new leaves are not yet tracked by the disk buffer.  The caller
    /// passes them to [`BoxTree::track_leaves`] once `body` is unlocked.
    fn split_locked(&self, node: &Node<E>, body: &mut NodeBody<E>) -> SplitResult {
        let placeholder = NodeBody::Grid(GridBox::new(Vec::new(), 0, Statistics::default()));
        let mut result = SplitResult::default();
        match std::mem::replace(body, placeholder) {
            NodeBody::Leaf(leaf) => {
                let grid =
                    self.split_leaf(node.id(), node.extents(), node.depth(), leaf, &mut result);
                *body = NodeBody::Grid(grid);
            }
            grid => *body = grid,
        }
        result
    }

    /// Starts tracking freshly split leaves in the disk buffer.
    ///
    /// Other threads may already have reached a leaf through its new parent,
    /// so its residency is read under its own lock while it is pinned rather
    /// than taken from the split.
    fn track_leaves(&self, leaves: Vec<NodeRef>) {
        for leaf in leaves {
            let mut guard = BusyGuard::new(self, leaf);
            let change = residency(&guard.node.body());
            guard.change = change;
        }
    }

    fn split_leaf(
        &self,
        id: u64,
        extents: &Extents,
        depth: usize,
        mut leaf: LeafBox<E>,
        result: &mut SplitResult,
    ) -> GridBox {
        let fan_out = self.controller.policy().fan_out;
        let statistics = leaf.statistics();
        debug!(
            "splitting box {id} at depth {depth} with {} events",
            leaf.event_count
        );
        counter!(BOX_SPLITS).increment(1);
        result.splits += 1;

        let mut children = Vec::new();
        for (region, child) in leaf.split(extents, fan_out) {
            let child_id = self.controller.allocate_id();
            let child_depth = depth + 1;
            let body = if child.split_candidate(&self.controller, child_depth) {
                NodeBody::Grid(self.split_leaf(child_id, &region, child_depth, child, result))
            } else {
                NodeBody::Leaf(child)
            };
            let is_leaf = matches!(body, NodeBody::Leaf(_));
            let child_ref = self.push_node(Node::new(child_id, child_depth, region, body));
            if is_leaf {
                result.leaves.push(child_ref);
            }
            children.push(child_ref);
        }
        GridBox::new(children, fan_out, statistics)
    }

    /// Splits every leaf that exceeds the split threshold, working on the
    /// subtrees under the root in parallel.  Returns the number of splits.
    pub fn finalize(&self) -> Result<usize, BoxTreeError> {
        let children = match &*self.node(ROOT).body() {
            NodeBody::Grid(grid) => grid.children.clone(),
            NodeBody::Leaf(_) => Vec::new(),
        };
        let splits = if children.is_empty() {
            self.split_sweep(ROOT)?
        } else {
            self.for_each_subtree(&children, "boxtree-split", |node_ref| {
                self.split_sweep(node_ref)
            })?
            .into_iter()
            .sum()
        };
        info!("finalize performed {splits} splits");
        Ok(splits)
    }

    /// Runs `f` on each of `roots`, spreading them across up to
    /// `max_threads` named threads, and returns the results in order.
    fn for_each_subtree<T, F>(
        &self,
        roots: &[NodeRef],
        name: &str,
        f: F,
    ) -> Result<Vec<T>, BoxTreeError>
    where
        T: Send,
        F: Fn(NodeRef) -> Result<T, BoxTreeError> + Sync,
    {
        let threads = self
            .config
            .max_threads
            .unwrap_or(roots.len())
            .clamp(1, roots.len().max(1));
        let chunk_size = roots.len().div_ceil(threads).max(1);
        let f = &f;

        thread::scope(|scope| {
            let handles = roots
                .chunks(chunk_size)
                .enumerate()
                .map(|(i, chunk)| {
                    thread::Builder::new()
                        .name(format!("{name}-{i}"))
                        .spawn_scoped(scope, move || {
                            chunk.iter().map(|&node_ref| f(node_ref)).collect::<Result<Vec<T>, _>>()
                        })
                        .map_err(StorageError::from)
                })
                .collect::<Result<Vec<_>, _>>()?;

            let mut results = Vec::with_capacity(roots.len());
            for handle in handles {
                let chunk = handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?;
                results.extend(chunk);
            }
            Ok(results)
        })
    }

    fn split_sweep(&self, node_ref: NodeRef) -> Result<usize, BoxTreeError> {
        let node = self.node(node_ref);
        let children = match &*node.body() {
            NodeBody::Grid(grid) => grid.children.clone(),
            NodeBody::Leaf(leaf) => {
                if !leaf.split_candidate(&self.controller, node.depth()) {
                    return Ok(0);
                }
                Vec::new()
            }
        };
        if !children.is_empty() {
            let mut splits = 0;
            for child in children {
                splits += self.split_sweep(child)?;
            }
            return Ok(splits);
        }

        let mut guard = BusyGuard::new(self, node_ref);
        let mut body = self.lock_loaded(&guard.node)?;
        let candidate = match &*body {
            NodeBody::Leaf(leaf) => Some(leaf.split_candidate(&self.controller, node.depth())),
            NodeBody::Grid(_) => None,
        };
        let created = match candidate {
            Some(true) => self.split_locked(&guard.node, &mut body),
            Some(false) => SplitResult::default(),
            None => {
                // Split by an insertion since we looked.
                drop(body);
                drop(guard);
                return self.split_sweep(node_ref);
            }
        };
        guard.change = residency(&body);
        drop(body);
        self.track_leaves(created.leaves);
        Ok(created.splits)
    }

    /// Aggregate over the whole tree.  Never loads a payload.
    pub fn statistics(&self) -> Statistics {
        self.node_statistics(ROOT)
    }

    /// Aggregate over the subtree at `node_ref`, recomputing stale grid
    /// caches on the way.
    pub fn node_statistics(&self, node_ref: NodeRef) -> Statistics {
        let node = self.node(node_ref);
        let (children, version) = match &mut *node.body() {
            NodeBody::Leaf(leaf) => return leaf.statistics(),
            NodeBody::Grid(grid) if !grid.stale => return grid.statistics,
            NodeBody::Grid(grid) => (grid.children.clone(), grid.version),
        };

        let total: Statistics = children
            .into_iter()
            .map(|child| self.node_statistics(child))
            .sum();
        if let NodeBody::Grid(grid) = &mut *node.body() {
            grid.cache(total, version);
        }
        total
    }

    /// Like [`BoxTree::statistics`], computing the subtrees under the root
    /// in parallel.
    pub fn statistics_parallel(&self) -> Result<Statistics, BoxTreeError> {
        let root = self.node(ROOT);
        let (children, version) = match &mut *root.body() {
            NodeBody::Leaf(leaf) => return Ok(leaf.statistics()),
            NodeBody::Grid(grid) if !grid.stale => return Ok(grid.statistics),
            NodeBody::Grid(grid) => (grid.children.clone(), grid.version),
        };

        let total: Statistics = self
            .for_each_subtree(&children, "boxtree-stats", |node_ref| {
                Ok(self.node_statistics(node_ref))
            })?
            .into_iter()
            .sum();
        if let NodeBody::Grid(grid) = &mut *root.body() {
            grid.cache(total, version);
        }
        Ok(total)
    }

    /// Reads a node for a query: a grid's children, or a leaf's events
    /// (loading them if needed).
    fn visit(&self, node_ref: NodeRef) -> Result<Visit<E>, BoxTreeError> {
        let node = self.node(node_ref);
        if let NodeBody::Grid(grid) = &*node.body() {
            return Ok(Visit::Grid(grid.children.clone()));
        }

        let mut guard = BusyGuard::new(self, node_ref);
        let mut body = self.lock_loaded(&guard.node)?;
        let visit = match &mut *body {
            NodeBody::Grid(grid) => Visit::Grid(grid.children.clone()),
            NodeBody::Leaf(leaf) => Visit::Leaf(LeafView {
                node: node_ref,
                id: node.id(),
                depth: node.depth(),
                extents: node.extents().clone(),
                statistics: leaf.statistics(),
                events: leaf.events.clone(),
            }),
        };
        guard.change = residency(&body);
        Ok(visit)
    }

    fn check_query(&self, query: &Extents) -> Result<(), BoxTreeError> {
        if query.dimensions() != self.dimensions() {
            return Err(InsertError::DimensionMismatch {
                expected: self.dimensions(),
                found: query.dimensions(),
            }
            .into());
        }
        Ok(())
    }

    /// Iterates over the leaves whose regions intersect `query`, loading each
    /// leaf's payload only when the iterator reaches it.
    pub fn leaves_in(&self, query: Extents) -> Result<LeafIter<'_, E>, BoxTreeError> {
        self.check_query(&query)?;
        Ok(LeafIter {
            tree: self,
            query,
            stack: vec![ROOT],
        })
    }

    /// Every leaf of the tree.
    pub fn leaves(&self) -> LeafIter<'_, E> {
        LeafIter {
            tree: self,
            query: self.extents.clone(),
            stack: vec![ROOT],
        }
    }

    /// Sums the events that lie within `query`.  Boxes entirely inside the
    /// query contribute their cached aggregate without being loaded.
    pub fn integrate(&self, query: &Extents) -> Result<Statistics, BoxTreeError> {
        self.check_query(query)?;
        let mut total = Statistics::default();
        let mut stack = vec![ROOT];
        while let Some(node_ref) = stack.pop() {
            let node = self.node(node_ref);
            if !query.intersects(node.extents()) {
                continue;
            }
            if query.contains_extents(node.extents()) {
                total += self.node_statistics(node_ref);
                continue;
            }
            match self.visit(node_ref)? {
                Visit::Grid(children) => stack.extend(children),
                Visit::Leaf(view) => {
                    for event in view.events.iter().filter(|e| query.contains(e.coordinates())) {
                        total.accumulate(event);
                        total.events += 1;
                    }
                }
            }
        }
        Ok(total)
    }

    /// Counts the tree's boxes by kind and paging state.
    pub fn shape(&self) -> TreeShape {
        let nodes = self.arena.read().unwrap().clone();
        let mut shape = TreeShape::default();
        for node in nodes {
            let info = node.info();
            shape.max_depth = shape.max_depth.max(info.depth);
            match info.kind {
                NodeKind::Grid => shape.grids += 1,
                NodeKind::Leaf => {
                    shape.leaves += 1;
                    shape.events += info.event_count;
                    if let Some(page) = info.page {
                        shape.loaded_leaves += page.loaded as usize;
                        shape.dirty_leaves += page.dirty as usize;
                    }
                }
            }
        }
        shape
    }

    /// Bytes of leaf payload currently resident.
    pub fn resident_bytes(&self) -> usize {
        self.controller.buffer().resident_bytes()
    }

    /// Writes back and releases least recently used payloads until the
    /// resident total is within the configured budget.
    pub fn release_if_over_budget(&self) -> Result<ReleaseReport, BoxTreeError> {
        self.release_to(self.controller.buffer().config().max_resident_bytes)
    }

    /// Writes back and releases least recently used payloads until at most
    /// `ceiling` bytes are resident.
    pub fn release_to(&self, ceiling: usize) -> Result<ReleaseReport, BoxTreeError> {
        Ok(self
            .controller
            .buffer()
            .release_if_over_budget(self, self.controller.store(), ceiling)?)
    }

    /// Saves every dirty payload and writes an index describing the tree, so
    /// that [`BoxTree::open`] can reopen it.
    ///
    /// Insertions running concurrently with a flush are not guaranteed to be
    /// captured by it.
    pub fn flush(&self) -> Result<FlushReport, BoxTreeError> {
        let store = self.controller.store();
        let nodes = self.arena.read().unwrap().clone();

        let mut saved = 0;
        for node in &nodes {
            if node.is_dirty() {
                node.save_to_store(store)?;
                saved += 1;
            }
        }

        let mut indexed = Vec::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            let role = match &mut *node.body() {
                NodeBody::Leaf(leaf) => {
                    if leaf.page.dirty {
                        return Err(StorageError::Corrupt(format!(
                            "box {} changed while the tree was being flushed",
                            node.id()
                        ))
                        .into());
                    }
                    leaf.refresh();
                    IndexedRole::Leaf {
                        file_offset: leaf.page.ever_saved.then_some(leaf.page.file_offset),
                        file_event_count: leaf.page.file_event_count,
                    }
                }
                NodeBody::Grid(grid) => IndexedRole::Grid {
                    fan_out: grid.fan_out,
                    children: grid.children.iter().map(NodeRef::index).collect(),
                },
            };
            indexed.push(IndexedNode {
                id: node.id(),
                depth: node.depth(),
                extents: node.extents().clone(),
                statistics: self.node_statistics(NodeRef(i)),
                role,
            });
        }

        let index = TreeIndex {
            event_kind: E::KIND.to_string(),
            dimensions: self.dimensions(),
            policy: self.controller.policy(),
            next_id: self.controller.next_id(),
            nodes: indexed,
        };
        let (index_offset, index_len) = index.append(store)?;
        Header {
            dimensions: self.dimensions() as u64,
            index: Some((index_offset, index_len)),
        }
        .write(store)?;
        store.sync()?;
        counter!(INDEX_WRITES).increment(1);

        info!("flushed box tree: {saved} payloads saved, index at offset {index_offset}");
        Ok(FlushReport {
            saved,
            index_offset,
            index_len,
        })
    }
}

impl<E: Event> PageResolver for BoxTree<E> {
    fn resolve(&self, node: NodeRef) -> Option<Arc<dyn Saveable>> {
        self.arena
            .read()
            .unwrap()
            .get(node.0)
            .map(|node| node.clone() as Arc<dyn Saveable>)
    }
}

impl<E: Event> Releasable for BoxTree<E> {
    fn releasable_bytes(&self) -> usize {
        self.resident_bytes()
    }

    fn release_bytes(&self, bytes: usize) -> Result<ReleaseReport, StorageError> {
        let ceiling = self.resident_bytes().saturating_sub(bytes);
        self.controller
            .buffer()
            .release_if_over_budget(self, self.controller.store(), ceiling)
    }
}

/// Iterator returned by [`BoxTree::leaves_in`].
pub struct LeafIter<'a, E: Event> {
    tree: &'a BoxTree<E>,
    query: Extents,
    stack: Vec<NodeRef>,
}

impl<E: Event> Iterator for LeafIter<'_, E> {
    type Item = Result<LeafView<E>, BoxTreeError>;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(node_ref) = self.stack.pop() {
            if !self
                .query
                .intersects(self.tree.node(node_ref).extents())
            {
                continue;
            }
            match self.tree.visit(node_ref) {
                Ok(Visit::Grid(children)) => self.stack.extend(children.into_iter().rev()),
                Ok(Visit::Leaf(view)) => return Some(Ok(view)),
                Err(error) => return Some(Err(error)),
            }
        }
        None
    }
}
