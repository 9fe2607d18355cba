use std::sync::Arc;
use std::thread;

use boxtree_storage::{BackingStore, FileStore, MemoryStore, StorageError, Store};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::config::{BoxTreeConfig, DiskBufferConfig};
use crate::error::{BoxTreeError, ConfigurationError, InsertError};
use crate::event::{Event, ExtendedEvent, LeanEvent};
use crate::extents::Extents;
use crate::memory::{FixedMemory, MemoryMonitor};
use crate::node::{NodeKind, NodeRef, Statistics};
use crate::test::init_test_logger;
use crate::tree::BoxTree;

fn config(split_threshold: usize, max_depth: usize, max_resident_bytes: usize) -> BoxTreeConfig {
    BoxTreeConfig {
        split_threshold,
        max_depth,
        fan_out: 2,
        buffer: DiskBufferConfig {
            max_resident_bytes,
            accumulation_bytes: 4096,
        },
        ..BoxTreeConfig::default()
    }
}

/// A monitor that never reports memory pressure.
fn idle_monitor() -> MemoryMonitor {
    MemoryMonitor::with_probe(FixedMemory::new(1 << 40, 1 << 40))
}

fn new_tree<E: Event>(config: BoxTreeConfig, extents: Extents, store: Store) -> BoxTree<E> {
    BoxTree::with_monitor(config, extents, store, idle_monitor()).unwrap()
}

/// Events with integer signals, so that sums are exact in any order.
fn random_events(rng: &mut ChaCha8Rng, n: usize, dimensions: usize, max: f64) -> Vec<LeanEvent> {
    (0..n)
        .map(|_| {
            let coordinates: Vec<f64> = (0..dimensions).map(|_| rng.gen_range(0.0..max)).collect();
            let signal = rng.gen_range(0..100) as f64;
            LeanEvent::new(signal, signal * 2.0, &coordinates)
        })
        .collect()
}

fn expected_statistics(events: &[LeanEvent]) -> Statistics {
    Statistics::of(events)
}

/// Every event stored in the tree, in a canonical order.
fn stored_events<E: Event>(tree: &BoxTree<E>) -> Vec<E> {
    let mut events: Vec<E> = tree
        .leaves()
        .flat_map(|leaf| leaf.unwrap().events)
        .collect();
    sort_events(&mut events);
    events
}

/// Leaves holding events, and how many of those are resident.  Empty leaves
/// occupy no budget and are left alone by releases.
fn resident_payloads<E: Event>(tree: &BoxTree<E>) -> (usize, usize) {
    let mut resident = 0;
    let mut occupied = 0;
    for i in 0..tree.node_count() {
        let info = tree.node_info(NodeRef(i)).unwrap();
        if info.event_count == 0 {
            continue;
        }
        if let Some(page) = info.page {
            occupied += 1;
            resident += page.loaded as usize;
        }
    }
    (resident, occupied)
}

fn sort_events<E: Event>(events: &mut [E]) {
    events.sort_by(|a, b| {
        a.coordinates()
            .iter()
            .map(|c| c.to_bits())
            .cmp(b.coordinates().iter().map(|c| c.to_bits()))
            .then(a.signal().to_bits().cmp(&b.signal().to_bits()))
    });
}

#[test]
fn ten_thousand_events_split_adaptively() {
    init_test_logger();
    let tree = new_tree::<LeanEvent>(
        config(1000, 10, usize::MAX),
        Extents::cube(3, 0.0, 8.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );

    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed);
    let events = random_events(&mut rng, 10_000, 3, 8.0);
    for event in events.iter().cloned() {
        tree.insert(event).unwrap();
    }

    let shape = tree.shape();
    assert!(shape.grids >= 1);
    assert!(shape.leaves >= 10);
    assert_eq!(shape.events, 10_000);
    assert_eq!(tree.statistics(), expected_statistics(&events));

    for leaf in tree.leaves() {
        let leaf = leaf.unwrap();
        assert!(leaf.events.len() <= 1000 || leaf.depth == 10);
        assert!(leaf
            .events
            .iter()
            .all(|e| leaf.extents.contains(e.coordinates())));
    }
}

#[test]
fn resident_bytes_respect_the_ceiling() {
    init_test_logger();
    let store = Arc::new(MemoryStore::new());
    let tree = new_tree::<LeanEvent>(
        config(100, 8, usize::MAX),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        store.clone(),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let events = random_events(&mut rng, 5_000, 2, 1.0);
    tree.add_events(events.iter().cloned()).unwrap();
    tree.finalize().unwrap();
    let before = tree.statistics();
    let resident = tree.resident_bytes();
    assert!(resident > 0);

    let ceiling = resident / 4;
    let report = tree.release_to(ceiling).unwrap();
    assert!(tree.resident_bytes() <= ceiling);
    assert!(report.saved > 0);
    assert!(report.saved <= report.evicted);
    assert!(report.bytes_released >= resident - ceiling);
    assert!(store.size().unwrap() > 0);
    let (loaded, occupied) = resident_payloads(&tree);
    assert!(loaded < occupied);

    // Aggregates come from the cache, and reloading brings back every event.
    assert_eq!(tree.statistics(), before);
    let mut expected = events;
    sort_events(&mut expected);
    assert_eq!(stored_events(&tree), expected);
}

#[test]
fn inserts_past_the_budget_page_out() {
    let tree = new_tree::<LeanEvent>(
        BoxTreeConfig {
            split_threshold: 50,
            max_depth: 8,
            fan_out: 2,
            buffer: DiskBufferConfig {
                max_resident_bytes: 16 * 1024,
                accumulation_bytes: 1024,
            },
            ..BoxTreeConfig::default()
        },
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(99);
    let events = random_events(&mut rng, 3_000, 2, 1.0);
    for event in events.iter().cloned() {
        tree.insert(event).unwrap();
    }
    let (loaded, occupied) = resident_payloads(&tree);
    assert!(loaded < occupied);
    assert_eq!(tree.statistics(), expected_statistics(&events));
    assert_eq!(stored_events(&tree).len(), 3_000);
}

/// Checks that the disk buffer accounts for exactly the resident leaves,
/// each with its current size, and that nothing was left pinned.
fn assert_buffer_matches_tree<E: Event>(tree: &BoxTree<E>) {
    let buffer = tree.controller().buffer();
    let mut resident = 0;
    let mut tracked = 0;
    for i in 0..tree.node_count() {
        let node = NodeRef(i);
        assert!(!buffer.is_pinned(node));
        let info = tree.node_info(node).unwrap();
        match info.page {
            Some(page) if page.loaded => {
                assert!(buffer.position(node).is_some(), "{node:?} is not tracked");
                resident += page.resident_bytes;
                tracked += 1;
            }
            _ => assert_eq!(buffer.position(node), None),
        }
    }
    assert_eq!(buffer.tracked(), tracked);
    assert_eq!(buffer.resident_bytes(), resident);
}

#[test]
fn split_leaves_are_tracked_with_their_sizes() {
    let mut rng = ChaCha8Rng::seed_from_u64(13);
    let events = random_events(&mut rng, 2_000, 2, 1.0);

    let eager = new_tree::<LeanEvent>(
        config(30, 6, 24 * 1024),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    for event in events.iter().cloned() {
        eager.insert(event).unwrap();
    }
    assert!(eager.shape().grids > 1);
    assert_buffer_matches_tree(&eager);

    let batched = new_tree::<LeanEvent>(
        config(30, 6, usize::MAX),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    batched.add_events(events).unwrap();
    assert!(batched.finalize().unwrap() > 1);
    assert_buffer_matches_tree(&batched);

    batched.release_to(0).unwrap();
    assert_buffer_matches_tree(&batched);
    assert_eq!(batched.resident_bytes(), 0);
}

#[test]
fn rejected_events_leave_tree_unchanged() {
    let tree = new_tree::<LeanEvent>(
        BoxTreeConfig::default(),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    tree.insert(LeanEvent::new(1.0, 1.0, &[0.5, 0.5])).unwrap();

    let error = tree
        .insert(LeanEvent::new(1.0, 1.0, &[1.0, 0.5]))
        .unwrap_err();
    assert_eq!(
        error,
        BoxTreeError::Insert(InsertError::OutOfBounds {
            box_id: 0,
            coordinates: vec![1.0, 0.5]
        })
    );

    let error = tree
        .insert(LeanEvent::new(1.0, 1.0, &[0.5, 0.5, 0.5]))
        .unwrap_err();
    assert_eq!(
        error,
        BoxTreeError::Insert(InsertError::DimensionMismatch {
            expected: 2,
            found: 3
        })
    );
    assert_eq!(tree.statistics().events, 1);
}

#[test]
fn policy_is_frozen_by_first_insert() {
    let tree = new_tree::<LeanEvent>(
        BoxTreeConfig::default(),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    tree.configure(10, 4, 3).unwrap();
    assert_eq!(tree.split_policy().fan_out, 3);

    for i in 0..11 {
        tree.insert(LeanEvent::new(1.0, 1.0, &[i as f64 / 11.0, 0.5]))
            .unwrap();
    }
    assert_eq!(
        tree.configure(100, 4, 2),
        Err(ConfigurationError::AlreadyInserted)
    );
    // Eleven events over a threshold of ten: one split into 3x3 children.
    assert_eq!(tree.shape().grids, 1);
    assert_eq!(tree.shape().leaves, 9);
}

#[test]
fn leaves_at_max_depth_do_not_split() {
    let tree = new_tree::<LeanEvent>(
        config(1, 2, usize::MAX),
        Extents::cube(1, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    // All events share a point, so no split can separate them.
    for _ in 0..10 {
        tree.insert(LeanEvent::new(1.0, 1.0, &[0.1])).unwrap();
    }
    let shape = tree.shape();
    assert_eq!(shape.max_depth, 2);
    assert_eq!(shape.events, 10);
    let deepest = tree
        .leaves()
        .map(Result::unwrap)
        .find(|leaf| !leaf.events.is_empty())
        .unwrap();
    assert_eq!(deepest.depth, 2);
    assert_eq!(deepest.events.len(), 10);
}

#[test]
fn batched_insertion_matches_eager_insertion() {
    let mut rng = ChaCha8Rng::seed_from_u64(3);
    let events = random_events(&mut rng, 2_000, 2, 4.0);
    let extents = Extents::cube(2, 0.0, 4.0).unwrap();

    let eager = new_tree::<LeanEvent>(
        config(64, 6, usize::MAX),
        extents.clone(),
        Arc::new(MemoryStore::new()),
    );
    for event in events.iter().cloned() {
        eager.insert(event).unwrap();
    }

    let batched = new_tree::<LeanEvent>(
        config(64, 6, usize::MAX),
        extents,
        Arc::new(MemoryStore::new()),
    );
    assert_eq!(batched.add_events(events.iter().cloned()).unwrap(), 2_000);
    assert_eq!(batched.shape().leaves, 1);
    assert!(batched.finalize().unwrap() > 0);
    assert_eq!(batched.finalize().unwrap(), 0);

    assert_eq!(batched.statistics(), eager.statistics());
    assert_eq!(batched.statistics_parallel().unwrap(), eager.statistics());
    assert_eq!(stored_events(&batched), stored_events(&eager));
    assert_eq!(batched.shape().leaves, eager.shape().leaves);
}

#[test]
fn integrate_agrees_with_brute_force() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let events = random_events(&mut rng, 4_000, 2, 1.0);
    let tree = new_tree::<LeanEvent>(
        config(32, 8, usize::MAX),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    for event in events.iter().cloned() {
        tree.insert(event).unwrap();
    }
    tree.release_to(0).unwrap();

    for query in [
        Extents::new([(0.1, 0.6), (0.25, 0.9)]).unwrap(),
        Extents::new([(0.0, 0.5), (0.0, 0.5)]).unwrap(),
        Extents::new([(-1.0, 2.0), (-1.0, 2.0)]).unwrap(),
    ] {
        let inside: Vec<LeanEvent> = events
            .iter()
            .filter(|e| query.contains(e.coordinates()))
            .cloned()
            .collect();
        assert_eq!(tree.integrate(&query).unwrap(), expected_statistics(&inside));
    }

    let query = Extents::new([(0.0, 0.5), (0.0, 0.5)]).unwrap();
    for leaf in tree.leaves_in(query.clone()).unwrap() {
        assert!(leaf.unwrap().extents.intersects(&query));
    }
    assert!(tree
        .leaves_in(Extents::cube(3, 0.0, 1.0).unwrap())
        .is_err());
}

#[test]
fn flushed_tree_reopens() {
    init_test_logger();
    let store: Store = Arc::new(FileStore::temporary().unwrap());
    let mut rng = ChaCha8Rng::seed_from_u64(21);
    let events: Vec<ExtendedEvent> = (0..1_500)
        .map(|i| {
            let x = rng.gen_range(0.0..10.0);
            let y = rng.gen_range(-5.0..5.0);
            ExtendedEvent::new(rng.gen(), rng.gen(), (i % 7) as u16, i, &[x, y])
        })
        .collect();

    let (statistics, shape, mut expected) = {
        let tree = BoxTree::<ExtendedEvent>::with_monitor(
            config(100, 6, 8 * 1024),
            Extents::new([(0.0, 10.0), (-5.0, 5.0)]).unwrap(),
            store.clone(),
            idle_monitor(),
        )
        .unwrap();
        for event in events.iter().cloned() {
            tree.insert(event).unwrap();
        }
        let report = tree.flush().unwrap();
        assert!(report.index_offset > 0);
        assert_eq!(tree.shape().dirty_leaves, 0);
        (tree.statistics(), tree.shape(), stored_events(&tree))
    };

    let reopened =
        BoxTree::<ExtendedEvent>::open_with_monitor(BoxTreeConfig::default(), store, idle_monitor())
            .unwrap();
    assert_eq!(reopened.split_policy().split_threshold, 100);
    assert_eq!(reopened.statistics(), statistics);
    let reopened_shape = reopened.shape();
    assert_eq!(resident_payloads(&reopened).0, 0);
    assert_eq!(reopened_shape.leaves, shape.leaves);
    assert_eq!(reopened_shape.grids, shape.grids);
    assert_eq!(
        reopened.configure(10, 6, 2),
        Err(ConfigurationError::AlreadyInserted)
    );

    sort_events(&mut expected);
    assert_eq!(stored_events(&reopened), expected);

    // The reopened tree keeps growing without reusing box ids.
    reopened
        .insert(ExtendedEvent::new(1.0, 1.0, 0, 0, &[0.5, 0.5]))
        .unwrap();
    let mut ids: Vec<u64> = (0..reopened.node_count())
        .map(|i| reopened.node_info(NodeRef(i)).unwrap().id)
        .collect();
    let count = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), count);
}

#[test]
fn container_reopens_from_its_path() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("events.boxtree");
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let events = random_events(&mut rng, 800, 3, 2.0);
    {
        let tree = new_tree::<LeanEvent>(
            config(50, 6, usize::MAX),
            Extents::cube(3, 0.0, 2.0).unwrap(),
            Arc::new(FileStore::create(&path).unwrap()),
        );
        tree.add_events(events.iter().cloned()).unwrap();
        tree.finalize().unwrap();
        let first = tree.flush().unwrap();
        assert!(first.saved > 0);

        // A second flush with nothing dirty only rewrites the index.
        let second = tree.flush().unwrap();
        assert_eq!(second.saved, 0);
        assert!(second.index_offset > first.index_offset);
    }

    let tree = BoxTree::<LeanEvent>::open_with_monitor(
        BoxTreeConfig::default(),
        Arc::new(FileStore::open(&path).unwrap()),
        idle_monitor(),
    )
    .unwrap();
    assert_eq!(tree.statistics(), expected_statistics(&events));
    let query = Extents::new([(0.5, 1.5), (0.0, 2.0), (0.25, 1.0)]).unwrap();
    let inside: Vec<LeanEvent> = events
        .iter()
        .filter(|e| query.contains(e.coordinates()))
        .cloned()
        .collect();
    assert_eq!(tree.integrate(&query).unwrap(), expected_statistics(&inside));
}

#[test]
fn reopen_checks_event_kind_and_index() {
    let store: Store = Arc::new(MemoryStore::new());
    {
        let tree = new_tree::<LeanEvent>(
            BoxTreeConfig::default(),
            Extents::cube(1, 0.0, 1.0).unwrap(),
            store.clone(),
        );
        assert!(matches!(
            BoxTree::<LeanEvent>::open_with_monitor(
                BoxTreeConfig::default(),
                store.clone(),
                idle_monitor()
            ),
            Err(error) if error.is_corruption()
        ));
        tree.insert(LeanEvent::new(1.0, 1.0, &[0.5])).unwrap();
        tree.flush().unwrap();
    }

    let error = BoxTree::<ExtendedEvent>::open_with_monitor(
        BoxTreeConfig::default(),
        store.clone(),
        idle_monitor(),
    )
    .unwrap_err();
    assert_eq!(
        error,
        BoxTreeError::Configuration(ConfigurationError::EventKindMismatch {
            expected: "extended",
            found: "lean".into()
        })
    );

    let error = BoxTree::<LeanEvent>::new(
        BoxTreeConfig::default(),
        Extents::cube(1, 0.0, 1.0).unwrap(),
        store,
    )
    .unwrap_err();
    assert!(matches!(
        error,
        BoxTreeError::Configuration(ConfigurationError::StoreNotEmpty(_))
    ));
}

#[test]
fn concurrent_inserts_under_pressure() {
    init_test_logger();
    let tree = new_tree::<LeanEvent>(
        BoxTreeConfig {
            split_threshold: 40,
            max_depth: 8,
            fan_out: 2,
            buffer: DiskBufferConfig {
                max_resident_bytes: 8 * 1024,
                accumulation_bytes: 512,
            },
            ..BoxTreeConfig::default()
        },
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );

    let batches: Vec<Vec<LeanEvent>> = (0..4)
        .map(|seed| random_events(&mut ChaCha8Rng::seed_from_u64(seed), 1_000, 2, 1.0))
        .collect();
    thread::scope(|scope| {
        for batch in &batches {
            let tree = &tree;
            scope.spawn(move || {
                for event in batch.iter().cloned() {
                    tree.insert(event).unwrap();
                }
            });
        }
        scope.spawn(|| {
            for _ in 0..50 {
                tree.release_to(0).unwrap();
                tree.statistics();
            }
        });
    });

    let mut all: Vec<LeanEvent> = batches.concat();
    assert_eq!(tree.statistics(), expected_statistics(&all));
    sort_events(&mut all);
    assert_eq!(stored_events(&tree), all);
}

#[test]
fn memory_pressure_releases_payloads() {
    let tree = BoxTree::<LeanEvent>::with_monitor(
        BoxTreeConfig {
            split_threshold: 50,
            max_depth: 8,
            fan_out: 2,
            buffer: DiskBufferConfig {
                max_resident_bytes: usize::MAX,
                accumulation_bytes: 1,
            },
            memory_release_ratio: Some(0.5),
            ..BoxTreeConfig::default()
        },
        Extents::cube(2, 0.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
        // Every sample reports the machine as full.
        MemoryMonitor::with_probe(FixedMemory::new(1 << 20, 0)),
    )
    .unwrap();
    let mut rng = ChaCha8Rng::seed_from_u64(5);
    let events = random_events(&mut rng, 1_000, 2, 1.0);
    for event in events.iter().cloned() {
        tree.insert(event).unwrap();
    }
    assert!(tree.shape().leaves > 1);
    let (loaded, occupied) = resident_payloads(&tree);
    assert!(loaded < occupied);
    assert_eq!(tree.statistics(), expected_statistics(&events));
}

/// A store that fails every write once armed.
#[derive(Default)]
struct BrokenStore {
    inner: MemoryStore,
    broken: std::sync::atomic::AtomicBool,
}

impl BackingStore for BrokenStore {
    fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, StorageError> {
        self.inner.read(offset, len)
    }

    fn append(&self, bytes: &[u8]) -> Result<u64, StorageError> {
        if self.broken.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(StorageError::StdIo(std::io::ErrorKind::Other));
        }
        self.inner.append(bytes)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<(), StorageError> {
        self.inner.write_at(offset, bytes)
    }

    fn size(&self) -> Result<u64, StorageError> {
        self.inner.size()
    }
}

#[test]
fn failed_write_back_loses_nothing() {
    let store = Arc::new(BrokenStore::default());
    let tree = new_tree::<LeanEvent>(
        config(20, 4, usize::MAX),
        Extents::cube(2, 0.0, 1.0).unwrap(),
        store.clone(),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(17);
    let events = random_events(&mut rng, 500, 2, 1.0);
    for event in events.iter().cloned() {
        tree.insert(event).unwrap();
    }

    store
        .broken
        .store(true, std::sync::atomic::Ordering::Relaxed);
    let error = tree.release_to(0).unwrap_err();
    assert_eq!(
        error,
        BoxTreeError::Storage(StorageError::StdIo(std::io::ErrorKind::Other))
    );
    let (loaded, occupied) = resident_payloads(&tree);
    assert_eq!(loaded, occupied);

    store
        .broken
        .store(false, std::sync::atomic::Ordering::Relaxed);
    tree.release_to(0).unwrap();
    assert_eq!(tree.resident_bytes(), 0);
    assert_eq!(resident_payloads(&tree).0, 0);
    let mut expected = events;
    sort_events(&mut expected);
    assert_eq!(stored_events(&tree), expected);
}

#[test]
fn split_children_tile_their_parent() {
    let tree = new_tree::<LeanEvent>(
        config(4, 5, usize::MAX),
        Extents::cube(3, -1.0, 1.0).unwrap(),
        Arc::new(MemoryStore::new()),
    );
    let mut rng = ChaCha8Rng::seed_from_u64(1);
    for event in random_events(&mut rng, 200, 3, 1.0) {
        tree.insert(event).unwrap();
    }
    for i in 0..tree.node_count() {
        let info = tree.node_info(NodeRef(i)).unwrap();
        if info.kind == NodeKind::Grid {
            assert_eq!(info.children.len(), 8);
            let volume: f64 = info
                .children
                .iter()
                .map(|c| tree.node_info(*c).unwrap().extents.volume())
                .sum();
            assert!((volume - info.extents.volume()).abs() < 1e-12);
            for child in &info.children {
                let child = tree.node_info(*child).unwrap();
                assert_eq!(child.depth, info.depth + 1);
                assert!(info.extents.contains_extents(&child.extents));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn events_are_conserved(
        points in proptest::collection::vec(
            (0u8..100, 0.0f64..1.0, 0.0f64..1.0),
            0..400,
        ),
        split_threshold in 1usize..16,
        evict_every in 1usize..50,
    ) {
        let tree = new_tree::<LeanEvent>(
            config(split_threshold, 6, usize::MAX),
            Extents::cube(2, 0.0, 1.0).unwrap(),
            Arc::new(MemoryStore::new()),
        );
        let events: Vec<LeanEvent> = points
            .iter()
            .map(|&(s, x, y)| LeanEvent::new(s as f64, 1.0, &[x, y]))
            .collect();
        for (i, event) in events.iter().cloned().enumerate() {
            tree.insert(event).unwrap();
            if i % evict_every == 0 {
                tree.release_to(0).unwrap();
            }
        }

        prop_assert_eq!(tree.statistics(), expected_statistics(&events));

        let mut total = 0;
        for leaf in tree.leaves() {
            let leaf = leaf.unwrap();
            prop_assert!(leaf.events.iter().all(|e| leaf.extents.contains(e.coordinates())));
            prop_assert_eq!(leaf.statistics, Statistics::of(&leaf.events));
            total += leaf.events.len();
        }
        prop_assert_eq!(total, events.len());

        let mut expected = events;
        sort_events(&mut expected);
        prop_assert_eq!(stored_events(&tree), expected);
    }

    #[test]
    fn reopened_tree_holds_the_same_events(
        points in proptest::collection::vec(
            (any::<u16>(), any::<u32>(), -1.0f64..1.0, -1.0f64..1.0, -1.0f64..1.0),
            1..200,
        ),
    ) {
        let store: Store = Arc::new(MemoryStore::new());
        let events: Vec<ExtendedEvent> = points
            .iter()
            .map(|&(run, detector, x, y, z)| {
                ExtendedEvent::new(x * 10.0, y * y, run, detector, &[x, y, z])
            })
            .collect();
        {
            let tree = new_tree::<ExtendedEvent>(
                config(8, 5, usize::MAX),
                Extents::cube(3, -1.0, 1.0).unwrap(),
                store.clone(),
            );
            tree.add_events(events.iter().cloned()).unwrap();
            tree.finalize().unwrap();
            tree.flush().unwrap();
        }

        let reopened = BoxTree::<ExtendedEvent>::open_with_monitor(
            BoxTreeConfig::default(),
            store,
            idle_monitor(),
        )
        .unwrap();
        let mut expected = events;
        sort_events(&mut expected);
        prop_assert_eq!(stored_events(&reopened), expected);
    }
}
