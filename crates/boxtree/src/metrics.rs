//! Box-tree metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! tree and its disk buffer maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_gauge, Unit};
use std::sync::Once;

/// Total number of leaves split into grids.
pub const BOX_SPLITS: &str = "boxtree.box.splits";

/// Total number of leaf payloads loaded from the store.
pub const BOX_LOADS: &str = "boxtree.box.loads";

/// Total number of leaf payloads written to the store.
pub const BOX_SAVES: &str = "boxtree.box.saves";

/// Total number of leaf payloads released from memory.
pub const BOX_EVICTIONS: &str = "boxtree.buffer.evictions";

/// Total number of payload bytes released from memory.
pub const BYTES_EVICTED: &str = "boxtree.buffer.bytes_evicted";

/// Payload bytes currently tracked as resident by the buffer.
pub const RESIDENT_BYTES: &str = "boxtree.buffer.resident_bytes";

/// Total number of tree indexes written to the store.
pub const INDEX_WRITES: &str = "boxtree.index.writes";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_tree_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(BOX_SPLITS, "total number of leaf splits");
        describe_counter!(BOX_LOADS, "total number of leaf payload loads");
        describe_counter!(BOX_SAVES, "total number of leaf payload saves");
        describe_counter!(BOX_EVICTIONS, "total number of leaf payload evictions");
        describe_counter!(
            BYTES_EVICTED,
            Unit::Bytes,
            "total number of payload bytes released from memory"
        );
        describe_gauge!(
            RESIDENT_BYTES,
            Unit::Bytes,
            "payload bytes currently resident in memory"
        );
        describe_counter!(INDEX_WRITES, "total number of tree index writes");
    });
}
