//! Storage metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! stores maintain via [`metrics`] crate interfaces.
use ::metrics::{describe_counter, describe_histogram, Unit};
use std::sync::Once;

/// Total number of successful writes (appends and in-place rewrites).
pub const WRITES_SUCCESS: &str = "boxtree.store.total_writes_success";

/// Total number of failed writes.
pub const WRITES_FAILED: &str = "boxtree.store.total_writes_failed";

/// Total number of successful reads.
pub const READS_SUCCESS: &str = "boxtree.store.total_reads_success";

/// Total number of failed reads.
pub const READS_FAILED: &str = "boxtree.store.total_reads_failed";

/// Total number of bytes successfully written.
pub const TOTAL_BYTES_WRITTEN: &str = "boxtree.store.total_bytes_written";

/// Total number of bytes successfully read.
pub const TOTAL_BYTES_READ: &str = "boxtree.store.total_bytes_read";

/// Histogram of write latency.
pub const WRITE_LATENCY: &str = "boxtree.store.write_latency";

/// Histogram of read latency.
pub const READ_LATENCY: &str = "boxtree.store.read_latency";

/// Adds descriptions for the metrics we expose.
pub(crate) fn describe_store_metrics() {
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        describe_counter!(WRITES_SUCCESS, "total number of store writes");
        describe_counter!(WRITES_FAILED, "total number of failed store writes");
        describe_counter!(READS_SUCCESS, "total number of store reads");
        describe_counter!(READS_FAILED, "total number of failed store reads");

        describe_counter!(
            TOTAL_BYTES_WRITTEN,
            Unit::Bytes,
            "total number of bytes written to the store"
        );
        describe_counter!(
            TOTAL_BYTES_READ,
            Unit::Bytes,
            "total number of bytes read from the store"
        );

        describe_histogram!(READ_LATENCY, Unit::Seconds, "Read request latency");
        describe_histogram!(WRITE_LATENCY, Unit::Seconds, "Write request latency");
    });
}
