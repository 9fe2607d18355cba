//! Tree configuration.
//!
//! [`BoxTreeConfig`] is plain data that can be deserialized from JSON (or any
//! other serde format).  Every field has a default, so an empty object is a
//! valid configuration.

use serde::{Deserialize, Serialize};

use crate::controller::SplitPolicy;
use crate::error::ConfigurationError;

/// Default maximum number of events a leaf holds before it splits.
pub const DEFAULT_SPLIT_THRESHOLD: usize = 1000;

/// Default maximum depth of a leaf.
pub const DEFAULT_MAX_DEPTH: usize = 20;

/// Default number of slices per dimension when a leaf splits.
pub const DEFAULT_FAN_OUT: usize = 2;

/// Configuration for a [`BoxTree`](crate::BoxTree).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxTreeConfig {
    /// A leaf that holds more than this many events is split, as long as it
    /// is shallower than `max_depth`.
    ///
    /// The default is 1000.
    pub split_threshold: usize,

    /// Leaves at this depth never split, however many events they hold.  The
    /// root is at depth 0.
    ///
    /// The default is 20.
    pub max_depth: usize,

    /// Number of equal slices each dimension is cut into when a leaf splits,
    /// so that a split in `N` dimensions produces `fan_out^N` children.
    ///
    /// The default is 2.
    pub fan_out: usize,

    /// Write-back buffer limits.
    pub buffer: DiskBufferConfig,

    /// If set, once the buffer has accumulated enough new data to consider a
    /// release, the system memory monitor is also consulted, and resident
    /// payloads are released until process-wide memory usage falls back under
    /// this fraction of physical memory.
    ///
    /// Must lie in `(0, 1]`.  The default is unset, which relies on
    /// `buffer.max_resident_bytes` alone.
    pub memory_release_ratio: Option<f32>,

    /// Maximum number of threads used by the parallel operations
    /// ([`BoxTree::finalize`](crate::BoxTree::finalize) and
    /// [`BoxTree::statistics_parallel`](crate::BoxTree::statistics_parallel)).
    ///
    /// The default is unset, which uses one thread per child of the root.
    pub max_threads: Option<usize>,
}

impl Default for BoxTreeConfig {
    fn default() -> Self {
        Self {
            split_threshold: DEFAULT_SPLIT_THRESHOLD,
            max_depth: DEFAULT_MAX_DEPTH,
            fan_out: DEFAULT_FAN_OUT,
            buffer: DiskBufferConfig::default(),
            memory_release_ratio: None,
            max_threads: None,
        }
    }
}

impl BoxTreeConfig {
    pub fn split_policy(&self) -> SplitPolicy {
        SplitPolicy {
            split_threshold: self.split_threshold,
            max_depth: self.max_depth,
            fan_out: self.fan_out,
        }
    }

    /// Checks the configuration for a tree with `dimensions` dimensions.
    pub fn validate(&self, dimensions: usize) -> Result<(), ConfigurationError> {
        self.split_policy().validate(dimensions)?;
        if let Some(ratio) = self.memory_release_ratio {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigurationError::InvalidReleaseRatio(ratio));
            }
        }
        Ok(())
    }
}

/// Limits for the write-back buffer that tracks resident leaf payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskBufferConfig {
    /// Resident payload bytes above which least-recently-used payloads are
    /// written back (if dirty) and released.
    ///
    /// The default is 256 MiB.
    pub max_resident_bytes: usize,

    /// Newly inserted bytes to accumulate between checks of the resident
    /// ceiling.  Checking after every insertion would make each insertion pay
    /// for a buffer-wide lock; batching the checks turns many small releases
    /// into fewer, larger ones.
    ///
    /// The default is 4 MiB.
    pub accumulation_bytes: usize,
}

impl Default for DiskBufferConfig {
    fn default() -> Self {
        Self {
            max_resident_bytes: 256 * 1024 * 1024,
            accumulation_bytes: 4 * 1024 * 1024,
        }
    }
}
