//! The box controller.
//!
//! One [`BoxController`] is shared by every box of a tree.  It owns the split
//! policy, hands out box ids, and is the place the write-back
//! [`DiskBuffer`] and the [`MemoryMonitor`] hang off, so that a box only
//! needs a reference to the controller to make any policy decision.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use boxtree_storage::{BackingStore, Store};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buffer::DiskBuffer;
use crate::config::DiskBufferConfig;
use crate::error::ConfigurationError;
use crate::memory::MemoryMonitor;

/// Largest number of children a single split may produce.
pub const MAX_CHILDREN_PER_SPLIT: usize = 1 << 16;

/// When and how leaves split.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitPolicy {
    pub split_threshold: usize,
    pub max_depth: usize,
    pub fan_out: usize,
}

impl SplitPolicy {
    pub fn validate(&self, dimensions: usize) -> Result<(), ConfigurationError> {
        if self.split_threshold == 0 {
            return Err(ConfigurationError::InvalidSplitThreshold);
        }
        if self.max_depth == 0 {
            return Err(ConfigurationError::InvalidMaxDepth);
        }
        match self.children_per_split(dimensions) {
            Some(n) if self.fan_out >= 2 && n <= MAX_CHILDREN_PER_SPLIT => Ok(()),
            _ => Err(ConfigurationError::InvalidFanOut {
                fan_out: self.fan_out,
                dimensions,
            }),
        }
    }

    /// `fan_out^dimensions`, if it fits in a `usize`.
    pub fn children_per_split(&self, dimensions: usize) -> Option<usize> {
        u32::try_from(dimensions)
            .ok()
            .and_then(|d| self.fan_out.checked_pow(d))
    }
}

/// Shared coordinator for all the boxes of one tree.
pub struct BoxController {
    dimensions: usize,
    policy: ArcSwap<SplitPolicy>,

    /// Set by the first insertion; the policy cannot change afterward.
    frozen: AtomicBool,

    /// Serializes [`BoxController::configure`] against freezing.
    configure_lock: Mutex<()>,

    next_id: AtomicU64,
    store: Store,
    buffer: DiskBuffer,
    monitor: MemoryMonitor,
}

impl std::fmt::Debug for BoxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxController")
            .field("dimensions", &self.dimensions)
            .field("policy", &**self.policy.load())
            .field("frozen", &self.frozen.load(Ordering::Relaxed))
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl BoxController {
    pub fn new(
        dimensions: usize,
        policy: SplitPolicy,
        buffer: DiskBufferConfig,
        store: Store,
        monitor: MemoryMonitor,
    ) -> Result<Self, ConfigurationError> {
        policy.validate(dimensions)?;
        Ok(Self {
            dimensions,
            policy: ArcSwap::new(Arc::new(policy)),
            frozen: AtomicBool::new(false),
            configure_lock: Mutex::new(()),
            next_id: AtomicU64::new(0),
            store,
            buffer: DiskBuffer::new(buffer),
            monitor,
        })
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Returns a fresh id, unique among all boxes of this tree.
    pub fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The id the next call to [`BoxController::allocate_id`] will return.
    pub fn next_id(&self) -> u64 {
        self.next_id.load(Ordering::Relaxed)
    }

    /// Ensures ids handed out from now on are at least `next`.  Used when a
    /// tree is reopened from its store.
    pub(crate) fn reserve_ids(&self, next: u64) {
        self.next_id.fetch_max(next, Ordering::Relaxed);
    }

    pub fn policy(&self) -> SplitPolicy {
        **self.policy.load()
    }

    /// Whether a leaf holding `event_count` events exceeds the split
    /// threshold.
    pub fn should_split(&self, event_count: u64) -> bool {
        event_count > self.policy.load().split_threshold as u64
    }

    /// Whether a box at `depth` is too deep to split.
    pub fn max_depth_reached(&self, depth: usize) -> bool {
        depth >= self.policy.load().max_depth
    }

    /// Replaces the split policy.  Only allowed before the first insertion,
    /// because the existing partitioning was computed under the old policy.
    pub fn configure(
        &self,
        split_threshold: usize,
        max_depth: usize,
        fan_out: usize,
    ) -> Result<(), ConfigurationError> {
        let policy = SplitPolicy {
            split_threshold,
            max_depth,
            fan_out,
        };
        policy.validate(self.dimensions)?;

        let _guard = self.configure_lock.lock().unwrap();
        if self.frozen.load(Ordering::Acquire) {
            return Err(ConfigurationError::AlreadyInserted);
        }
        debug!("split policy changed to {policy:?}");
        self.policy.store(Arc::new(policy));
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Freezes the split policy.  Called before every insertion; only the
    /// first call does any work.
    pub(crate) fn freeze(&self) {
        if !self.frozen.load(Ordering::Acquire) {
            let _guard = self.configure_lock.lock().unwrap();
            self.frozen.store(true, Ordering::Release);
        }
    }

    pub fn store(&self) -> &dyn BackingStore {
        &self.store
    }

    pub fn buffer(&self) -> &DiskBuffer {
        &self.buffer
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }
}
