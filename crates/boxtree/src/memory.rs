//! System memory monitoring.
//!
//! The disk buffer bounds the memory held by leaf payloads, but the rest of
//! the process (and every other process on the machine) competes for the
//! same physical memory.  [`MemoryMonitor`] samples how much of it is in use
//! and, when usage crosses a threshold, asks a [`Releasable`] to give back
//! the excess.

use std::fmt::Debug;
use std::sync::Mutex;

use boxtree_storage::StorageError;
use sysinfo::System;
use tracing::{debug, info};

use crate::buffer::ReleaseReport;

/// A point-in-time view of physical memory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemorySnapshot {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }

    /// Fraction of physical memory in use, in `[0, 1]`.  A snapshot that
    /// reports no memory at all counts as unused.
    pub fn usage_ratio(&self) -> f32 {
        if self.total_bytes == 0 {
            0.0
        } else {
            (self.used_bytes() as f64 / self.total_bytes as f64).clamp(0.0, 1.0) as f32
        }
    }
}

/// Source of memory snapshots.
pub trait MemoryProbe: Send + Sync + Debug {
    fn snapshot(&self) -> MemorySnapshot;
}

/// Reads memory usage from the operating system.
pub struct SystemMemory {
    system: Mutex<System>,
}

impl Debug for SystemMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemMemory").finish_non_exhaustive()
    }
}

impl SystemMemory {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn snapshot(&self) -> MemorySnapshot {
        let mut system = self.system.lock().unwrap();
        system.refresh_memory();
        MemorySnapshot {
            total_bytes: system.total_memory(),
            available_bytes: system.available_memory(),
        }
    }
}

/// A probe that always reports the same numbers, for tests and for hosts
/// where the operating system's figures are not meaningful (e.g. inside a
/// container with a memory limit the kernel does not report).
#[derive(Debug)]
pub struct FixedMemory {
    snapshot: Mutex<MemorySnapshot>,
}

impl FixedMemory {
    pub fn new(total_bytes: u64, available_bytes: u64) -> Self {
        Self {
            snapshot: Mutex::new(MemorySnapshot {
                total_bytes,
                available_bytes,
            }),
        }
    }

    pub fn set_available(&self, available_bytes: u64) {
        self.snapshot.lock().unwrap().available_bytes = available_bytes;
    }
}

impl MemoryProbe for FixedMemory {
    fn snapshot(&self) -> MemorySnapshot {
        *self.snapshot.lock().unwrap()
    }
}

impl<P: MemoryProbe + ?Sized> MemoryProbe for std::sync::Arc<P> {
    fn snapshot(&self) -> MemorySnapshot {
        (**self).snapshot()
    }
}

/// Something that can hand memory back on request.
pub trait Releasable {
    /// Bytes currently held in memory that [`Releasable::release_bytes`]
    /// could give back.
    fn releasable_bytes(&self) -> usize;

    /// Releases at least `bytes` bytes if possible, writing back anything
    /// that has not been persisted first.
    fn release_bytes(&self, bytes: usize) -> Result<ReleaseReport, StorageError>;
}

/// Samples memory usage and triggers releases under pressure.
#[derive(Debug)]
pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
}

impl MemoryMonitor {
    /// A monitor reading the operating system's memory figures.
    pub fn system() -> Self {
        Self::with_probe(SystemMemory::new())
    }

    pub fn with_probe<P: MemoryProbe + 'static>(probe: P) -> Self {
        Self {
            probe: Box::new(probe),
        }
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        self.probe.snapshot()
    }

    /// Fraction of physical memory in use, in `[0, 1]`.
    pub fn current_usage_ratio(&self) -> f32 {
        self.snapshot().usage_ratio()
    }

    /// If usage is above `threshold_ratio`, asks `target` to release enough
    /// to bring it back down.  The request is capped at what `target` holds.
    pub fn request_release(
        &self,
        threshold_ratio: f32,
        target: &dyn Releasable,
    ) -> Result<ReleaseReport, StorageError> {
        let snapshot = self.snapshot();
        let ratio = snapshot.usage_ratio();
        if ratio <= threshold_ratio {
            return Ok(ReleaseReport::default());
        }

        let allowed = (snapshot.total_bytes as f64 * threshold_ratio as f64) as u64;
        let excess = snapshot.used_bytes().saturating_sub(allowed);
        let request = usize::try_from(excess)
            .unwrap_or(usize::MAX)
            .min(target.releasable_bytes());
        if request == 0 {
            debug!("memory usage {ratio:.3} above {threshold_ratio:.3} but nothing to release");
            return Ok(ReleaseReport::default());
        }

        info!(
            "memory usage {ratio:.3} above {threshold_ratio:.3}, releasing {request} bytes"
        );
        target.release_bytes(request)
    }
}

impl Default for MemoryMonitor {
    fn default() -> Self {
        Self::system()
    }
}
