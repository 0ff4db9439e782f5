#![forbid(unsafe_code)]
//! Byte accounting for long-running jobs such as log scans and degree rebuilds.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{Result, StoreError};

/// Counts outstanding bytes and optionally enforces an upper bound.
#[derive(Debug)]
pub struct MemoryTracker {
    limit: Option<u64>,
    allocated: AtomicU64,
    peak: AtomicU64,
}

/// Shared tracker without a limit, for callers that do not care.
pub static UNTRACKED: MemoryTracker = MemoryTracker::unlimited();

impl MemoryTracker {
    /// Tracker that never refuses an allocation.
    pub const fn unlimited() -> Self {
        Self {
            limit: None,
            allocated: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// Tracker that refuses to exceed `limit` outstanding bytes.
    pub const fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            allocated: AtomicU64::new(0),
            peak: AtomicU64::new(0),
        }
    }

    /// Tracker built from an optional configured limit.
    pub fn from_limit(limit: Option<u64>) -> Self {
        match limit {
            Some(limit) => Self::with_limit(limit),
            None => Self::unlimited(),
        }
    }

    /// Records `bytes` as allocated.
    pub fn allocate(&self, bytes: u64) -> Result<()> {
        let total = self.allocated.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if let Some(limit) = self.limit {
            if total > limit {
                self.allocated.fetch_sub(bytes, Ordering::AcqRel);
                return Err(StoreError::MemoryLimitExceeded {
                    requested: total,
                    limit,
                });
            }
        }
        self.peak.fetch_max(total, Ordering::AcqRel);
        Ok(())
    }

    /// Returns `bytes` previously recorded with [`MemoryTracker::allocate`].
    pub fn release(&self, bytes: u64) {
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                Some(cur.saturating_sub(bytes))
            });
    }

    /// Currently outstanding bytes.
    pub fn allocated(&self) -> u64 {
        self.allocated.load(Ordering::Acquire)
    }

    /// Highest outstanding total observed.
    pub fn peak(&self) -> u64 {
        self.peak.load(Ordering::Acquire)
    }

    /// Configured limit, if any.
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }
}

impl Default for MemoryTracker {
    fn default() -> Self {
        Self::unlimited()
    }
}
