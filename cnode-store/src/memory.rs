//! Write-session memory quota (§4.3: "Pre-acquires memory quota for ALL
//! blocks in the batch before touching any slot").
//!
//! Grounded on `TNodeMemoryTrackerGuard::TryAcquire` from
//! `original_source/.../blob_session.cpp`, reshaped as an RAII guard the
//! same way `cnode_io::PendingIoGuard` wraps IO accounting.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub struct MemoryTracker {
    limit: i64,
    used: AtomicI64,
}

impl MemoryTracker {
    pub fn new(limit_bytes: u64) -> Arc<Self> {
        Arc::new(Self {
            limit: limit_bytes as i64,
            used: AtomicI64::new(0),
        })
    }

    /// Reserves `bytes` if doing so would not exceed the configured
    /// limit. Returns `None` (never blocks) when the budget is
    /// exhausted — callers turn that into a retriable error rather than
    /// waiting, since waiting here would stall the control invoker.
    pub fn try_acquire(self: &Arc<Self>, bytes: u64) -> Option<MemoryGuard> {
        let bytes = bytes as i64;
        let mut current = self.used.load(Ordering::SeqCst);
        loop {
            if current + bytes > self.limit {
                return None;
            }
            match self.used.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    return Some(MemoryGuard {
                        tracker: self.clone(),
                        bytes,
                    })
                }
                Err(observed) => current = observed,
            }
        }
    }

    pub fn used_bytes(&self) -> i64 {
        self.used.load(Ordering::SeqCst)
    }
}

pub struct MemoryGuard {
    tracker: Arc<MemoryTracker>,
    bytes: i64,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        self.tracker.used.fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquisitions_beyond_the_limit_are_refused() {
        let tracker = MemoryTracker::new(100);
        let first = tracker.try_acquire(60).unwrap();
        assert!(tracker.try_acquire(60).is_none());
        drop(first);
        assert!(tracker.try_acquire(60).is_some());
    }
}
