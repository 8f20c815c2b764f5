use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// What kind of IO the reservation is for; exposed to the scheduler as
/// backpressure (§4.1) alongside the raw counters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Workload {
    Session,
    Replication,
    ArtifactDownload,
}

#[derive(Default)]
pub(crate) struct PendingIoCounters {
    read: AtomicI64,
    write: AtomicI64,
}

impl PendingIoCounters {
    pub(crate) fn counter(&self, direction: Direction) -> &AtomicI64 {
        match direction {
            Direction::In => &self.write,
            Direction::Out => &self.read,
        }
    }

    pub fn pending_bytes(&self, direction: Direction) -> i64 {
        self.counter(direction).load(Ordering::SeqCst)
    }
}

/// A scoped reservation of pending IO on a location. Decrements the
/// location's counter exactly once, on drop — whether the caller awaits
/// it to completion, drops it early, or the session is cancelled
/// mid-flight (§4.1, §5).
pub struct PendingIoGuard {
    counters: Arc<PendingIoCounters>,
    direction: Direction,
    bytes: i64,
}

impl PendingIoGuard {
    pub(crate) fn new(counters: Arc<PendingIoCounters>, direction: Direction, bytes: i64) -> Self {
        counters.counter(direction).fetch_add(bytes, Ordering::SeqCst);
        Self {
            counters,
            direction,
            bytes,
        }
    }
}

impl Drop for PendingIoGuard {
    fn drop(&mut self) {
        self.counters
            .counter(self.direction)
            .fetch_sub(self.bytes, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_decrements_exactly_once_on_drop() {
        let counters = Arc::new(PendingIoCounters::default());
        {
            let _guard = PendingIoGuard::new(counters.clone(), Direction::In, 100);
            assert_eq!(counters.pending_bytes(Direction::In), 100);
        }
        assert_eq!(counters.pending_bytes(Direction::In), 0);
    }
}
