//! Byte-rate throttling for session IO (§4.3: "Throttles on *two*
//! throttlers: the node-level in-throttler and the location-level
//! in-throttler"). Wraps `proxmox_http::RateLimiter`, the same
//! token-bucket limiter the teacher shares between processes via
//! `SharedRateLimiter` — we only need the in-process variant here since
//! each node runs a single data-node process.

use std::sync::Mutex;
use std::time::Instant;

use proxmox_http::RateLimiter;

pub struct Throttler {
    limiter: Option<Mutex<RateLimiter>>,
}

impl Throttler {
    pub fn unlimited() -> Self {
        Self { limiter: None }
    }

    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64) -> Self {
        Self {
            limiter: Some(Mutex::new(RateLimiter::new(rate_bytes_per_sec, burst_bytes))),
        }
    }

    /// Accounts `bytes` against the bucket and sleeps as long as the
    /// limiter says is necessary before that traffic is allowed.
    pub async fn acquire(&self, bytes: u64) {
        let delay = match &self.limiter {
            None => return,
            Some(limiter) => limiter.lock().unwrap().register_traffic(Instant::now(), bytes),
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Throttle on both the node-wide and the per-location throttler, as
/// `PutBlocks` must (§4.3): the future only resolves once both have
/// admitted `bytes`.
pub async fn acquire_both(node: &Throttler, location: &Throttler, bytes: u64) {
    node.acquire(bytes).await;
    location.acquire(bytes).await;
}
