//! Single-flight de-duplication of concurrent fetches for the same key.
//!
//! This is the "insertion cookie" half of §4.5's artifact cache: a miss
//! creates exactly one downloader per key, and every other concurrent
//! caller for that key waits on the same [`BroadcastFuture`] rather than
//! starting its own. It does not itself hold completed results — pair it
//! with a [`crate::lru_cache::WeightedLruCache`] (or any other store) for
//! that; checking the store, then falling back here, then inserting into
//! the store once the future resolves, is the caller's job (see
//! `cnode-store::artifact_cache`).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use anyhow::Error;

use crate::broadcast_future::BroadcastFuture;

pub struct SingleFlight<K, V> {
    inflight: Mutex<HashMap<K, BroadcastFuture<V>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: std::cmp::Eq + std::hash::Hash + Clone, V: Clone + Send + 'static> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make_future` to produce the value for `key`, unless a fetch
    /// for that key is already in flight — in that case await its result
    /// instead. The winning caller (the one that actually started the
    /// fetch) is responsible for any side effect that should happen
    /// exactly once (e.g. inserting the result into a backing cache);
    /// `is_owner` tells callers which branch they took.
    pub async fn run<F>(&self, key: K, make_future: F) -> (bool, Result<V, Error>)
    where
        F: FnOnce() -> Pin<Box<dyn Future<Output = Result<V, Error>> + Send>>,
    {
        let (is_owner, listen) = {
            let mut inflight = self.inflight.lock().unwrap();
            if let Some(existing) = inflight.get(&key) {
                (false, existing.listen())
            } else {
                let broadcast = BroadcastFuture::new(make_future());
                let listen = broadcast.listen();
                inflight.insert(key.clone(), broadcast);
                (true, listen)
            }
        };

        let result = listen.await;

        if is_owner {
            self.inflight.lock().unwrap().remove(&key);
        }

        (is_owner, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_collapse_into_one_fetch() {
        static CALLS: AtomicUsize = AtomicUsize::new(0);

        let sf: Arc<SingleFlight<u32, u32>> = Arc::new(SingleFlight::new());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            handles.push(tokio::spawn(async move {
                sf.run(1, || {
                    CALLS.fetch_add(1, Ordering::SeqCst);
                    Box::pin(async {
                        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                        Ok(42)
                    })
                })
                .await
            }));
        }

        for h in handles {
            let (_, result) = h.await.unwrap();
            assert_eq!(result.unwrap(), 42);
        }

        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }
}
