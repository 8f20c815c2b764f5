//! An async-safe layer over [`crate::lru_cache::WeightedLruCache`],
//! collapsing concurrent misses for the same key into a single fetch.
//!
//! Grounded on `pbs_tools::async_lru_cache::AsyncLruCache`: a sync LRU
//! guarded by a mutex, plus a side map of in-flight
//! [`crate::broadcast_future::BroadcastFuture`]s keyed the same way, so a
//! second caller for a key already being fetched waits on the first
//! caller's future instead of starting its own (§4.5 "exactly one
//! downloader runs per ArtifactKey").

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use crate::broadcast_future::BroadcastFuture;
use crate::lru_cache::{Weighted, WeightedLruCache};

/// Fetches a value for `key` on a cache miss.
pub trait AsyncCacher<K, V: Clone>: Sync + Send {
    fn fetch(&self, key: K) -> Box<dyn Future<Output = Result<Option<V>, Error>> + Send>;
}

struct Inner<K, V> {
    lru: WeightedLruCache<K, V>,
    inflight: HashMap<K, BroadcastFuture<Option<V>>>,
}

#[derive(Clone)]
pub struct AsyncLruCache<K, V> {
    inner: Arc<Mutex<Inner<K, V>>>,
}

impl<K, V> AsyncLruCache<K, V>
where
    K: std::cmp::Eq + std::hash::Hash + Copy + Send + 'static,
    V: Clone + Send + Weighted + 'static,
{
    pub fn new(capacity_weight: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                lru: WeightedLruCache::new(capacity_weight),
                inflight: HashMap::new(),
            })),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Inserts a value directly, bypassing the fetch path. Used to
    /// repopulate the cache from a startup scan, where the value is
    /// already known to be valid rather than freshly fetched.
    pub fn admit(&self, key: K, value: V) {
        let weight = value.weight();
        let _evicted = self.inner.lock().unwrap().lru.insert(key, value, weight);
    }

    /// `Ok(None)` means the key has no representation (the fetch decided
    /// there's nothing to cache); `Err` means the fetch failed, whether it
    /// was this call's own fetch or one it piggybacked on.
    pub async fn access(&self, key: K, cacher: &dyn AsyncCacher<K, V>) -> Result<Option<V>, Error> {
        let (owner, listen) = {
            let mut inner = self.inner.lock().unwrap();
            if let Some(existing) = inner.inflight.get(&key) {
                (false, existing.listen())
            } else if let Some(value) = inner.lru.get_mut(&key) {
                return Ok(Some(value.clone()));
            } else {
                let future = Box::into_pin(cacher.fetch(key));
                let broadcast = BroadcastFuture::new(Box::pin(async move { future.await }));
                let listen = broadcast.listen();
                inner.inflight.insert(key, broadcast);
                (true, listen)
            }
        };

        let result = listen.await;

        if owner {
            let mut inner = self.inner.lock().unwrap();
            if let Ok(Some(ref value)) = result {
                let weight = value.weight();
                let _evicted = inner.lru.insert(key, value.clone(), weight);
            }
            inner.inflight.remove(&key);
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone)]
    struct Sized(String);

    impl Weighted for Sized {
        fn weight(&self) -> u64 {
            self.0.len() as u64
        }
    }

    struct CountingCacher {
        calls: Arc<AtomicUsize>,
    }

    impl AsyncCacher<i32, Sized> for CountingCacher {
        fn fetch(&self, key: i32) -> Box<dyn Future<Output = Result<Option<Sized>, Error>> + Send> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::new(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                Ok(Some(Sized(format!("v{key}"))))
            })
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_misses_on_the_same_key_fetch_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cacher = CountingCacher { calls: calls.clone() };
        let cache: AsyncLruCache<i32, Sized> = AsyncLruCache::new(1024);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let cacher = CountingCacher { calls: calls.clone() };
            handles.push(tokio::spawn(async move { cache.access(1, &cacher).await }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap().unwrap().0, "v1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn hit_after_fetch_does_not_call_cacher_again() {
        let calls = Arc::new(AtomicUsize::new(0));
        let cacher = CountingCacher { calls: calls.clone() };
        let cache: AsyncLruCache<i32, Sized> = AsyncLruCache::new(1024);

        cache.access(5, &cacher).await.unwrap();
        cache.access(5, &cacher).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
