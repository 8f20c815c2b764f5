//! Generic, domain-agnostic building blocks reused by the location/IO
//! engine and the chunk/artifact caches: a weighted LRU, a broadcast
//! future for collapsing concurrent fetches, and single-flight
//! de-duplication built on top of it.

pub mod async_lru_cache;
pub mod broadcast_future;
pub mod lru_cache;
pub mod single_flight;

pub use async_lru_cache::{AsyncCacher, AsyncLruCache};
pub use broadcast_future::BroadcastFuture;
pub use lru_cache::{Weighted, WeightedLruCache};
pub use single_flight::SingleFlight;
