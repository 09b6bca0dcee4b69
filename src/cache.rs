//! TTL + LRU caches with single-flight computation.
//!
//! The cache holds no references to producers: callers pass a compute
//! closure per call, and concurrent misses on one key share a single
//! in-flight computation — every waiter observes the resulting value or the
//! same shared error.

use crate::error::{EngineError, EngineResult};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    last_used: u64,
}

type FlightCell<V> = Arc<OnceCell<Result<V, Arc<EngineError>>>>;

pub struct TtlCache<V: Clone + Send + Sync + 'static> {
    name: &'static str,
    ttl: Option<Duration>,
    /// Maximum entry count; 0 means unbounded.
    capacity: usize,
    entries: Mutex<HashMap<String, Entry<V>>>,
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    inflight: DashMap<String, FlightCell<V>>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    pub fn new(name: &'static str, ttl: Option<Duration>, capacity: usize) -> Self {
        Self {
            name,
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            inflight: DashMap::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Lookup with lazy TTL expiry on access.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock();
        let expired = match entries.get_mut(key) {
            Some(entry) => {
                if self.ttl.is_some_and(|ttl| entry.inserted.elapsed() >= ttl) {
                    true
                } else {
                    entry.last_used = self.tick.fetch_add(1, Ordering::Relaxed);
                    let value = entry.value.clone();
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            entries.remove(key);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    pub fn insert(&self, key: &str, value: V) {
        let mut entries = self.entries.lock();
        if self.capacity > 0 && !entries.contains_key(key) && entries.len() >= self.capacity {
            let lru = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone());
            if let Some(lru_key) = lru {
                entries.remove(&lru_key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value,
                inserted: Instant::now(),
                last_used: self.tick.fetch_add(1, Ordering::Relaxed),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Fetch or compute under the single-flight discipline: concurrent
    /// callers for a missing key share one computation, and every waiter
    /// sees the same value or the same error.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> EngineResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = EngineResult<V>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let cell = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .value()
            .clone();
        let result = cell
            .get_or_init(|| async {
                match compute().await {
                    Ok(value) => {
                        self.insert(key, value.clone());
                        Ok(value)
                    }
                    Err(e) => Err(Arc::new(e)),
                }
            })
            .await
            .clone();
        self.inflight.remove(key);
        result.map_err(EngineError::Shared)
    }

    /// Pre-populate entries for an explicit key list via single-flight.
    /// Returns how many keys ended up resident.
    pub async fn warm<F, Fut>(&self, keys: &[String], compute: F) -> usize
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = EngineResult<V>>,
    {
        let mut warmed = 0usize;
        for key in keys {
            if self.get_or_compute(key, || compute(key.clone())).await.is_ok() {
                warmed += 1;
            }
        }
        warmed
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.entries.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn hit_miss_accounting() {
        let cache: TtlCache<u32> = TtlCache::new("test", None, 10);
        assert!(cache.get("a").is_none());
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.len, 1);
    }

    #[test]
    fn ttl_expires_lazily() {
        let cache: TtlCache<u32> = TtlCache::new("test", Some(Duration::from_millis(20)), 10);
        cache.insert("a", 1);
        assert_eq!(cache.get("a"), Some(1));
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("a").is_none());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn lru_eviction_at_capacity() {
        let cache: TtlCache<u32> = TtlCache::new("test", None, 2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" becomes the least recently used.
        assert_eq!(cache.get("a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get("a"), Some(1));
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test]
    async fn single_flight_runs_compute_once() {
        let cache: Arc<TtlCache<u32>> = Arc::new(TtlCache::new("test", None, 10));
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute("key", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        Ok(42u32)
                    })
                    .await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_flight_shares_errors() {
        let cache: Arc<TtlCache<u32>> = Arc::new(TtlCache::new("test", None, 10));
        let calls = Arc::new(AtomicU32::new(0));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let cache = cache.clone();
            let calls = calls.clone();
            tasks.push(tokio::spawn(async move {
                cache
                    .get_or_compute("key", || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(25)).await;
                        Err::<u32, _>(EngineError::Embedding("boom".into()))
                    })
                    .await
            }));
        }
        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert!(matches!(err, EngineError::Shared(_)));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // Nothing was cached; a later call recomputes.
        assert!(cache.get("key").is_none());
    }

    #[tokio::test]
    async fn warm_populates_entries() {
        let cache: TtlCache<String> = TtlCache::new("test", None, 10);
        let keys = vec!["a".to_string(), "b".to_string()];
        let warmed = cache
            .warm(&keys, |key| async move { Ok(format!("value-{key}")) })
            .await;
        assert_eq!(warmed, 2);
        assert_eq!(cache.get("a"), Some("value-a".to_string()));
        assert_eq!(cache.get("b"), Some("value-b".to_string()));
    }
}
