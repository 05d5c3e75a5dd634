//! Keyed concurrency primitives.
//!
//! `KeyedMutex` serializes async critical sections per string key (one lock
//! per channel, per task, …). `IdempotencyCache` remembers completed results
//! for a bounded time so retried operations can be replayed without
//! re-executing their side effects.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::OwnedMutexGuard;

// ── Keyed async mutex ───────────────────────────────────────────────────────

/// An async mutex namespace: `lock(key)` serializes all callers that pass
/// the same key, while distinct keys proceed independently.
#[derive(Default)]
pub struct KeyedMutex {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Guard returned by [`KeyedMutex::lock`]; the keyed section ends on drop.
pub struct KeyedGuard {
    _inner: OwnedMutexGuard<()>,
}

impl KeyedMutex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `key`, waiting until any current holder releases.
    pub async fn lock(&self, key: &str) -> KeyedGuard {
        let entry = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop lock entries nobody is holding or waiting on.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        KeyedGuard {
            _inner: entry.lock_owned().await,
        }
    }
}

// ── Idempotency cache ───────────────────────────────────────────────────────

/// A keyed result cache with a fixed TTL. Expiry is lazy: stale entries are
/// ignored on read and dropped opportunistically on write.
pub struct IdempotencyCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, T)>>,
}

impl<T: Clone> IdempotencyCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached result for `key` if it has not expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .get(key)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, v)| v.clone())
    }

    /// Record a completed result for `key`.
    pub fn insert(&self, key: &str, value: T) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, (at, _)| at.elapsed() < ttl);
        entries.insert(key.to_string(), (Instant::now(), value));
    }

    /// Forget a recorded result (e.g. when the operation is being retried
    /// after a downstream failure).
    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
    }

    /// Drop all expired entries.
    pub fn evict_expired(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let ttl = self.ttl;
        entries.retain(|_, (at, _)| at.elapsed() < ttl);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn keyed_mutex_serializes_same_key() {
        let mutex = Arc::new(KeyedMutex::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let mutex = Arc::clone(&mutex);
            let counter = Arc::clone(&counter);
            let max_seen = Arc::clone(&max_seen);
            handles.push(tokio::spawn(async move {
                let _guard = mutex.lock("chan-1").await;
                let inside = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(inside, Ordering::SeqCst);
                tokio::task::yield_now().await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        // Never more than one task inside the section for the same key.
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn keyed_mutex_distinct_keys_interleave() {
        let mutex = KeyedMutex::new();
        let _a = mutex.lock("a").await;
        // Must not deadlock: "b" is an independent lock.
        let _b = mutex.lock("b").await;
    }

    #[test]
    fn idempotency_cache_hit_and_miss() {
        let cache = IdempotencyCache::new(Duration::from_secs(60));
        assert!(cache.get("k").is_none());
        cache.insert("k", 7u32);
        assert_eq!(cache.get("k"), Some(7));
    }

    #[test]
    fn idempotency_cache_expires() {
        let cache = IdempotencyCache::new(Duration::from_millis(0));
        cache.insert("k", 1u32);
        assert!(cache.get("k").is_none());
        cache.evict_expired();
    }
}
