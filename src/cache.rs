//! TTL cache with atomic get-or-compute.
//!
//! Each key owns an async slot lock. A lookup holds that lock across the
//! freshness check *and* the compute, so concurrent misses for the same key
//! produce one computation; different keys never contend. Expired values
//! are dropped lazily on the next lookup; the key's slot itself is only
//! released by [`TtlCache::purge_expired`]. Failed computations are never
//! stored.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::clock::Clock;

struct Entry<V> {
    value: V,
    cached_at: DateTime<Utc>,
}

type Slot<V> = Arc<Mutex<Option<Entry<V>>>>;

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<V> {
    pub value: V,
    /// True when served from the cache without computing.
    pub hit: bool,
}

pub struct TtlCache<K, V> {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<K, Slot<V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn slot(&self, key: &K) -> Slot<V> {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn is_fresh(&self, entry: &Entry<V>, now: DateTime<Utc>) -> bool {
        now < entry.cached_at + self.ttl
    }

    /// Fresh value for `key`, if any. Never computes.
    pub async fn get(&self, key: &K) -> Option<V> {
        let slot = self.slot(key).await;
        let mut guard = slot.lock().await;
        let now = self.clock.now();
        match guard.as_ref() {
            Some(entry) if self.is_fresh(entry, now) => Some(entry.value.clone()),
            Some(_) => {
                *guard = None;
                None
            }
            None => None,
        }
    }

    /// Serve a fresh entry or run `compute` and store its value.
    pub async fn get_or_try_compute<F, Fut, E>(&self, key: K, compute: F) -> Result<Cached<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let slot = self.slot(&key).await;
        let mut guard = slot.lock().await;

        if let Some(entry) = guard.as_ref() {
            if self.is_fresh(entry, self.clock.now()) {
                return Ok(Cached {
                    value: entry.value.clone(),
                    hit: true,
                });
            }
            *guard = None;
        }

        let value = compute().await?;
        *guard = Some(Entry {
            value: value.clone(),
            cached_at: self.clock.now(),
        });
        Ok(Cached { value, hit: false })
    }

    /// Release slots holding no fresh value that nobody is waiting on.
    /// Returns how many were removed.
    ///
    /// A slot is only handed out while the map lock is held, so a strong
    /// count of one under that lock means no lookup can still reach it.
    pub async fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut slots = self.slots.lock().await;
        let before = slots.len();
        slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(guard) => guard.as_ref().is_some_and(|e| self.is_fresh(e, now)),
                Err(_) => true,
            }
        });
        before - slots.len()
    }

    /// Keys currently holding a slot, fresh or not.
    pub async fn slot_count(&self) -> usize {
        self.slots.lock().await.len()
    }
}
