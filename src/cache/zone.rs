//! Zone (spec.md §4.2): a fixed-capacity Fingerprint → CacheEntry map with
//! LRU eviction.
//!
//! No teacher analog. Grounded on `examples/original_source/cache/cache.go`
//! (`HTTPCacheLRU.FindOrCreate`). Hand-rolled on `HashMap` + `VecDeque`
//! rather than the `lru` crate seen elsewhere in the retrieval pack
//! (`other_examples/.../cache.rs`), because eviction here must skip entries
//! with live waiters or mid-`Fetching`, which `lru::LruCache`'s plain
//! pop-front API cannot express.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::Mutex;

use super::entry::CacheEntry;
use super::fingerprint::Fingerprint;

/// Default multiplier applied to the fetch timeout to derive the watchdog
/// threshold past which a stuck `Fetching` entry becomes evictable
/// (spec.md §3 Zone description).
pub const WATCHDOG_MULTIPLIER: u64 = 2;

struct Inner {
    entries: HashMap<Fingerprint, Arc<CacheEntry>>,
    /// LRU order, most-recently-used at the back. Ties among equal
    /// timestamps are broken FIFO by insertion order into this deque.
    order: VecDeque<Fingerprint>,
}

pub struct Zone {
    capacity: usize,
    watchdog_threshold_secs: u64,
    inner: Mutex<Inner>,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Zone {
    pub fn new(capacity: usize, fetch_timeout_secs: u64) -> Self {
        Self {
            capacity,
            watchdog_threshold_secs: fetch_timeout_secs * WATCHDOG_MULTIPLIER,
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                order: VecDeque::with_capacity(capacity),
            }),
        }
    }

    /// Returns the existing entry for `fp`, marking it MRU, or inserts a
    /// fresh `Initial` entry — evicting the LRU victim first if the zone is
    /// at capacity. O(1) expected.
    pub async fn find_or_create(&self, fp: Fingerprint) -> Arc<CacheEntry> {
        let mut inner = self.inner.lock().await;

        if let Some(entry) = inner.entries.get(&fp).cloned() {
            Self::touch(&mut inner.order, fp);
            return entry;
        }

        if inner.entries.len() >= self.capacity {
            self.evict_one(&mut inner).await;
        }

        let entry = Arc::new(CacheEntry::new(fp));
        inner.entries.insert(fp, entry.clone());
        inner.order.push_back(fp);
        entry
    }

    pub async fn evict(&self, fp: Fingerprint) {
        let mut inner = self.inner.lock().await;
        inner.entries.remove(&fp);
        inner.order.retain(|k| *k != fp);
    }

    /// Sweeps expired entries. Lazy expiry (checked on access) is the
    /// primary mechanism per spec.md §3; this is the optional background
    /// complement mentioned in spec.md §4.2.
    pub async fn sweep(&self) {
        let mut inner = self.inner.lock().await;
        let mut expired = Vec::new();
        for (&fp, entry) in inner.entries.iter() {
            if entry.has_waiters().await {
                continue;
            }
            if entry.is_fetching().await {
                continue;
            }
            let created_at = entry.created_at().await;
            // an entry with created_at == 0 was never populated; leave it
            if created_at != 0 && now_secs() >= created_at {
                let status = entry.status().await;
                if matches!(status, super::entry::CacheStatus::Initial) {
                    expired.push(fp);
                }
            }
        }
        for fp in expired {
            inner.entries.remove(&fp);
            inner.order.retain(|k| *k != fp);
        }
    }

    fn touch(order: &mut VecDeque<Fingerprint>, fp: Fingerprint) {
        if let Some(pos) = order.iter().position(|k| *k == fp) {
            order.remove(pos);
        }
        order.push_back(fp);
    }

    /// Evicts the least-recently-used entry whose status != Fetching, FIFO
    /// tie-break among equally-aged entries (the `order` deque is already
    /// FIFO-ordered front-to-back). Never evicts an entry with non-empty
    /// waiters. If every entry is Fetching, the oldest Fetching entry is
    /// evicted only once it exceeds the watchdog threshold; otherwise the
    /// zone is allowed to grow by one over capacity rather than corrupt an
    /// in-flight fetch (spec.md §3).
    async fn evict_one(&self, inner: &mut Inner) {
        let mut stuck_candidate: Option<Fingerprint> = None;

        for &fp in inner.order.iter() {
            let Some(entry) = inner.entries.get(&fp) else {
                continue;
            };
            if entry.has_waiters().await {
                continue;
            }
            if !entry.is_fetching().await {
                inner.entries.remove(&fp);
                inner.order.retain(|k| *k != fp);
                return;
            }
            let created_at = entry.created_at().await;
            let age = now_secs().saturating_sub(created_at);
            if age >= self.watchdog_threshold_secs && stuck_candidate.is_none() {
                stuck_candidate = Some(fp);
            }
        }

        if let Some(fp) = stuck_candidate {
            inner.entries.remove(&fp);
            inner.order.retain(|k| *k != fp);
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_or_create_inserts_and_marks_mru() {
        let zone = Zone::new(2, 10);
        let a = zone.find_or_create(1).await;
        let b = zone.find_or_create(1).await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(1, zone.len().await);
    }

    #[tokio::test]
    async fn test_eviction_skips_fetching_entries() {
        let zone = Zone::new(1, 10);
        let fetching = zone.find_or_create(1).await;
        // put it into Fetching
        let _ = fetching.acquire().await;

        // a second key forces eviction, but the only entry is Fetching with
        // a fresh created_at, so the zone temporarily grows.
        let _ = zone.find_or_create(2).await;
        assert_eq!(2, zone.len().await);
    }

    #[tokio::test]
    async fn test_eviction_of_idle_entry_on_overflow() {
        let zone = Zone::new(1, 10);
        let first = zone.find_or_create(1).await;
        // leave `first` in Initial (idle, evictable)
        drop(first);

        let _ = zone.find_or_create(2).await;
        assert_eq!(1, zone.len().await);
    }

    #[tokio::test]
    async fn test_evict_removes_entry() {
        let zone = Zone::new(4, 10);
        zone.find_or_create(1).await;
        zone.evict(1).await;
        assert_eq!(0, zone.len().await);
    }
}
