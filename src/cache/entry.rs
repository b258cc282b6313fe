//! CacheEntry state machine (spec.md §4.3): per-key single-flight
//! coordination plus variant storage.
//!
//! No teacher analog — pingsix has no response cache of its own. The state
//! set and transition table are grounded on
//! `examples/original_source/cache/cache.go`'s `HTTPCache`/`HTTPCacheLRU`,
//! and the waiter primitive follows spec.md §9's requirement for a one-shot
//! broadcast with subscribe-before-release ordering: `acquire` calls
//! `Notify::notified()` — which registers itself — while still holding the
//! entry's mutex, then drops the lock and awaits, all inside the same call.
//! No waiter can miss a wakeup because it is registered before the fetcher
//! can possibly release the lock and call `notify_waiters()`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::HeaderMap;
use tokio::sync::{Mutex, Notify};

use super::fingerprint::Fingerprint;
use super::variant::Variant;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    Initial,
    Fetching,
    Cacheable,
    HitForPass,
}

#[derive(Clone, Debug, Default)]
pub struct ResponseMeta {
    pub status_code: u16,
    pub headers: HeaderMap,
}

/// The result a fetcher publishes into an entry when a fetch completes.
pub struct FetchOutcome {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub ttl: u16,
    pub cacheable: bool,
    pub body: Bytes,
    pub body_encoding: super::variant::Encoding,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

struct Inner {
    status: CacheStatus,
    created_at: u64,
    ttl: u16,
    response_meta: ResponseMeta,
    variant: Option<Variant>,
    waiter_count: usize,
}

/// A single key's cache state: state machine, TTL, and variant storage.
/// Holds no reference back to its owning `Zone` (spec.md §9).
pub struct CacheEntry {
    pub key: Fingerprint,
    inner: Mutex<Inner>,
    notify: Notify,
}

/// The outcome of acquiring an entry: either the caller must fetch, or the
/// caller can serve directly from cache. `acquire` never returns while the
/// entry is `Fetching` — it waits out the in-flight fetch internally and
/// re-checks, so by the time it returns the entry has reached one of these
/// three terminal states for this caller.
pub enum Acquire {
    /// This caller won the race and must perform the upstream fetch.
    BecomeFetcher,
    /// The entry is `Cacheable` and fresh; safe to serve now.
    Hit,
    /// The entry is `HitForPass` and not yet expired: bypass the cache,
    /// fetch independently, do not register as a waiter.
    Bypass,
}

impl CacheEntry {
    pub fn new(key: Fingerprint) -> Self {
        Self {
            key,
            inner: Mutex::new(Inner {
                status: CacheStatus::Initial,
                created_at: 0,
                ttl: 0,
                response_meta: ResponseMeta::default(),
                variant: None,
                waiter_count: 0,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn status(&self) -> CacheStatus {
        self.effective_status(&mut *self.inner.lock().await)
    }

    fn effective_status(&self, inner: &mut Inner) -> CacheStatus {
        let expired = now_secs() >= inner.created_at.saturating_add(inner.ttl as u64);
        match inner.status {
            CacheStatus::Cacheable if expired => {
                inner.status = CacheStatus::Initial;
                inner.variant = None;
                CacheStatus::Initial
            }
            CacheStatus::HitForPass if expired => {
                inner.status = CacheStatus::Initial;
                CacheStatus::Initial
            }
            other => other,
        }
    }

    /// Acquires the entry and decides what the caller should do. While the
    /// entry is `Fetching`, this registers for the next `notify_waiters()`
    /// call — by calling `self.notify.notified()` before the lock guard is
    /// dropped — then awaits that same future and re-checks status, looping
    /// until it lands on a terminal state. Registering under the lock is
    /// what closes the race: `complete`/`fail` can only call
    /// `notify_waiters()` after acquiring the same lock, so they can never
    /// run between "decide to wait" and "subscribe".
    pub async fn acquire(self: &Arc<Self>) -> Acquire {
        loop {
            let mut inner = self.inner.lock().await;
            match self.effective_status(&mut inner) {
                CacheStatus::Initial => {
                    inner.status = CacheStatus::Fetching;
                    inner.variant = None;
                    return Acquire::BecomeFetcher;
                }
                CacheStatus::Fetching => {
                    inner.waiter_count += 1;
                    let notified = self.notify.notified();
                    drop(inner);
                    notified.await;
                }
                CacheStatus::Cacheable => return Acquire::Hit,
                CacheStatus::HitForPass => return Acquire::Bypass,
            }
        }
    }

    /// Called by the fetcher on success. Transitions Fetching → Cacheable
    /// or Fetching → HitForPass depending on `outcome.cacheable`, stores the
    /// variant, and wakes all waiters — who all observe the same, fully
    /// published variant (spec.md §5 ordering guarantee).
    pub async fn complete(&self, outcome: FetchOutcome, hit_for_pass_ttl: u16) {
        let mut inner = self.inner.lock().await;
        inner.created_at = now_secs();
        inner.response_meta = ResponseMeta {
            status_code: outcome.status_code,
            headers: outcome.headers,
        };

        if outcome.cacheable && outcome.ttl > 0 {
            inner.ttl = outcome.ttl;
            inner.status = CacheStatus::Cacheable;
            let mut variant = Variant::default();
            match outcome.body_encoding {
                super::variant::Encoding::Identity => variant.identity = Some(outcome.body),
                super::variant::Encoding::Gzip => variant.gzip = Some(outcome.body),
                super::variant::Encoding::Brotli => variant.brotli = Some(outcome.body),
            }
            inner.variant = Some(variant);
        } else {
            inner.ttl = hit_for_pass_ttl;
            inner.status = CacheStatus::HitForPass;
            inner.variant = None;
        }

        inner.waiter_count = 0;
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Called by the fetcher on failure (timeout, network error, unsupported
    /// encoding). Reverts to Initial and wakes waiters, who must themselves
    /// retry and race to become the new fetcher.
    pub async fn fail(&self) {
        let mut inner = self.inner.lock().await;
        inner.status = CacheStatus::Initial;
        inner.variant = None;
        inner.waiter_count = 0;
        drop(inner);
        self.notify.notify_waiters();
    }

    pub async fn has_waiters(&self) -> bool {
        self.inner.lock().await.waiter_count > 0
    }

    pub async fn is_fetching(&self) -> bool {
        matches!(self.inner.lock().await.status, CacheStatus::Fetching)
    }

    pub async fn created_at(&self) -> u64 {
        self.inner.lock().await.created_at
    }

    pub async fn snapshot(&self) -> (ResponseMeta, Option<Variant>) {
        let inner = self.inner.lock().await;
        (inner.response_meta.clone(), inner.variant.clone())
    }

    /// Writes a lazily-derived encoding back onto the stored variant, so a
    /// later hit for the same encoding (or a third encoding derived from
    /// identity) doesn't recompute it (spec.md §9). A no-op once the entry
    /// has moved past `Cacheable` (expired, evicted, or never cacheable to
    /// begin with) — there is nothing left to memoize into.
    pub async fn memoize_variant(&self, encoding: super::variant::Encoding, bytes: Bytes) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.status, CacheStatus::Cacheable) {
            return;
        }
        let Some(variant) = inner.variant.as_mut() else {
            return;
        };
        match encoding {
            super::variant::Encoding::Identity => variant.identity = Some(bytes),
            super::variant::Encoding::Gzip => variant.gzip = Some(bytes),
            super::variant::Encoding::Brotli => variant.brotli = Some(bytes),
        }
    }
}

/// A handle returned by `Zone::find_or_create`, shared between the caller
/// and the zone's table.
pub type EntryHandle = Arc<CacheEntry>;

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_caller_becomes_fetcher() {
        let entry = Arc::new(CacheEntry::new(1));
        match entry.acquire().await {
            Acquire::BecomeFetcher => {}
            _ => panic!("expected BecomeFetcher"),
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_wait() {
        let entry = Arc::new(CacheEntry::new(1));
        assert!(matches!(entry.acquire().await, Acquire::BecomeFetcher));

        let waiter_entry = entry.clone();
        let waiter = tokio::spawn(async move { waiter_entry.acquire().await });

        // give the waiter a chance to reach the Fetching branch and
        // register as a waiter before this task observes it.
        tokio::task::yield_now().await;
        assert!(entry.has_waiters().await);

        entry
            .complete(
                FetchOutcome {
                    status_code: 200,
                    headers: HeaderMap::new(),
                    ttl: 60,
                    cacheable: true,
                    body: Bytes::from_static(b"hello"),
                    body_encoding: super::super::variant::Encoding::Identity,
                },
                300,
            )
            .await;

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("acquire() must not hang after complete() wakes waiters")
            .unwrap();
        assert!(matches!(outcome, Acquire::Hit));
    }

    /// Regression test for the lost-wakeup race: a waiter that is about to
    /// call `acquire()` must not miss a `complete()` that races in right
    /// after it observes `Fetching`. Bounded by `timeout` so a regression
    /// fails the test instead of hanging the suite.
    #[tokio::test]
    async fn test_waiter_does_not_miss_notification_under_contention() {
        let entry = Arc::new(CacheEntry::new(1));
        assert!(matches!(entry.acquire().await, Acquire::BecomeFetcher));

        let waiter_entry = entry.clone();
        let waiter = tokio::spawn(async move { waiter_entry.acquire().await });

        entry
            .complete(
                FetchOutcome {
                    status_code: 200,
                    headers: HeaderMap::new(),
                    ttl: 60,
                    cacheable: true,
                    body: Bytes::from_static(b"hello"),
                    body_encoding: super::super::variant::Encoding::Identity,
                },
                300,
            )
            .await;

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("acquire() must not hang")
            .unwrap();
        assert!(matches!(outcome, Acquire::Hit));
    }

    #[tokio::test]
    async fn test_non_cacheable_becomes_hit_for_pass() {
        let entry = Arc::new(CacheEntry::new(1));
        assert!(matches!(entry.acquire().await, Acquire::BecomeFetcher));
        entry
            .complete(
                FetchOutcome {
                    status_code: 200,
                    headers: HeaderMap::new(),
                    ttl: 0,
                    cacheable: false,
                    body: Bytes::new(),
                    body_encoding: super::super::variant::Encoding::Identity,
                },
                300,
            )
            .await;
        assert_eq!(CacheStatus::HitForPass, entry.status().await);
    }

    #[tokio::test]
    async fn test_failed_fetch_reverts_to_initial() {
        let entry = Arc::new(CacheEntry::new(1));
        assert!(matches!(entry.acquire().await, Acquire::BecomeFetcher));
        entry.fail().await;
        assert_eq!(CacheStatus::Initial, entry.status().await);
    }

    #[tokio::test]
    async fn test_expired_cacheable_is_treated_as_initial() {
        let entry = Arc::new(CacheEntry::new(1));
        assert!(matches!(entry.acquire().await, Acquire::BecomeFetcher));
        entry
            .complete(
                FetchOutcome {
                    status_code: 200,
                    headers: HeaderMap::new(),
                    ttl: 0, // already-expired window for the test
                    cacheable: true,
                    body: Bytes::from_static(b"hi"),
                    body_encoding: super::super::variant::Encoding::Identity,
                },
                300,
            )
            .await;
        // ttl=0 and cacheable=true is treated as hit-for-pass by `complete`
        // (see `Fetching -> HitForPass` transition when ttl = 0); to test
        // genuine expiry we force the non-zero-ttl branch then rewind time
        // is not directly controllable, so this test instead checks the
        // observable contract: an entry with ttl=0 never serves as a hit.
        assert_ne!(CacheStatus::Cacheable, entry.status().await);
    }
}
