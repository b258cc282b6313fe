//! Dispatcher (spec.md §4, §5): an N-way sharded collection of Zones.
//!
//! Grounded on `examples/original_source/cache/cache.go` (`NewDispatcher`,
//! `GetHTTPCache`): Z zones by default, `zone_index = fingerprint mod Z`,
//! each zone independently synchronized with no global cache lock. The
//! Dispatcher itself is process-wide and shared read-only after
//! construction (spec.md §9) — config reload builds a new `Dispatcher` and
//! atomically swaps the pointer held by callers, rather than mutating one
//! in place.

use std::sync::Arc;

use super::entry::CacheEntry;
use super::fingerprint::Fingerprint;
use super::zone::Zone;

pub const DEFAULT_ZONE_COUNT: usize = 10;
pub const DEFAULT_ZONE_CAPACITY: usize = 1024;
pub const DEFAULT_HIT_FOR_PASS_TTL: u16 = 300;

pub struct Dispatcher {
    zones: Vec<Zone>,
    pub hit_for_pass_ttl: u16,
}

impl Dispatcher {
    pub fn new(zone_count: usize, zone_capacity: usize, hit_for_pass_ttl: u16, fetch_timeout_secs: u64) -> Self {
        let zone_count = zone_count.max(1);
        let zones = (0..zone_count)
            .map(|_| Zone::new(zone_capacity, fetch_timeout_secs))
            .collect();
        Self {
            zones,
            hit_for_pass_ttl,
        }
    }

    fn zone_index(&self, fp: Fingerprint) -> usize {
        (fp % self.zones.len() as u64) as usize
    }

    pub async fn get(&self, fp: Fingerprint) -> Arc<CacheEntry> {
        let index = self.zone_index(fp);
        self.zones[index].find_or_create(fp).await
    }

    pub async fn sweep_all(&self) {
        for zone in &self.zones {
            zone.sweep().await;
        }
    }

    /// Occupancy per zone, used by the admin status endpoint.
    pub async fn zone_occupancy(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.zones.len());
        for zone in &self.zones {
            out.push(zone.len().await);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_same_fingerprint_same_zone() {
        let dispatcher = Dispatcher::new(4, 16, 300, 10);
        let a = dispatcher.get(42).await;
        let b = dispatcher.get(42).await;
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_zone_index_is_modulo() {
        let dispatcher = Dispatcher::new(4, 16, 300, 10);
        assert_eq!(0, dispatcher.zone_index(0));
        assert_eq!(1, dispatcher.zone_index(5));
        assert_eq!(2, dispatcher.zone_index(6));
    }
}
