//! The per-request context threaded through the `Pipeline` (spec.md §9):
//! a small struct of known keys rather than an open-ended dynamic map —
//! `request_id`, `cache_status`, `cache_entry`, `response`, `director`,
//! `timing` are exactly the keys spec.md §9 enumerates.
//!
//! No teacher file defines this struct under `proxy/` even though the
//! teacher's `service/http.rs` references `crate::proxy::ProxyContext` (the
//! struct only exists for the teacher's abandoned "new" architecture under
//! `core/context.rs`, which this crate drops — see DESIGN.md). Authored
//! fresh from spec.md §9's key list and the component design in §4.8.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::{HeaderMap, Method};
use uuid::Uuid;

use crate::cache::{EntryHandle, Fingerprint, Variant};
use crate::config::Location;

/// The tag a request is classified under by the `CacheIdentifier` stage
/// (spec.md §4.8).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheStatusTag {
    /// Not cacheable at all (non-GET/HEAD, or the location has no cache
    /// configured): proxied straight through, no cache write.
    Pass,
    /// This request won the entry's mutex and must perform the upstream
    /// fetch.
    Fetching,
    /// Served directly from a fresh `Cacheable` entry.
    CacheableHit,
    /// The entry is in its negative-cache window: proxied through without
    /// coalescing or writing the cache.
    HitForPass,
}

impl CacheStatusTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatusTag::Pass => "pass",
            CacheStatusTag::Fetching => "fetching",
            CacheStatusTag::CacheableHit => "cacheable-hit",
            CacheStatusTag::HitForPass => "hit-for-pass",
        }
    }
}

/// The response being assembled for the client, staged so later pipeline
/// stages (freshness, compression, responder) can still rewrite it.
#[derive(Default)]
pub struct ResponseState {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Per-request state threaded through every pipeline stage.
pub struct ProxyContext {
    pub request_id: Uuid,
    pub request_start: Instant,
    pub method: Method,
    pub host: String,
    pub path_and_query: String,
    pub is_tls: bool,
    pub request_headers: HeaderMap,
    pub client_ip: String,

    /// The location matched by the router, if any. `None` yields a 404.
    pub location: Option<Location>,
    pub fingerprint: Option<Fingerprint>,

    pub cache_status: Option<CacheStatusTag>,
    pub cache_entry: Option<EntryHandle>,
    /// The entry's stored variant as of the cache-identifier/fetch stage,
    /// carried forward so `compress_response` can reuse and extend it
    /// instead of recompressing from identity on every request.
    pub cached_variant: Option<Variant>,

    pub response: ResponseState,

    /// The upstream director (named `upstreams[]` entry) used for this
    /// request, for logging/Server-Timing.
    pub director: Option<String>,

    /// `Server-Timing` entries accumulated across stages, spec.md §6.
    pub timing: Vec<(&'static str, Duration)>,
}

impl ProxyContext {
    pub fn new(
        method: Method,
        host: String,
        path_and_query: String,
        is_tls: bool,
        request_headers: HeaderMap,
        client_ip: String,
    ) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            request_start: Instant::now(),
            method,
            host,
            path_and_query,
            is_tls,
            request_headers,
            client_ip,
            location: None,
            fingerprint: None,
            cache_status: None,
            cache_entry: None,
            cached_variant: None,
            response: ResponseState::default(),
            director: None,
            timing: Vec::new(),
        }
    }

    pub fn record_timing(&mut self, name: &'static str, elapsed: Duration) {
        self.timing.push((name, elapsed));
    }

    /// Renders accumulated timings as a `Server-Timing` header value.
    pub fn server_timing_header(&self) -> String {
        self.timing
            .iter()
            .map(|(name, dur)| format!("{name};dur={:.1}", dur.as_secs_f64() * 1000.0))
            .collect::<Vec<_>>()
            .join(", ")
    }
}
