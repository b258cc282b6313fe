//! UpstreamSelector (spec.md §4.7, §6): backend selection for one
//! `upstreams[]` entry.
//!
//! Grounded on the teacher's `ProxyUpstream`/`SelectionLB` pattern in
//! `proxy/upstream.rs`: a background health-check service owns the
//! `LoadBalancer`, and selection degrades from primary servers to
//! `backup: true` servers when no primary backend is healthy. Trimmed from
//! the teacher's four selection policies (`RoundRobin`, `Random`, `Fnv`,
//! `Ketama`) down to the two spec.md §4.7 names: `roundRobin` (default) and
//! `first` (always prefer the first healthy server in listed order).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use once_cell::sync::Lazy;
use pingora::services::background::background_service;
use pingora_core::services::Service;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::Result;
use pingora_load_balancing::{
    health_check::{HttpHealthCheck, TcpHealthCheck},
    selection::{BackendIter, BackendSelection, RoundRobin},
    Backend, Backends, LoadBalancer,
};
use pingora_runtime::Runtime;
use tokio::sync::watch;

use crate::config::{UpstreamConfig, UpstreamPolicy, UpstreamServer};

use super::discovery::HybridDiscovery;

static UPSTREAM_MAP: Lazy<RwLock<HashMap<String, Arc<UpstreamSelector>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

pub fn load_upstreams(upstreams: &[UpstreamConfig], work_stealing: bool) -> Result<()> {
    let mut map = UPSTREAM_MAP
        .write()
        .expect("upstream map lock should never be poisoned");

    for upstream in upstreams {
        log::info!("configuring upstream: {}", upstream.name);
        let mut selector = UpstreamSelector::try_from(upstream.clone())?;
        selector.start_health_check(work_stealing);
        map.insert(upstream.name.clone(), Arc::new(selector));
    }

    Ok(())
}

pub fn upstream_fetch(name: &str) -> Option<Arc<UpstreamSelector>> {
    UPSTREAM_MAP
        .read()
        .expect("upstream map lock should never be poisoned")
        .get(name)
        .cloned()
}

/// An in-flight-selectable set of backends, built from one `ProxyLB`
/// (primary servers) and an optional second one built from `backup: true`
/// servers.
pub struct UpstreamSelector {
    name: String,
    primary: ProxyLB,
    backup: Option<ProxyLB>,
}

impl TryFrom<UpstreamConfig> for UpstreamSelector {
    type Error = Box<pingora_error::Error>;

    fn try_from(value: UpstreamConfig) -> Result<Self> {
        let (primary_servers, backup_servers): (Vec<_>, Vec<_>) =
            value.servers.into_iter().partition(|s| !s.backup);

        let primary = ProxyLB::new(&primary_servers, &value.policy)?;
        let backup = if backup_servers.is_empty() {
            None
        } else {
            Some(ProxyLB::new(&backup_servers, &value.policy)?)
        };

        Ok(Self {
            name: value.name,
            primary,
            backup,
        })
    }
}

impl UpstreamSelector {
    pub fn start_health_check(&mut self, work_stealing: bool) {
        self.primary.start_health_check(work_stealing);
        if let Some(backup) = &mut self.backup {
            backup.start_health_check(work_stealing);
        }
    }

    /// Selects one backend, preferring a healthy primary server and
    /// degrading to the backup pool only when the primary pool has none
    /// available (spec.md §4.7).
    pub fn select_backend(&self, selection_key: &[u8]) -> Option<Backend> {
        self.primary
            .select(selection_key)
            .or_else(|| self.backup.as_ref().and_then(|b| b.select(selection_key)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One policy-selected `LoadBalancer` plus the background service that
/// drives its health checks, grounded on the teacher's `LB<BS>`.
enum ProxyLB {
    RoundRobin {
        upstreams: Arc<LoadBalancer<RoundRobin>>,
        service: Option<Box<dyn Service + 'static>>,
        runtime: Option<Runtime>,
        watch: Option<watch::Sender<bool>>,
    },
    First {
        upstreams: Arc<LoadBalancer<FirstAvailable>>,
        service: Option<Box<dyn Service + 'static>>,
        runtime: Option<Runtime>,
        watch: Option<watch::Sender<bool>>,
    },
}

impl ProxyLB {
    fn new(servers: &[UpstreamServer], policy: &UpstreamPolicy) -> Result<Self> {
        let discovery = HybridDiscovery::from_servers(servers)?;
        let health_check_path = servers.iter().find_map(|s| s.health_check_path.clone());

        Ok(match policy {
            UpstreamPolicy::RoundRobin => {
                let mut lb = LoadBalancer::<RoundRobin>::from_backends(Backends::new(Box::new(discovery)));
                apply_health_check(&mut lb, health_check_path);
                let background = background_service("upstream health check", lb);
                ProxyLB::RoundRobin {
                    upstreams: background.task(),
                    service: Some(Box::new(background)),
                    runtime: None,
                    watch: None,
                }
            }
            UpstreamPolicy::First => {
                let mut lb = LoadBalancer::<FirstAvailable>::from_backends(Backends::new(Box::new(discovery)));
                apply_health_check(&mut lb, health_check_path);
                let background = background_service("upstream health check", lb);
                ProxyLB::First {
                    upstreams: background.task(),
                    service: Some(Box::new(background)),
                    runtime: None,
                    watch: None,
                }
            }
        })
    }

    fn start_health_check(&mut self, work_stealing: bool) {
        let (service_slot, runtime_slot, watch_slot) = match self {
            ProxyLB::RoundRobin { service, runtime, watch, .. } => (service, runtime, watch),
            ProxyLB::First { service, runtime, watch, .. } => (service, runtime, watch),
        };

        let Some(mut service) = service_slot.take() else {
            return;
        };

        let (tx, rx) = watch::channel(false);
        *watch_slot = Some(tx);

        let threads = service.threads().unwrap_or(1);
        let runtime = if work_stealing {
            Runtime::new_steal(threads, service.name())
        } else {
            Runtime::new_no_steal(threads, service.name())
        };

        runtime.get_handle().spawn(async move {
            service.start_service(None, rx).await;
            log::info!("upstream health check service exited");
        });

        *runtime_slot = Some(runtime);
    }

    fn select(&self, selection_key: &[u8]) -> Option<Backend> {
        let mut backend = match self {
            ProxyLB::RoundRobin { upstreams, .. } => upstreams.select(selection_key, 256),
            ProxyLB::First { upstreams, .. } => upstreams.select(selection_key, 256),
        };
        if let Some(b) = backend.as_mut() {
            if let Some(peer) = b.ext.get_mut::<HttpPeer>() {
                peer.options.connection_timeout = Some(Duration::from_secs(2));
            }
        }
        backend
    }
}

impl Drop for ProxyLB {
    fn drop(&mut self) {
        let watch = match self {
            ProxyLB::RoundRobin { watch, .. } => watch,
            ProxyLB::First { watch, .. } => watch,
        };
        if let Some(tx) = watch.take() {
            let _ = tx.send(true);
        }
    }
}

fn apply_health_check<BS: BackendSelection>(lb: &mut LoadBalancer<BS>, health_check_path: Option<String>) {
    match health_check_path {
        Some(path) => {
            let mut check = HttpHealthCheck::new("upstream", false);
            check.req.set_uri(
                http::Uri::try_from(path.as_str()).unwrap_or_else(|_| http::Uri::from_static("/")),
            );
            lb.set_health_check(Box::new(check));
        }
        None => lb.set_health_check(Box::new(TcpHealthCheck::new_v4())),
    }
    lb.health_check_frequency = Some(Duration::from_secs(5));
}

/// Deterministic "first healthy server in listed order" selection.
/// Grounded on the shape of `pingora_load_balancing::selection::RoundRobin`
/// but ignoring the selection key entirely: `LoadBalancer::select` already
/// skips backends its health checker marked unhealthy, so a fixed iteration
/// order is sufficient to implement spec.md §4.7's `first` policy.
pub struct FirstAvailable {
    backends: Arc<Vec<Backend>>,
}

impl BackendSelection for FirstAvailable {
    type Iter = FirstAvailableIter;

    fn build(backends: &std::collections::BTreeSet<Backend>) -> Self {
        FirstAvailable {
            backends: Arc::new(backends.iter().cloned().collect()),
        }
    }

    fn iter(self: &Arc<Self>, _key: &[u8]) -> Self::Iter {
        FirstAvailableIter {
            backends: self.backends.clone(),
            index: 0,
        }
    }
}

pub struct FirstAvailableIter {
    backends: Arc<Vec<Backend>>,
    index: usize,
}

impl BackendIter for FirstAvailableIter {
    fn next(&mut self) -> Option<&Backend> {
        let backend = self.backends.get(self.index);
        self.index += 1;
        backend
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_first_available_iterates_in_listed_order() {
        let mut set = BTreeSet::new();
        set.insert(Backend::new("127.0.0.1:1").unwrap());
        set.insert(Backend::new("127.0.0.1:2").unwrap());
        let selection = Arc::new(FirstAvailable::build(&set));
        let mut iter = selection.iter(b"ignored");
        assert!(iter.next().is_some());
        assert!(iter.next().is_some());
        assert!(iter.next().is_none());
    }
}
