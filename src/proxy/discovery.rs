//! Backend discovery for upstream servers (spec.md §6 upstreams[].servers).
//!
//! Grounded on `HybridDiscovery`/`DnsDiscovery` in the teacher's original
//! `proxy/discovery.rs`: an address that parses as an IP is registered as a
//! static backend; an address that doesn't is resolved via DNS and
//! refreshed on every `discover()` poll. Simplified from the teacher in one
//! respect — Pike's upstream schema carries no scheme field (spec.md §6
//! lists only `addr`, `backup`, `weight`, `health_check_path`), so every
//! backend is plain HTTP; this is a deliberate drop, recorded in
//! DESIGN.md, not an oversight.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use hickory_resolver::TokioAsyncResolver;
use once_cell::sync::OnceCell;
use pingora::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType::InternalError, OrErr, Result};
use pingora_load_balancing::{
    discovery::{ServiceDiscovery, Static},
    Backend,
};

use crate::config::UpstreamServer;

static GLOBAL_RESOLVER: OnceCell<Arc<TokioAsyncResolver>> = OnceCell::new();

fn get_global_resolver() -> Arc<TokioAsyncResolver> {
    GLOBAL_RESOLVER
        .get_or_init(|| {
            Arc::new(
                TokioAsyncResolver::tokio_from_system_conf()
                    .expect("system DNS configuration must be readable"),
            )
        })
        .clone()
}

/// Resolves a single hostname to its current address set on every poll.
pub struct DnsDiscovery {
    resolver: Arc<TokioAsyncResolver>,
    name: String,
    port: u16,
    weight: usize,
}

impl DnsDiscovery {
    pub fn new(name: String, port: u16, weight: usize, resolver: Arc<TokioAsyncResolver>) -> Self {
        Self {
            resolver,
            name,
            port,
            weight,
        }
    }
}

#[async_trait]
impl ServiceDiscovery for DnsDiscovery {
    async fn discover(&self) -> Result<(BTreeSet<Backend>, HashMap<u64, bool>)> {
        let name = self.name.as_str();
        log::debug!("resolving DNS for upstream host {name}");

        let backends = self
            .resolver
            .lookup_ip(name)
            .await
            .or_err_with(InternalError, || format!("DNS discovery failed for {name}"))?
            .iter()
            .map(|ip| {
                let addr = SocketAddr::new(ip, self.port).to_string();
                let mut backend = Backend::new(&addr).expect("resolved socket addr is valid");
                backend.weight = self.weight;
                let peer = HttpPeer::new(&addr, false, self.name.clone());
                assert!(backend.ext.insert::<HttpPeer>(peer).is_none());
                backend
            })
            .collect();
        Ok((backends, HashMap::new()))
    }
}

/// Combines static-IP backends with zero or more DNS-resolved hostnames
/// into a single discovery source for one `servers[]` list.
#[derive(Default)]
pub struct HybridDiscovery {
    discoveries: Vec<Box<dyn ServiceDiscovery + Send + Sync>>,
}

#[async_trait]
impl ServiceDiscovery for HybridDiscovery {
    async fn discover(&self) -> Result<(BTreeSet<Backend>, HashMap<u64, bool>)> {
        let mut backends = BTreeSet::new();
        let mut health_checks = HashMap::new();

        let futures = self.discoveries.iter().map(|discovery| async move {
            discovery.discover().await.map_err(|e| {
                log::warn!("upstream discovery failed: {e}");
                e
            })
        });

        for (part_backends, part_health_checks) in join_all(futures).await.into_iter().flatten() {
            backends.extend(part_backends);
            health_checks.extend(part_health_checks);
        }

        Ok((backends, health_checks))
    }
}

impl HybridDiscovery {
    /// Builds discovery for one subset of an upstream's servers (either its
    /// primary servers or its `backup: true` servers).
    pub fn from_servers(servers: &[UpstreamServer]) -> Result<Self> {
        let mut this = Self::default();
        let mut static_backends = BTreeSet::new();

        for server in servers {
            let (host, port) = parse_host_and_port(&server.addr)?;
            let port = port.unwrap_or(80);

            if let Ok(ip) = host.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
                let addr = SocketAddr::new(ip, port).to_string();
                let mut backend = Backend::new(&addr).or_err_with(InternalError, || {
                    format!("invalid upstream address {addr}")
                })?;
                backend.weight = server.weight as usize;
                let peer = HttpPeer::new(&addr, false, host.clone());
                assert!(backend.ext.insert::<HttpPeer>(peer).is_none());
                static_backends.insert(backend);
            } else {
                this.discoveries.push(Box::new(DnsDiscovery::new(
                    host,
                    port,
                    server.weight as usize,
                    get_global_resolver(),
                )));
            }
        }

        if !static_backends.is_empty() {
            this.discoveries.push(Static::new(static_backends));
        }

        Ok(this)
    }
}

/// Splits `host:port` (or `[ipv6]:port`), defaulting the port to `None`.
fn parse_host_and_port(addr: &str) -> Result<(String, Option<u16>)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| Error::explain(InternalError, "unterminated IPv6 literal"))?;
        let port = match rest.strip_prefix(':') {
            Some(p) => Some(p.parse::<u16>().or_err_with(InternalError, || "invalid port")?),
            None => None,
        };
        return Ok((format!("[{host}]"), port));
    }

    match addr.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            let port = port.parse::<u16>().or_err_with(InternalError, || "invalid port")?;
            Ok((host.to_string(), Some(port)))
        }
        _ => Ok((addr.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::parse_host_and_port;

    #[test]
    fn test_parse_plain_host_and_port() {
        assert_eq!(
            ("example.com".to_string(), Some(80)),
            parse_host_and_port("example.com:80").unwrap()
        );
    }

    #[test]
    fn test_parse_host_without_port() {
        assert_eq!(
            ("127.0.0.1".to_string(), None),
            parse_host_and_port("127.0.0.1").unwrap()
        );
    }

    #[test]
    fn test_parse_ipv6_with_port() {
        assert_eq!(
            ("[::1]".to_string(), Some(8080)),
            parse_host_and_port("[::1]:8080").unwrap()
        );
    }
}
