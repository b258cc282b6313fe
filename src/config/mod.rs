pub mod etcd;

use std::{
    collections::{HashMap, HashSet},
    fs,
    net::SocketAddr,
};

use once_cell::sync::Lazy;
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

// Pre-compiled regex for upstream server address validation, to avoid
// per-request compilation cost (there is none on this path, but it mirrors
// the one config-time regex the config module is allowed per spec.md's
// "no regex on the request path" design note).
static ADDR_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^(?:(?:\d{1,3}\.){3}\d{1,3}|\[[0-9a-f:]+\]|[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*)(?::\d+)?$"
    ).expect("invalid regex pattern for address validation")
});

/// Enables uniform name handling across configuration entities for
/// uniqueness validation.
pub trait Identifiable {
    fn name(&self) -> &str;
}

macro_rules! impl_identifiable {
    ($type:ty) => {
        impl Identifiable for $type {
            fn name(&self) -> &str {
                &self.name
            }
        }
    };
}

impl_identifiable!(Server);
impl_identifiable!(CacheConfig);
impl_identifiable!(CompressConfig);
impl_identifiable!(UpstreamConfig);
impl_identifiable!(Location);

/// Root configuration structure combining Pingora framework config with
/// Pike's own schema (spec.md §6).
#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    /// Pingora framework configuration (workers, daemonization, etc.) —
    /// out of scope for the data-plane core, consumed as-is by the CLI
    /// bootstrap.
    #[serde(default)]
    pub pingora: ServerConf,

    /// Async file logging destination. Ambient (not part of spec.md's
    /// external schema, carried regardless per the Non-goals rule that
    /// ambient concerns are never dropped).
    #[validate(nested)]
    pub log: Option<Log>,

    #[validate(nested)]
    pub admin: Option<Admin>,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub servers: Vec<Server>,

    #[validate(nested)]
    #[serde(default)]
    pub caches: Vec<CacheConfig>,

    #[validate(nested)]
    #[serde(default)]
    pub compresses: Vec<CompressConfig>,

    #[validate(nested)]
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    #[validate(nested)]
    #[serde(default)]
    pub locations: Vec<Location>,
}

impl Config {
    /// Loads configuration from a YAML file with full validation.
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path)
            .or_err_with(ReadError, || format!("unable to read conf file from {path}"))?;
        log::debug!("conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    /// Loads configuration from either an `etcd://` URL or a plain file
    /// path, symmetrically (spec.md §9 Open Question), applying CLI
    /// overrides afterward.
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        let path = opt
            .conf
            .as_ref()
            .ok_or_else(|| Error::explain(ReadError, "no --conf path specified"))?;

        let mut conf = if etcd::is_etcd_url(path) {
            etcd::EtcdConfigSource::parse(path)
                .and_then(|source| futures::executor::block_on(source.load()))?
        } else {
            Self::load_from_yaml(path)?
        };

        conf.merge_with_opt(opt);
        Ok(conf)
    }

    /// Parses and validates a YAML configuration string.
    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        log::trace!("read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str)
            .or_err_with(ReadError, || format!("unable to parse yaml conf {conf_str}"))?;

        conf.validate()
            .or_err_with(FileReadError, || "conf file validation failed")?;

        Self::validate_unique_names(&conf.servers, "server")
            .or_err_with(FileReadError, || "server name validation failed")?;
        Self::validate_unique_names(&conf.caches, "cache")
            .or_err_with(FileReadError, || "cache name validation failed")?;
        Self::validate_unique_names(&conf.compresses, "compress")
            .or_err_with(FileReadError, || "compress name validation failed")?;
        Self::validate_unique_names(&conf.upstreams, "upstream")
            .or_err_with(FileReadError, || "upstream name validation failed")?;
        Self::validate_unique_names(&conf.locations, "location")
            .or_err_with(FileReadError, || "location name validation failed")?;

        conf.validate_references()
            .or_err_with(FileReadError, || "conf references an unknown resource")?;

        Ok(conf)
    }

    #[allow(dead_code)]
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| {
            log::error!("failed to serialize config to yaml: {e}");
            String::new()
        })
    }

    fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }

    fn validate_unique_names<T: Identifiable>(items: &[T], resource: &str) -> Result<()> {
        let mut names = HashSet::new();
        for item in items {
            if !names.insert(item.name().to_string()) {
                return Error::e_explain(
                    FileReadError,
                    format!("duplicate {resource} name found: {}", item.name()),
                );
            }
        }
        Ok(())
    }

    /// Ensures every named reference (`location.upstream`, `location.cache`,
    /// `location.compress`, `server.locations`) points at a resource that
    /// exists.
    fn validate_references(&self) -> std::result::Result<(), String> {
        let upstreams: HashSet<&str> = self.upstreams.iter().map(|u| u.name.as_str()).collect();
        let caches: HashSet<&str> = self.caches.iter().map(|c| c.name.as_str()).collect();
        let compresses: HashSet<&str> = self.compresses.iter().map(|c| c.name.as_str()).collect();
        let locations: HashSet<&str> = self.locations.iter().map(|l| l.name.as_str()).collect();

        for location in &self.locations {
            if !upstreams.contains(location.upstream.as_str()) {
                return Err(format!(
                    "location {} references unknown upstream {}",
                    location.name, location.upstream
                ));
            }
            if let Some(cache) = &location.cache {
                if !caches.contains(cache.as_str()) {
                    return Err(format!(
                        "location {} references unknown cache {}",
                        location.name, cache
                    ));
                }
            }
            if let Some(compress) = &location.compress {
                if !compresses.contains(compress.as_str()) {
                    return Err(format!(
                        "location {} references unknown compress {}",
                        location.name, compress
                    ));
                }
            }
        }

        for server in &self.servers {
            for loc in &server.locations {
                if !locations.contains(loc.as_str()) {
                    return Err(format!(
                        "server {} references unknown location {}",
                        server.name, loc
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Log {
    #[validate(length(min = 1), custom(function = "Log::validate_path"))]
    pub path: String,
}

impl Log {
    fn validate_path(path: &str) -> std::result::Result<(), ValidationError> {
        if path.contains('\0') || path.trim().is_empty() {
            return Err(ValidationError::new("invalid_log_path"));
        }
        Ok(())
    }
}

/// Admin HTTP surface gating. Per spec.md §1 the admin REST surface itself
/// is an out-of-scope external collaborator — only this config shape and
/// the auth boundary are implemented (see `crate::admin`).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Admin {
    pub address: SocketAddr,
    #[validate(length(min = 1))]
    pub user: String,
    #[validate(length(min = 1))]
    pub password: String,
    #[serde(default = "Admin::default_path")]
    pub path: String,
}

impl Admin {
    fn default_path() -> String {
        "/pike/admin".to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Server {
    #[serde(default)]
    pub name: String,
    pub addr: SocketAddr,
    #[serde(default)]
    pub locations: Vec<String>,
    pub concurrency: Option<u32>,
    #[validate(nested)]
    pub compress: Option<CompressInline>,
    #[serde(default)]
    pub enable_server_timing: bool,
}

/// Inline default compress settings attached directly to a server, as
/// opposed to the named, re-usable entries in `compresses` (referenced
/// from a `Location` by name).
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CompressInline {
    #[serde(default = "CompressConfig::default_level")]
    pub level: u32,
    #[serde(default = "CompressConfig::default_min_length")]
    pub min_length: usize,
    pub filter: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CacheConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "CacheConfig::default_size")]
    pub size: usize,
    #[serde(default = "CacheConfig::default_zone")]
    pub zone: usize,
    #[serde(default = "CacheConfig::default_hit_for_pass")]
    pub hit_for_pass: u64,
}

impl CacheConfig {
    fn default_size() -> usize {
        10
    }
    fn default_zone() -> usize {
        1024
    }
    fn default_hit_for_pass() -> u64 {
        300
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct CompressConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default = "CompressConfig::default_level")]
    pub level: u32,
    #[serde(default = "CompressConfig::default_min_length")]
    pub min_length: usize,
    pub filter: Option<String>,
}

impl CompressConfig {
    fn default_level() -> u32 {
        6
    }
    fn default_min_length() -> usize {
        256
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct UpstreamConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub policy: UpstreamPolicy,
    #[validate(length(min = 1))]
    #[validate(nested)]
    pub servers: Vec<UpstreamServer>,
}

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpstreamPolicy {
    #[default]
    RoundRobin,
    First,
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct UpstreamServer {
    #[validate(custom(function = "UpstreamServer::validate_addr"))]
    pub addr: String,
    #[serde(default)]
    pub backup: bool,
    #[serde(default = "UpstreamServer::default_weight")]
    pub weight: u32,
    pub health_check_path: Option<String>,
}

impl UpstreamServer {
    fn default_weight() -> u32 {
        1
    }

    fn validate_addr(addr: &str) -> std::result::Result<(), ValidationError> {
        if ADDR_REGEX.is_match(addr) {
            Ok(())
        } else {
            let mut err = ValidationError::new("invalid_upstream_addr");
            err.add_param("addr".into(), &addr);
            Err(err)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
pub struct Location {
    #[serde(default)]
    pub name: String,
    pub upstream: String,
    pub cache: Option<String>,
    pub compress: Option<String>,
    #[serde(default)]
    pub prefixs: Vec<String>,
    #[serde(default)]
    pub rewrites: HashMap<String, String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub request_header: HashMap<String, String>,
    #[serde(default)]
    pub response_header: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_log() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    const MINIMAL: &str = r#"
---
servers:
  - name: main
    addr: "0.0.0.0:8080"
    locations: ["root"]

upstreams:
  - name: backend
    servers:
      - addr: "127.0.0.1:1980"

caches:
  - name: default

locations:
  - name: root
    upstream: backend
    cache: default
    prefixs: ["/"]
"#;

    #[test]
    fn test_load_minimal() {
        init_log();
        let conf = Config::from_yaml(MINIMAL).unwrap();
        assert_eq!(1, conf.servers.len());
        assert_eq!(1, conf.upstreams.len());
        assert_eq!(1, conf.caches.len());
        assert_eq!(1, conf.locations.len());
        assert_eq!(10, conf.caches[0].size);
        assert_eq!(1024, conf.caches[0].zone);
        assert_eq!(300, conf.caches[0].hit_for_pass);
    }

    #[test]
    fn test_print_default_yaml_roundtrip() {
        init_log();
        let conf = Config::from_yaml(MINIMAL).unwrap();
        let yaml = conf.to_yaml();
        let reparsed = Config::from_yaml(&yaml).unwrap();
        assert_eq!(conf.servers.len(), reparsed.servers.len());
    }

    #[test]
    fn test_requires_at_least_one_server() {
        init_log();
        let conf_str = r#"
---
servers: []
"#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        init_log();
        let conf_str = r#"
---
servers:
  - name: main
    addr: "0.0.0.0:8080"

upstreams:
  - name: backend
    servers:
      - addr: "127.0.0.1:1980"
  - name: backend
    servers:
      - addr: "127.0.0.1:1981"
"#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_unknown_upstream_reference_rejected() {
        init_log();
        let conf_str = r#"
---
servers:
  - name: main
    addr: "0.0.0.0:8080"
    locations: ["root"]

locations:
  - name: root
    upstream: missing
    prefixs: ["/"]
"#;
        assert!(Config::from_yaml(conf_str).is_err());
    }

    #[test]
    fn test_invalid_upstream_addr_rejected() {
        init_log();
        let conf_str = r#"
---
servers:
  - name: main
    addr: "0.0.0.0:8080"

upstreams:
  - name: backend
    servers:
      - addr: "-invalid.com:8080"
"#;
        assert!(Config::from_yaml(conf_str).is_err());
    }
}
