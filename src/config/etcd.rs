//! Etcd-backed configuration source.
//!
//! Pike treats etcd as a single blob store: the whole YAML document lives
//! under one key (`<prefix>/config`), and a watch on that key triggers a
//! full reload-and-swap rather than pingsix's per-resource diffing
//! (`proxy/event.rs`/`proxy/sync.rs` in the teacher) — Pike's resource graph
//! (caches/compresses/upstreams/locations) is small enough that whole-config
//! reload is simpler and just as correct, per spec.md §9's "construct a new
//! Dispatcher and atomically swap the pointer" design note.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions, Event, EventType, GetOptions, WatchOptions};
use pingora::server::ListenFds;
use pingora_core::{server::ShutdownWatch, services::Service};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use tokio::sync::watch;

use super::Config;

const LIST_RETRY_DELAY: Duration = Duration::from_secs(3);
const WATCH_RETRY_DELAY: Duration = Duration::from_secs(1);
const CONFIG_KEY_SUFFIX: &str = "config";

pub fn is_etcd_url(path: &str) -> bool {
    path.starts_with("etcd://")
}

/// A parsed `etcd://host1:2379,host2:2379/prefix` URL.
pub struct EtcdConfigSource {
    hosts: Vec<String>,
    prefix: String,
}

impl EtcdConfigSource {
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix("etcd://")
            .ok_or_else(|| Error::explain(ReadError, "not an etcd:// url"))?;

        let (hosts_part, prefix) = rest
            .split_once('/')
            .map(|(h, p)| (h, format!("/{p}")))
            .unwrap_or((rest, "/pike".to_string()));

        if hosts_part.is_empty() {
            return Error::e_explain(ReadError, "etcd:// url is missing a host list");
        }

        Ok(Self {
            hosts: hosts_part.split(',').map(str::to_string).collect(),
            prefix,
        })
    }

    fn config_key(&self) -> String {
        format!("{}/{}", self.prefix.trim_end_matches('/'), CONFIG_KEY_SUFFIX)
    }

    async fn client(&self) -> Result<Client> {
        Client::connect(&self.hosts, Some(ConnectOptions::new()))
            .await
            .or_err_with(ReadError, || format!("failed to connect to etcd at {:?}", self.hosts))
    }

    /// Fetches the current config blob and parses it.
    pub async fn load(&self) -> Result<Config> {
        let mut client = self.client().await?;
        let key = self.config_key();

        let resp = client
            .get(key.as_str(), None)
            .await
            .or_err_with(ReadError, || format!("failed to get etcd key {key}"))?;

        let kv = resp
            .kvs()
            .first()
            .ok_or_else(|| Error::explain(ReadError, format!("etcd key {key} is empty")))?;

        let yaml = kv
            .value_str()
            .or_err_with(ReadError, || "etcd value is not valid utf-8")?;

        Config::from_yaml(yaml)
    }
}

/// Background service: watches the config key and invokes `on_reload` with
/// each successfully parsed new `Config`. Reload failures are logged and the
/// prior config retained (spec.md §7 recoverable/fatal split).
pub struct EtcdWatcher<F>
where
    F: Fn(Config) + Send + Sync + 'static,
{
    source: EtcdConfigSource,
    on_reload: F,
}

impl<F> EtcdWatcher<F>
where
    F: Fn(Config) + Send + Sync + 'static,
{
    pub fn new(source: EtcdConfigSource, on_reload: F) -> Self {
        Self { source, on_reload }
    }

    async fn run_once(&self) -> Result<()> {
        let mut client = self.source.client().await?;
        let key = self.source.config_key();

        let (mut watcher, mut stream) = client
            .watch(key.as_str(), Some(WatchOptions::new()))
            .await
            .or_err_with(ReadError, || format!("failed to watch etcd key {key}"))?;

        watcher
            .request_progress()
            .await
            .or_err_with(ReadError, || "failed to request etcd watch progress")?;

        while let Some(resp) = stream
            .message()
            .await
            .or_err_with(ReadError, || "etcd watch stream error")?
        {
            for event in resp.events() {
                if event.event_type() == EventType::Put {
                    self.handle_put(event);
                }
            }
        }

        Ok(())
    }

    fn handle_put(&self, event: &Event) {
        let Some(kv) = event.kv() else { return };
        let Ok(value) = kv.value_str() else {
            log::warn!("etcd watch: non-utf8 config value, ignoring");
            return;
        };

        match Config::from_yaml(value) {
            Ok(conf) => {
                log::info!("etcd watch: reloaded config");
                (self.on_reload)(conf);
            }
            Err(e) => {
                log::error!("etcd watch: reload rejected, keeping prior config: {e}");
            }
        }
    }
}

#[async_trait]
impl<F> Service for EtcdWatcher<F>
where
    F: Fn(Config) + Send + Sync + 'static,
{
    async fn start_service(&mut self, _fds: Option<ListenFds>, mut shutdown: ShutdownWatch) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                result = self.run_once() => {
                    if let Err(e) = result {
                        log::warn!("etcd watch loop error, retrying: {e}");
                        tokio::time::sleep(WATCH_RETRY_DELAY).await;
                    }
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        "etcd config watch"
    }

    fn threads(&self) -> Option<usize> {
        Some(1)
    }
}

#[allow(dead_code)]
async fn retry_list(source: &EtcdConfigSource) -> Config {
    loop {
        match source.load().await {
            Ok(conf) => return conf,
            Err(e) => {
                log::warn!("etcd initial load failed, retrying in {LIST_RETRY_DELAY:?}: {e}");
                tokio::time::sleep(LIST_RETRY_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_etcd_url() {
        let s = EtcdConfigSource::parse("etcd://127.0.0.1:2379/pike").unwrap();
        assert_eq!(vec!["127.0.0.1:2379".to_string()], s.hosts);
        assert_eq!("/pike", s.prefix);
        assert_eq!("/pike/config", s.config_key());
    }

    #[test]
    fn test_parse_etcd_url_multi_host_default_prefix() {
        let s = EtcdConfigSource::parse("etcd://a:2379,b:2379").unwrap();
        assert_eq!(vec!["a:2379".to_string(), "b:2379".to_string()], s.hosts);
        assert_eq!("/pike", s.prefix);
    }

    #[test]
    fn test_parse_rejects_non_etcd_url() {
        assert!(EtcdConfigSource::parse("/etc/pike/pike.yaml").is_err());
    }
}
