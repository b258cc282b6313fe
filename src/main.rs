#![allow(clippy::upper_case_acronyms)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_proxy::http_proxy_service_with_name;
use tokio::sync::Semaphore;

use admin::AdminHttpApp;
use cache::{Compressor, Dispatcher};
use config::etcd::{self, EtcdConfigSource, EtcdWatcher};
use config::{Config, Server as ServerConfig};
use logging::Logger;
use pipeline::{PipelineResources, Router as PipelineRouter};
use proxy::fetcher::ProxyFetcher;
use proxy::upstream::load_upstreams;
use service::http::HttpService;

mod admin;
mod cache;
mod config;
mod error;
mod logging;
mod pipeline;
mod proxy;
mod service;
mod utils;

/// Default bound on a single upstream fetch (spec.md §8), in the absence
/// of a per-deployment override in the configuration schema.
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Builds the process-wide cache/compressor registries from one config
/// generation. Shared by the initial bootstrap and every etcd reload.
fn build_registries(config: &Config) -> (Arc<HashMap<String, Arc<Dispatcher>>>, HashMap<String, Arc<Compressor>>) {
    let caches = Arc::new(
        config
            .caches
            .iter()
            .map(|c| {
                let dispatcher = Dispatcher::new(
                    c.size,
                    c.zone,
                    u16::try_from(c.hit_for_pass).unwrap_or(u16::MAX),
                    DEFAULT_FETCH_TIMEOUT_SECS,
                );
                (c.name.clone(), Arc::new(dispatcher))
            })
            .collect(),
    );

    let compressors = config
        .compresses
        .iter()
        .map(|c| {
            let compressor = Compressor::new(c.level, c.min_length, c.filter.as_deref());
            (c.name.clone(), Arc::new(compressor))
        })
        .collect();

    (caches, compressors)
}

/// Builds one server's router and pipeline resources against a given
/// config generation. Shared by the initial bootstrap and every reload, so
/// the two stay structurally identical.
fn build_server_state(
    server_cfg: &ServerConfig,
    locations: &[config::Location],
    caches: &Arc<HashMap<String, Arc<Dispatcher>>>,
    compressors: &HashMap<String, Arc<Compressor>>,
    fetcher: &Arc<ProxyFetcher>,
) -> (PipelineRouter, PipelineResources) {
    let router = PipelineRouter::new(locations, &server_cfg.locations);
    let resources = PipelineResources {
        caches: caches.as_ref().clone(),
        compressors: compressors.clone(),
        fetcher: fetcher.clone(),
        fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
        semaphore: server_cfg
            .concurrency
            .map(|n| Arc::new(Semaphore::new(n as usize))),
        enable_server_timing: server_cfg.enable_server_timing,
    };
    (router, resources)
}

fn main() {
    let opt = Opt::parse_args();
    let conf_path = opt.conf.clone();
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    let logger = config.log.clone().map(Logger::new);
    match &logger {
        Some(logger) => logger.init_env_logger(),
        None => env_logger::init(),
    }

    log::info!("Loading upstreams...");
    load_upstreams(&config.upstreams, config.pingora.work_stealing).expect("Failed to load upstreams");

    let (caches, compressors) = build_registries(&config);
    let fetcher = Arc::new(ProxyFetcher::new(true));

    let servers = config.servers.clone();
    let locations = config.locations.clone();
    let admin_cfg = config.admin.clone();

    let mut pike_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);
    pike_server.bootstrap();

    log::info!("Configuring servers...");
    let mut reload_handles: Vec<(String, Arc<ArcSwap<PipelineRouter>>, Arc<ArcSwap<PipelineResources>>)> = Vec::new();

    for server_cfg in &servers {
        let (router, resources) = build_server_state(server_cfg, &locations, &caches, &compressors, &fetcher);
        let router_swap = Arc::new(ArcSwap::from_pointee(router));
        let resources_swap = Arc::new(ArcSwap::from_pointee(resources));

        let http_service = HttpService::new(router_swap.clone(), resources_swap.clone());
        let mut proxy_service = http_proxy_service_with_name(
            &pike_server.configuration,
            http_service,
            &format!("pike-{}", server_cfg.name),
        );
        proxy_service.add_tcp(&server_cfg.addr.to_string());
        pike_server.add_service(proxy_service);

        reload_handles.push((server_cfg.name.clone(), router_swap, resources_swap));
    }

    // Etcd and file config are symmetric except for this: only etcd carries
    // a live watch. A `Config` loaded from a file is reloaded by restarting
    // the process (spec.md §9 Open Question).
    if let Some(path) = conf_path.filter(|p| etcd::is_etcd_url(p)) {
        match EtcdConfigSource::parse(&path) {
            Ok(source) => {
                log::info!("Configuring etcd config watch...");
                let fetcher = fetcher.clone();
                let watcher = EtcdWatcher::new(source, move |new_conf: Config| {
                    let (new_caches, new_compressors) = build_registries(&new_conf);
                    if let Err(e) = load_upstreams(&new_conf.upstreams, new_conf.pingora.work_stealing) {
                        log::error!("etcd reload: failed to reload upstreams, keeping prior generation live: {e}");
                        return;
                    }
                    for (name, router_swap, resources_swap) in &reload_handles {
                        let Some(server_cfg) = new_conf.servers.iter().find(|s| &s.name == name) else {
                            log::warn!("etcd reload: server {name} missing from new config, leaving it on the prior generation");
                            continue;
                        };
                        let (router, resources) =
                            build_server_state(server_cfg, &new_conf.locations, &new_caches, &new_compressors, &fetcher);
                        router_swap.store(Arc::new(router));
                        resources_swap.store(Arc::new(resources));
                    }
                    log::info!("etcd reload: swapped in new config generation");
                });
                pike_server.add_service(watcher);
            }
            Err(e) => log::error!("failed to parse etcd config url, config watch disabled: {e}"),
        }
    }

    if let Some(admin_cfg) = admin_cfg {
        log::info!("Configuring admin service...");
        let admin_service = AdminHttpApp::admin_http_service(admin_cfg, caches.clone());
        pike_server.add_service(admin_service);
    }

    if let Some(logger) = logger {
        log::info!("Configuring async file logger...");
        pike_server.add_service(logger);
    }

    log::info!("Starting Server...");
    pike_server.run_forever();
}
