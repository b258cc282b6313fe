//! The `ProxyHttp` entry point (spec.md §4.8, §9).
//!
//! Grounded on the teacher's `service/http.rs` `HttpService`, but the
//! upstream call itself goes through `crate::proxy::fetcher::ProxyFetcher`
//! (`reqwest`) rather than Pingora's `upstream_peer`/streaming response
//! hooks — see DESIGN.md for why ETag synthesis needs the whole response
//! body before the downstream response can be finalized. `request_filter`
//! runs the whole `pipeline::run` and writes the final response directly,
//! then returns `Ok(true)` so Pingora never attempts its own upstream
//! connection for this request.

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use http::StatusCode;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_error::{Error, ErrorType, Result};
use pingora_http::ResponseHeader;
use pingora_proxy::{ProxyHttp, Session};

use crate::pipeline::{self, PipelineResources, ProxyContext, Router};
use crate::utils::request::{get_client_ip, get_request_host};

/// Lazily-populated per-request context: `ProxyContext` needs data only
/// available once the downstream request has arrived, so `new_ctx` can't
/// construct it eagerly the way the teacher's `ProxyContext::default()`
/// does.
#[derive(Default)]
pub struct HttpCtx {
    inner: Option<ProxyContext>,
}

/// Router and pipeline resources are held behind an `ArcSwap` rather than
/// owned directly, so an etcd config reload (`main.rs`) can publish a new
/// generation of either without restarting this service or its listener.
pub struct HttpService {
    router: Arc<ArcSwap<Router>>,
    resources: Arc<ArcSwap<PipelineResources>>,
}

impl HttpService {
    pub fn new(router: Arc<ArcSwap<Router>>, resources: Arc<ArcSwap<PipelineResources>>) -> Self {
        Self { router, resources }
    }
}

#[async_trait]
impl ProxyHttp for HttpService {
    type CTX = HttpCtx;

    fn new_ctx(&self) -> Self::CTX {
        HttpCtx::default()
    }

    /// The actual upstream call happens inside `pipeline::run` via
    /// `reqwest`; `request_filter` always returns `true`, so this is never
    /// invoked. Pingora's `ProxyHttp` trait has no way to opt out of it
    /// entirely, so it stubs out to a clear failure instead of silently
    /// returning a bogus peer.
    async fn upstream_peer(&self, _session: &mut Session, _ctx: &mut Self::CTX) -> Result<Box<HttpPeer>> {
        Err(Error::explain(
            ErrorType::InternalError,
            "upstream_peer should never be called: Pike proxies via ProxyFetcher in request_filter",
        ))
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let req_header = session.req_header();
        let host = get_request_host(req_header).unwrap_or_default().to_string();
        let path_and_query = req_header
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| req_header.uri.path().to_string());
        let method = req_header.method.clone();
        let request_headers = req_header.headers.clone();
        let client_ip = get_client_ip(session);

        let router = self.router.load_full();
        let resources = self.resources.load_full();

        let location = router.match_request(&host, req_header.uri.path()).cloned();

        let mut proxy_ctx = ProxyContext::new(method, host, path_and_query, false, request_headers, client_ip);
        proxy_ctx.location = location;

        if proxy_ctx.location.is_none() {
            write_response(session, StatusCode::NOT_FOUND, Default::default(), bytes::Bytes::from_static(b"not found")).await?;
            ctx.inner = Some(proxy_ctx);
            return Ok(true);
        }

        let result = pipeline::run(&mut proxy_ctx, &resources).await;

        let request_id_header = http::HeaderValue::from_str(&proxy_ctx.request_id.to_string()).ok();

        match result {
            Ok(()) => {
                let status = StatusCode::from_u16(proxy_ctx.response.status_code)
                    .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
                let mut headers = proxy_ctx.response.headers.clone();
                if let Some(value) = request_id_header.clone() {
                    headers.insert(http::HeaderName::from_static("x-request-id"), value);
                }
                if resources.enable_server_timing && !proxy_ctx.timing.is_empty() {
                    if let Ok(value) = http::HeaderValue::from_str(&proxy_ctx.server_timing_header()) {
                        headers.insert(http::HeaderName::from_static("server-timing"), value);
                    }
                }
                let body = proxy_ctx.response.body.clone();
                write_response(session, status, headers, body).await?;
            }
            Err(err) => {
                let (status, mut headers, body) = pipeline::error_response(&err);
                if let Some(value) = request_id_header {
                    headers.insert(http::HeaderName::from_static("x-request-id"), value);
                }
                write_response(session, status, headers, body).await?;
            }
        }

        ctx.inner = Some(proxy_ctx);
        Ok(true)
    }

    async fn logging(&self, session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|h| h.status.as_u16())
            .unwrap_or(0);
        let path = session.req_header().uri.path();
        let cache_status = ctx
            .inner
            .as_ref()
            .and_then(|c| c.cache_status)
            .map(|s| s.as_str())
            .unwrap_or("-");
        let elapsed = ctx
            .inner
            .as_ref()
            .map(|c| c.request_start.elapsed())
            .unwrap_or_default();

        if let Some(err) = e {
            log::error!("{path} status={status} cache={cache_status} elapsed={elapsed:?} error={err}");
        } else {
            log::info!("{path} status={status} cache={cache_status} elapsed={elapsed:?}");
        }
    }
}

async fn write_response(
    session: &mut Session,
    status: StatusCode,
    headers: http::HeaderMap,
    body: bytes::Bytes,
) -> Result<()> {
    let mut resp = ResponseHeader::build(status, Some(headers.len() + 1))?;
    for (name, value) in headers.iter() {
        resp.insert_header(name.clone(), value.clone())?;
    }
    resp.insert_header(http::header::CONTENT_LENGTH, body.len().to_string())?;

    session.write_response_header(Box::new(resp), false).await?;
    session.write_response_body(Some(body), true).await?;
    Ok(())
}
