//! Admin HTTP surface (spec.md §6 `admin: { user, password, path }`).
//!
//! Grounded on the teacher's `admin/mod.rs` `ApiError`/`into_response`
//! pattern and its use of `pingora::apps::http_app::ServeHttp` +
//! `matchit::Router`, cut down from full etcd-backed CRUD (out of scope
//! per spec.md §1 — the admin REST surface is an external collaborator;
//! only its existence and auth boundary are specified) to a single
//! `GET <path>` status endpoint reporting per-cache zone occupancy, which
//! is the one piece of runtime state spec.md §6 asks the admin surface to
//! expose that the data-plane core itself owns.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use http::{header, Response, StatusCode};
use matchit::Router;
use pingora::{apps::http_app::ServeHttp, protocols::http::ServerSession, services::listening::Service};
use serde::Serialize;

use crate::cache::Dispatcher;
use crate::config::Admin;

#[derive(Debug)]
enum ApiError {
    Unauthorized,
    NotFound,
    MethodNotAllowed,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::Unauthorized => write!(f, "unauthorized"),
            ApiError::NotFound => write!(f, "not found"),
            ApiError::MethodNotAllowed => write!(f, "method not allowed"),
        }
    }
}

impl ApiError {
    fn into_response(self) -> Response<Vec<u8>> {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        };
        plain_response(status, &self.to_string())
    }
}

fn plain_response(status: StatusCode, body: &str) -> Response<Vec<u8>> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(body.as_bytes().to_vec())
        .unwrap_or_else(|e| {
            log::error!("failed to build admin response: {e}");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Vec::new())
                .unwrap()
        })
}

#[derive(Serialize)]
struct CacheOccupancy {
    name: String,
    zones: Vec<usize>,
}

#[derive(Serialize)]
struct StatusResponse {
    status: &'static str,
    caches: Vec<CacheOccupancy>,
}

pub struct AdminHttpApp {
    config: Admin,
    caches: Arc<HashMap<String, Arc<Dispatcher>>>,
    router: Router<()>,
}

impl AdminHttpApp {
    pub fn new(config: Admin, caches: Arc<HashMap<String, Arc<Dispatcher>>>) -> Self {
        let mut router = Router::new();
        router
            .insert(config.path.clone(), ())
            .expect("admin status path must be a valid route pattern");
        Self {
            config,
            caches,
            router,
        }
    }

    pub fn admin_http_service(config: Admin, caches: Arc<HashMap<String, Arc<Dispatcher>>>) -> Service<Self> {
        let app = Self::new(config, caches);
        let addr = app.config.address.to_string();
        let mut service = Service::new("Admin HTTP".to_string(), app);
        service.add_tcp(&addr);
        service
    }

    async fn status_body(&self) -> Vec<u8> {
        let mut caches = Vec::with_capacity(self.caches.len());
        for (name, dispatcher) in self.caches.iter() {
            caches.push(CacheOccupancy {
                name: name.clone(),
                zones: dispatcher.zone_occupancy().await,
            });
        }
        caches.sort_by(|a, b| a.name.cmp(&b.name));

        let response = StatusResponse { status: "ok", caches };
        serde_json::to_vec(&response).unwrap_or_else(|e| {
            log::error!("failed to serialize admin status response: {e}");
            b"{}".to_vec()
        })
    }
}

#[async_trait]
impl ServeHttp for AdminHttpApp {
    async fn response(&self, http_session: &mut ServerSession) -> Response<Vec<u8>> {
        http_session.set_keepalive(None);

        if let Err(e) = check_basic_auth(http_session, &self.config.user, &self.config.password) {
            return e.into_response();
        }

        let (path, method) = {
            let req_header = http_session.req_header();
            (req_header.uri.path().to_string(), req_header.method.clone())
        };

        if self.router.at(&path).is_err() {
            return ApiError::NotFound.into_response();
        }
        if method != http::Method::GET {
            return ApiError::MethodNotAllowed.into_response();
        }

        let body = self.status_body().await;
        Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .unwrap_or_else(|e| {
                log::error!("failed to build admin status response: {e}");
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Vec::new())
                    .unwrap()
            })
    }
}

fn check_basic_auth(session: &ServerSession, user: &str, password: &str) -> Result<(), ApiError> {
    let header_value = session
        .get_header(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(ApiError::Unauthorized)?;

    let encoded = header_value.strip_prefix("Basic ").ok_or(ApiError::Unauthorized)?;
    let decoded = BASE64_STANDARD
        .decode(encoded)
        .map_err(|_| ApiError::Unauthorized)?;
    let credentials = String::from_utf8(decoded).map_err(|_| ApiError::Unauthorized)?;

    let expected = format!("{user}:{password}");
    if credentials == expected {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}
