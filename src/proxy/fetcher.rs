//! ProxyFetcher (spec.md §4.5): issues the upstream request, buffers the
//! full response, and derives a TTL from `Cache-Control`.
//!
//! Grounded line-for-line on
//! `examples/original_source/middleware/proxy.go` for semantics: `genETag`,
//! `getCacheAge`'s directive precedence, the strip-then-restore of
//! conditional request headers, and the full-buffering
//! `bodyDumpResponseWriter` shape. Issues the actual byte-level HTTP call
//! via `reqwest` rather than Pingora's streaming `response_filter`/
//! `response_body_filter` hooks: ETag synthesis needs the complete body
//! before the response header can be finalized, which is incompatible with
//! emitting header-then-body-chunks the way those hooks do. Backend
//! *selection* still goes through `crate::proxy::upstream` (Pingora's
//! load-balancing stack); this module only performs the request once a
//! backend URL has been chosen.

use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};

use crate::cache::variant::Encoding;
use crate::error::PikeError;

/// The well-known SHA1-of-empty-string ETag, carried over from the
/// original's `genETag` (an empty body always hashes to this value).
const EMPTY_BODY_ETAG: &str = "\"0-2jmj7l5rSw0yVb_vlWAYkK_YBwk=\"";

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

pub struct FetchRequest {
    pub method: http::Method,
    pub url: String,
    pub headers: HeaderMap,
    pub client_ip: Option<String>,
    pub forwarded_proto: Option<&'static str>,
    pub timeout: Duration,
}

pub struct FetchResponse {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub ttl: u16,
    pub cacheable: bool,
    pub body: Bytes,
    pub body_encoding: Encoding,
}

pub struct ProxyFetcher {
    client: reqwest::Client,
    generate_etag: bool,
}

impl ProxyFetcher {
    pub fn new(generate_etag: bool) -> Self {
        Self {
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("building the reqwest client cannot fail with these options"),
            generate_etag,
        }
    }

    pub async fn fetch(&self, mut req: FetchRequest) -> Result<FetchResponse, PikeError> {
        strip_conditional_headers(&mut req.headers);
        inject_forwarding_headers(&mut req.headers, req.client_ip.as_deref(), req.forwarded_proto);

        let mut builder = self
            .client
            .request(req.method, &req.url)
            .timeout(req.timeout);

        for (name, value) in req.headers.iter() {
            builder = builder.header(name, value);
        }

        let response = tokio::time::timeout(req.timeout, builder.send())
            .await
            .map_err(|_| PikeError::GatewayTimeout)?
            .map_err(|_| PikeError::GatewayTimeout)?;

        let status_code = response.status().as_u16();
        let mut headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| PikeError::InternalError(e.to_string()))?;

        let ttl = cache_control_ttl(headers.get(http::header::CACHE_CONTROL));
        let cacheable = is_cacheable_status(status_code) && ttl > 0;

        let body_encoding = match headers.get(http::header::CONTENT_ENCODING) {
            None => Encoding::Identity,
            Some(v) => match v.to_str().unwrap_or("") {
                "" => Encoding::Identity,
                "gzip" => Encoding::Gzip,
                "br" => Encoding::Brotli,
                other => return Err(PikeError::UnsupportedEncoding(other.to_string())),
            },
        };

        if self.generate_etag && !headers.contains_key(http::header::ETAG) {
            let etag = generate_etag(&body);
            headers.insert(
                http::header::ETAG,
                HeaderValue::from_str(&etag).expect("generated etag is valid header value"),
            );
        }

        Ok(FetchResponse {
            status_code,
            headers,
            ttl,
            cacheable,
            body,
            body_encoding,
        })
    }
}

fn is_cacheable_status(status: u16) -> bool {
    (200..300).contains(&status)
}

/// `getCacheAge` in the original: absent Cache-Control => 0; any of
/// no-cache/no-store/private => 0; else s-maxage wins over max-age; else 0.
/// Clamped to u16 (max 65535s) per spec.md §4.5.
pub fn cache_control_ttl(cache_control: Option<&HeaderValue>) -> u16 {
    let Some(value) = cache_control.and_then(|v| v.to_str().ok()) else {
        return 0;
    };

    let directives: Vec<&str> = value.split(',').map(str::trim).collect();

    if directives.iter().any(|d| {
        d.eq_ignore_ascii_case("no-cache")
            || d.eq_ignore_ascii_case("no-store")
            || d.eq_ignore_ascii_case("private")
    }) {
        return 0;
    }

    if let Some(seconds) = directive_value(&directives, "s-maxage") {
        return seconds;
    }
    if let Some(seconds) = directive_value(&directives, "max-age") {
        return seconds;
    }

    0
}

fn directive_value(directives: &[&str], name: &str) -> Option<u16> {
    for directive in directives {
        if let Some((key, value)) = directive.split_once('=') {
            if key.trim().eq_ignore_ascii_case(name) {
                return value.trim().parse::<u64>().ok().map(|v| v.min(65_535) as u16);
            }
        }
    }
    None
}

/// `genETag` in the original: `"<hex-len>-<base64url(sha1(body))>"`, with a
/// precomputed constant for the empty body.
pub fn generate_etag(body: &[u8]) -> String {
    if body.is_empty() {
        return EMPTY_BODY_ETAG.to_string();
    }
    let digest = Sha1::digest(body);
    format!("\"{:x}-{}\"", body.len(), URL_SAFE.encode(digest))
}

fn strip_conditional_headers(headers: &mut HeaderMap) {
    headers.remove(http::header::IF_MODIFIED_SINCE);
    headers.remove(http::header::IF_NONE_MATCH);
}

fn inject_forwarding_headers(
    headers: &mut HeaderMap,
    client_ip: Option<&str>,
    forwarded_proto: Option<&'static str>,
) {
    static X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
    static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

    if !headers.contains_key(&X_REAL_IP) {
        if let Some(ip) = client_ip {
            if let Ok(value) = HeaderValue::from_str(ip) {
                headers.insert(X_REAL_IP.clone(), value);
            }
        }
    }

    if !headers.contains_key(&X_FORWARDED_PROTO) {
        if let Some(proto) = forwarded_proto {
            headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static(proto));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_control_precedence_s_maxage_wins() {
        let v = HeaderValue::from_static("s-maxage=60, max-age=30");
        assert_eq!(60, cache_control_ttl(Some(&v)));
    }

    #[test]
    fn test_cache_control_no_store_forces_zero() {
        let v = HeaderValue::from_static("no-store, s-maxage=60");
        assert_eq!(0, cache_control_ttl(Some(&v)));
    }

    #[test]
    fn test_cache_control_absent_is_zero() {
        assert_eq!(0, cache_control_ttl(None));
    }

    #[test]
    fn test_cache_control_max_age_only() {
        let v = HeaderValue::from_static("max-age=45");
        assert_eq!(45, cache_control_ttl(Some(&v)));
    }

    #[test]
    fn test_generate_etag_empty_body() {
        assert_eq!(EMPTY_BODY_ETAG, generate_etag(b""));
    }

    #[test]
    fn test_generate_etag_nonempty_body_format() {
        let etag = generate_etag(b"hello");
        assert!(etag.starts_with("\"5-"));
        assert!(etag.ends_with('"'));
    }

    #[test]
    fn test_strip_and_reinject_conditional_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        strip_conditional_headers(&mut headers);
        assert!(!headers.contains_key(http::header::IF_NONE_MATCH));
    }
}
