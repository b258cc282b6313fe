//! FreshnessEvaluator (spec.md §4.6): `If-Modified-Since` / `If-None-Match`
//! → 304 decision.
//!
//! Grounded on `examples/original_source/middleware/fresh_checker.go`: skip
//! for methods other than GET/HEAD and for statuses outside [200, 400);
//! otherwise compare the request's conditional headers against the
//! response's `ETag`/`Last-Modified`.

use http::{HeaderMap, Method, StatusCode};
use httpdate::parse_http_date;

/// Strong/weak ETag comparison per RFC 7232 §2.3. `If-None-Match` uses the
/// weak comparison function (a leading `W/` is stripped from both sides
/// before comparing the opaque tag).
fn etag_matches(if_none_match: &str, etag: &str) -> bool {
    if if_none_match.trim() == "*" {
        return true;
    }
    let strip_weak = |s: &str| s.trim().strip_prefix("W/").unwrap_or(s.trim()).to_string();
    let etag = strip_weak(etag);
    if_none_match
        .split(',')
        .map(strip_weak)
        .any(|candidate| candidate == etag)
}

/// Evaluates whether a response should be downgraded to 304 Not Modified.
/// Returns `true` when the client's conditional headers indicate the cached
/// representation is unchanged.
pub fn is_fresh(
    method: &Method,
    status: StatusCode,
    request_headers: &HeaderMap,
    response_headers: &HeaderMap,
) -> bool {
    if method != Method::GET && method != Method::HEAD {
        return false;
    }
    if !(200..400).contains(&status.as_u16()) {
        return false;
    }

    if let (Some(inm), Some(etag)) = (
        request_headers.get(http::header::IF_NONE_MATCH),
        response_headers.get(http::header::ETAG),
    ) {
        if let (Ok(inm), Ok(etag)) = (inm.to_str(), etag.to_str()) {
            if etag_matches(inm, etag) {
                return true;
            }
        }
    }

    if let (Some(ims), Some(last_modified)) = (
        request_headers.get(http::header::IF_MODIFIED_SINCE),
        response_headers.get(http::header::LAST_MODIFIED),
    ) {
        if let (Ok(ims), Ok(last_modified)) = (ims.to_str(), last_modified.to_str()) {
            if let (Ok(ims), Ok(last_modified)) =
                (parse_http_date(ims), parse_http_date(last_modified))
            {
                if ims >= last_modified {
                    return true;
                }
            }
        }
    }

    false
}

/// Builds the minimal 304 headers: hop-by-hop headers stripped, no body.
pub fn strip_for_304(headers: &mut HeaderMap) {
    headers.remove(http::header::CONTENT_LENGTH);
    headers.remove(http::header::CONTENT_ENCODING);
    headers.remove(http::header::TRANSFER_ENCODING);
    headers.remove(http::header::CONNECTION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_if_none_match_hit() {
        let mut req = HeaderMap::new();
        req.insert(http::header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        let mut resp = HeaderMap::new();
        resp.insert(http::header::ETAG, "\"abc\"".parse().unwrap());

        assert!(is_fresh(&Method::GET, StatusCode::OK, &req, &resp));
    }

    #[test]
    fn test_if_none_match_miss() {
        let mut req = HeaderMap::new();
        req.insert(http::header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        let mut resp = HeaderMap::new();
        resp.insert(http::header::ETAG, "\"xyz\"".parse().unwrap());

        assert!(!is_fresh(&Method::GET, StatusCode::OK, &req, &resp));
    }

    #[test]
    fn test_skips_non_get_head() {
        let mut req = HeaderMap::new();
        req.insert(http::header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        let mut resp = HeaderMap::new();
        resp.insert(http::header::ETAG, "\"abc\"".parse().unwrap());

        assert!(!is_fresh(&Method::POST, StatusCode::OK, &req, &resp));
    }

    #[test]
    fn test_skips_non_2xx_3xx_status() {
        let mut req = HeaderMap::new();
        req.insert(http::header::IF_NONE_MATCH, "\"abc\"".parse().unwrap());
        let mut resp = HeaderMap::new();
        resp.insert(http::header::ETAG, "\"abc\"".parse().unwrap());

        assert!(!is_fresh(
            &Method::GET,
            StatusCode::INTERNAL_SERVER_ERROR,
            &req,
            &resp
        ));
    }
}
