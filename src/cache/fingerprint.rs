//! Fingerprinter (spec.md §4.1): a stable 64-bit key derived from request
//! method, host, and path+query.
//!
//! Grounded on `examples/original_source/cache/cache.go`, which hashes the
//! same "METHOD HOST PATH" layout with HighwayHash-64 keyed by a fixed
//! 32-byte build secret. The secret itself has no behavioral meaning beyond
//! being fixed for a given build (spec.md §3), so the literal bytes are
//! carried over unchanged to match the original's determinism exactly.

use highwayhash::{HighwayHash, HighwayHasher, Key};

pub type Fingerprint = u64;

const HASH_KEY_BYTES: &[u8; 32] = b"2fKEes0u2jpZhJpfjVeAsmUE2RW7Ab2I";

fn hash_key() -> Key {
    let mut words = [0u64; 4];
    for (i, word) in words.iter_mut().enumerate() {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&HASH_KEY_BYTES[i * 8..i * 8 + 8]);
        *word = u64::from_le_bytes(buf);
    }
    Key(words)
}

/// Lower-cases a host and strips the port if it is the scheme default.
pub fn normalize_host(host: &str, is_tls: bool) -> String {
    let host = host.to_ascii_lowercase();
    let default_port = if is_tls { ":443" } else { ":80" };
    host.strip_suffix(default_port)
        .map(str::to_string)
        .unwrap_or(host)
}

/// Computes the fingerprint for a request: a keyed 64-bit hash over
/// `METHOD SP HOST SP PATH_AND_QUERY`.
pub fn fingerprint(method: &str, host: &str, path_and_query: &str) -> Fingerprint {
    let mut buf = String::with_capacity(method.len() + host.len() + path_and_query.len() + 2);
    buf.push_str(method);
    buf.push(' ');
    buf.push_str(host);
    buf.push(' ');
    buf.push_str(path_and_query);

    let hasher = HighwayHasher::new(hash_key());
    hasher.hash64(buf.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_deterministic() {
        let a = fingerprint("GET", "example.com", "/x");
        let b = fingerprint("GET", "example.com", "/x");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_stability_invariant() {
        // method, normalized host, path+query equal => same fingerprint
        let a = fingerprint("GET", "example.com", "/x?y=1");
        let b = fingerprint("GET", "example.com", "/x?y=1");
        assert_eq!(a, b);

        // any one differing => different fingerprint (overwhelmingly likely)
        let c = fingerprint("POST", "example.com", "/x?y=1");
        let d = fingerprint("GET", "example.org", "/x?y=1");
        let e = fingerprint("GET", "example.com", "/x?y=2");
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_ne!(a, e);
    }

    #[test]
    fn test_normalize_host_strips_default_port() {
        assert_eq!("example.com", normalize_host("example.com:80", false));
        assert_eq!("example.com", normalize_host("EXAMPLE.com:443", true));
        assert_eq!("example.com:8080", normalize_host("example.com:8080", false));
    }
}
