//! Compressor (spec.md §4.4): lazy gzip/brotli variant generation,
//! memoized per `CacheEntry`, with a min-length guard and a content-type
//! filter.
//!
//! No teacher analog — pingsix's `plugin/gzip.rs`/`plugin/brotli.rs` only
//! toggle Pingora's per-request *streaming* `ResponseCompression` module,
//! which cannot memoize a variant across requests the way a cache entry
//! needs to. Grounded on the gzip/brotli crate usage attested in the
//! broader retrieval pack (`other_examples/...beagle-cache-src-lib.rs.rs`,
//! `...xevion.dev__src-cache.rs.rs`).

use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Identity,
    Gzip,
    Brotli,
}

impl Encoding {
    pub fn as_content_encoding(&self) -> Option<&'static str> {
        match self {
            Encoding::Identity => None,
            Encoding::Gzip => Some("gzip"),
            Encoding::Brotli => Some("br"),
        }
    }
}

/// One cached response's body encodings. `identity` is the canonical form;
/// `gzip`/`brotli` are derived and memoized on demand. Invariant (spec.md
/// §3): whenever a compressed field is present, it decompresses back to
/// `identity` (when `identity` is itself present).
#[derive(Clone, Debug, Default)]
pub struct Variant {
    pub identity: Option<Bytes>,
    pub gzip: Option<Bytes>,
    pub brotli: Option<Bytes>,
}

impl Variant {
    pub fn from_identity(body: Bytes) -> Self {
        Self {
            identity: Some(body),
            gzip: None,
            brotli: None,
        }
    }

    pub fn get(&self, encoding: Encoding) -> Option<&Bytes> {
        match encoding {
            Encoding::Identity => self.identity.as_ref(),
            Encoding::Gzip => self.gzip.as_ref(),
            Encoding::Brotli => self.brotli.as_ref(),
        }
    }
}

pub struct Compressor {
    level: u32,
    min_length: usize,
    filter: Regex,
}

impl Compressor {
    pub fn new(level: u32, min_length: usize, filter: Option<&str>) -> Self {
        let pattern = filter.unwrap_or(DEFAULT_COMPRESSIBLE_CONTENT_TYPES);
        let filter = Regex::new(pattern).unwrap_or_else(|_| {
            Regex::new(DEFAULT_COMPRESSIBLE_CONTENT_TYPES).expect("default filter is valid regex")
        });
        Self {
            level,
            min_length,
            filter,
        }
    }

    pub fn is_compressible(&self, content_type: &str, body_len: usize) -> bool {
        body_len >= self.min_length && self.filter.is_match(content_type)
    }

    /// Resolves `encoding` against `variant`, compressing/decompressing and
    /// memoizing as needed. Returns `None` only if no body is available at
    /// all (the variant is empty, which should not happen for a populated
    /// cache entry).
    pub fn resolve(&self, variant: &mut Variant, encoding: Encoding) -> Option<Bytes> {
        if let Some(bytes) = variant.get(encoding) {
            return Some(bytes.clone());
        }

        // The identity form is the source of truth for deriving anything
        // else. If we only hold a compressed form (fetched pre-compressed
        // from upstream, spec.md §9's open question on gzip-to-identity
        // derivation), decompress it once and memoize identity too so later
        // requests for a third encoding compress from identity rather than
        // re-decompressing repeatedly.
        if variant.identity.is_none() {
            let source = variant
                .gzip
                .clone()
                .or_else(|| variant.brotli.clone())?;
            let source_encoding = if variant.gzip.is_some() {
                Encoding::Gzip
            } else {
                Encoding::Brotli
            };
            let identity = self.decompress(&source, source_encoding)?;
            variant.identity = Some(identity);
        }

        let identity = variant.identity.clone()?;
        match encoding {
            Encoding::Identity => Some(identity),
            Encoding::Gzip => {
                let compressed = self.compress_gzip(&identity);
                variant.gzip = Some(compressed.clone());
                Some(compressed)
            }
            Encoding::Brotli => {
                let compressed = self.compress_brotli(&identity);
                variant.brotli = Some(compressed.clone());
                Some(compressed)
            }
        }
    }

    fn compress_gzip(&self, identity: &Bytes) -> Bytes {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder
            .write_all(identity)
            .expect("writing to an in-memory gzip encoder cannot fail");
        Bytes::from(encoder.finish().expect("finishing an in-memory gzip stream cannot fail"))
    }

    fn compress_brotli(&self, identity: &Bytes) -> Bytes {
        let mut out = Vec::new();
        let params = brotli::enc::BrotliEncoderParams {
            quality: self.level.min(11) as i32,
            ..Default::default()
        };
        brotli::BrotliCompress(&mut identity.as_ref(), &mut out, &params)
            .expect("in-memory brotli compression cannot fail");
        Bytes::from(out)
    }

    fn decompress(&self, body: &Bytes, encoding: Encoding) -> Option<Bytes> {
        match encoding {
            Encoding::Identity => Some(body.clone()),
            Encoding::Gzip => {
                let mut decoder = GzDecoder::new(body.as_ref());
                let mut out = Vec::new();
                decoder.read_to_end(&mut out).ok()?;
                Some(Bytes::from(out))
            }
            Encoding::Brotli => {
                let mut out = Vec::new();
                brotli::BrotliDecompress(&mut body.as_ref(), &mut out).ok()?;
                Some(Bytes::from(out))
            }
        }
    }
}

const DEFAULT_COMPRESSIBLE_CONTENT_TYPES: &str =
    r"^(text/|application/json|application/javascript|application/xml|image/svg\+xml)";

#[cfg(test)]
mod tests {
    use super::*;

    fn compressor() -> Compressor {
        Compressor::new(6, 8, None)
    }

    #[test]
    fn test_roundtrip_gzip() {
        let c = compressor();
        let mut variant = Variant::from_identity(Bytes::from_static(b"hello world, this is a body"));
        let gz = c.resolve(&mut variant, Encoding::Gzip).unwrap();
        assert!(variant.gzip.is_some());
        let back = c.decompress(&gz, Encoding::Gzip).unwrap();
        assert_eq!(variant.identity.as_ref().unwrap(), &back);
    }

    #[test]
    fn test_roundtrip_brotli() {
        let c = compressor();
        let mut variant = Variant::from_identity(Bytes::from_static(b"hello world, this is a body"));
        let br = c.resolve(&mut variant, Encoding::Brotli).unwrap();
        assert!(variant.brotli.is_some());
        let back = c.decompress(&br, Encoding::Brotli).unwrap();
        assert_eq!(variant.identity.as_ref().unwrap(), &back);
    }

    #[test]
    fn test_derive_identity_from_upstream_gzip() {
        let c = compressor();
        let original = Bytes::from_static(b"some reasonably long text body for compression");
        let compressed = c.compress_gzip(&original);

        let mut variant = Variant {
            identity: None,
            gzip: Some(compressed),
            brotli: None,
        };

        let identity = c.resolve(&mut variant, Encoding::Identity).unwrap();
        assert_eq!(original, identity);
        assert!(variant.identity.is_some());

        // deriving brotli afterward compresses from the now-memoized identity
        let br = c.resolve(&mut variant, Encoding::Brotli).unwrap();
        let back = c.decompress(&br, Encoding::Brotli).unwrap();
        assert_eq!(original, back);
    }

    #[test]
    fn test_min_length_guard() {
        let c = Compressor::new(6, 1024, None);
        assert!(!c.is_compressible("text/plain", 10));
        assert!(c.is_compressible("text/plain", 2000));
    }

    #[test]
    fn test_content_type_filter() {
        let c = compressor();
        assert!(c.is_compressible("text/html; charset=utf-8", 100));
        assert!(c.is_compressible("application/json", 100));
        assert!(!c.is_compressible("image/png", 100));
    }
}
