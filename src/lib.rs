//! Pike — an HTTP caching reverse proxy.
//!
//! This crate implements the data-plane core: an ordered middleware
//! pipeline whose heart is a sharded LRU HTTP cache with per-key
//! single-flight coordination, on-demand gzip/brotli compression of cached
//! payloads, and conditional-request (304) handling. Configuration loading,
//! upstream health probing, and the admin HTTP surface are the external
//! collaborators the pipeline is built around.

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod proxy;
pub mod service;
pub(crate) mod utils;
