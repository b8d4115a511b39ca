//! lazy-mirror upstream client
//!
//! This crate provides the client for the upstream package registry:
//! metadata and tarball fetches for cache misses, and verbatim pass-through
//! forwarding for everything the mirror does not cache.

pub mod client;
pub mod error;

pub use client::{ByteStream, ForwardedResponse, RegistryClient, RegistryClientConfig};
pub use error::ProxyError;
