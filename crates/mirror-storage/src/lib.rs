//! lazy-mirror cache storage layer
//!
//! This crate owns the on-disk cache: path derivation for package metadata
//! and tarballs, freshness classification, and atomic writes.

pub mod error;
pub mod store;

pub use error::StorageError;
pub use store::{ByteStream, CacheStore, EntryKind, Freshness};
