//! lazy-mirror core resolution logic
//!
//! This crate provides the core functionality of the mirror: the memoized
//! freshness layer, package name/version resolution, and the cache-or-
//! upstream decision logic for metadata and tarballs.

pub mod config;
pub mod error;
pub mod memo;
pub mod package;

pub use config::MirrorConfig;
pub use error::CoreError;
pub use memo::FreshnessMemo;
pub use package::{PackageResolver, PackageSpec};
