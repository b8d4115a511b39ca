//! Shared configuration value
//!
//! Resolved once at startup (including outbound proxy discovery) and
//! immutable afterwards, so request handling never observes a partially
//! initialized configuration.

use semver::VersionReq;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Resolved mirror configuration, shared read-only across components.
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// External DNS name clients use to reach this mirror.
    pub server_address: String,
    /// Client-facing port (may differ from the bind port behind a proxy).
    /// Used only for dist-URL rewriting.
    pub real_external_port: u16,
    /// Whether clients reach this mirror over HTTPS. Used only for
    /// dist-URL rewriting.
    pub https_enabled: bool,
    /// Root of the on-disk cache.
    pub cache_dir: PathBuf,
    /// Time-to-live of cached entries.
    pub cache_expiry: Duration,
    /// Serve expired cache entries when the upstream is unreachable.
    pub cache_permit_stale: bool,
    /// Disallowed version ranges per package.
    pub blacklist: HashMap<String, VersionReq>,
}
