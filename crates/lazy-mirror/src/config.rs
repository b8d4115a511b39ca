//! Configuration loading and resolution

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use mirror_core::MirrorConfig;
use mirror_proxy::RegistryClientConfig;

/// On-disk configuration file structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub cache: CacheSection,
    /// Package name -> disallowed semver range.
    #[serde(default)]
    pub blacklist: HashMap<String, String>,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Local server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// External DNS name clients use for this mirror.
    #[serde(default = "default_server_address")]
    pub server_address: String,
    /// Real client-facing port when running behind a proxy. Defaults to the
    /// listen port.
    #[serde(default)]
    pub real_external_port: Option<u16>,
    /// Whether clients reach the mirror over HTTPS. Only affects rewritten
    /// dist URLs.
    #[serde(default)]
    pub https_enabled: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            server_address: default_server_address(),
            real_external_port: None,
            https_enabled: false,
        }
    }
}

/// Upstream registry configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    #[serde(default = "default_upstream_host")]
    pub host: String,
    #[serde(default = "default_upstream_port")]
    pub port: u16,
    #[serde(default)]
    pub use_https: bool,
    #[serde(default)]
    pub verify_ssl: bool,
    /// Outbound proxy for plain HTTP; falls back to `HTTP_PROXY`.
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// Outbound proxy for HTTPS; falls back to `HTTPS_PROXY`, then the
    /// HTTP proxy.
    #[serde(default)]
    pub https_proxy: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            host: default_upstream_host(),
            port: default_upstream_port(),
            use_https: false,
            verify_ssl: false,
            http_proxy: None,
            https_proxy: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_cache_dir")]
    pub dir: String,
    /// Entry time-to-live in milliseconds.
    #[serde(default = "default_cache_expiry_ms")]
    pub expiry_ms: u64,
    /// Serve expired entries when the upstream is unreachable.
    #[serde(default)]
    pub permit_stale: bool,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            expiry_ms: default_cache_expiry_ms(),
            permit_stale: false,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    2000
}

fn default_server_address() -> String {
    "localhost".to_string()
}

fn default_upstream_host() -> String {
    "registry.npmjs.org".to_string()
}

fn default_upstream_port() -> u16 {
    80
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_cache_dir() -> String {
    "./data/cache".to_string()
}

fn default_cache_expiry_ms() -> u64 {
    24 * 60 * 60 * 1000 // 24 hours
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FileConfig {
    /// Load configuration from a file, falling back to defaults when the
    /// file does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let config_path = Path::new(path);

        if !config_path.exists() {
            info!("Config file not found at {}, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: FileConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        info!("Loaded configuration from {}", path);
        Ok(config)
    }
}

/// Resolve the immutable runtime configuration. Outbound proxies fall back
/// to the process environment; everything is final before the server
/// starts serving.
pub fn resolve(
    file: &FileConfig,
    bind_port: u16,
) -> Result<(MirrorConfig, RegistryClientConfig)> {
    let mut blacklist = HashMap::new();
    for (name, range) in &file.blacklist {
        let parsed = semver::VersionReq::parse(range)
            .with_context(|| format!("Invalid blacklist range for {}: {}", name, range))?;
        blacklist.insert(name.clone(), parsed);
    }

    let http_proxy = file
        .upstream
        .http_proxy
        .clone()
        .or_else(|| std::env::var("HTTP_PROXY").ok())
        .or_else(|| std::env::var("http_proxy").ok());
    let https_proxy = file
        .upstream
        .https_proxy
        .clone()
        .or_else(|| std::env::var("HTTPS_PROXY").ok())
        .or_else(|| std::env::var("https_proxy").ok())
        .or_else(|| http_proxy.clone());

    let mirror = MirrorConfig {
        server_address: file.server.server_address.clone(),
        real_external_port: file.server.real_external_port.unwrap_or(bind_port),
        https_enabled: file.server.https_enabled,
        cache_dir: PathBuf::from(&file.cache.dir),
        cache_expiry: Duration::from_millis(file.cache.expiry_ms),
        cache_permit_stale: file.cache.permit_stale,
        blacklist,
    };

    let client = RegistryClientConfig {
        host: file.upstream.host.clone(),
        port: file.upstream.port,
        use_https: file.upstream.use_https,
        verify_ssl: file.upstream.verify_ssl,
        http_proxy,
        https_proxy,
        timeout: Duration::from_secs(file.upstream.timeout_secs),
    };

    Ok((mirror, client))
}
