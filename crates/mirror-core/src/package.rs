//! Package resolution
//!
//! Turns request path tokens into (name, version) pairs and orchestrates the
//! cache-or-upstream decision for metadata documents and tarballs.

use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use mirror_proxy::RegistryClient;
use mirror_storage::{CacheStore, EntryKind, Freshness, StorageError};

use crate::config::MirrorConfig;
use crate::error::CoreError;
use crate::memo::FreshnessMemo;

/// A parsed package request: a validated name and an optionally resolved
/// version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    pub version: Option<String>,
}

impl PackageSpec {
    /// Parse a bare name token, splitting out a trailing dash-joined
    /// version.
    ///
    /// `foo-1.2.3` resolves to (`foo`, `1.2.3`) and `my-lib-1.2.3` to
    /// (`my-lib`, `1.2.3`). A name that genuinely ends in a version-shaped
    /// token is mis-split; the rule is kept as-is for compatibility with
    /// version-qualified path styles.
    pub fn from_name(token: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = token.split('-').collect();

        if parts.len() == 2 && looks_like_version(parts[1]) {
            return Self::new(parts[0], Some(parts[1]));
        }
        if parts.len() > 2
            && let Some((version, name_parts)) = parts.split_last()
            && looks_like_version(version)
        {
            return Self::new(&name_parts.join("-"), Some(*version));
        }

        Self::new(token, None)
    }

    /// A spec with an explicitly supplied version.
    pub fn with_version(name: &str, version: &str) -> Result<Self, CoreError> {
        Self::new(name, Some(version))
    }

    fn new(name: &str, version: Option<&str>) -> Result<Self, CoreError> {
        if !is_valid_name(name) {
            return Err(CoreError::NotFound(format!("invalid package name: {name}")));
        }
        if let Some(version) = version
            && !is_valid_version(version)
        {
            return Err(CoreError::NotFound(format!(
                "invalid version for {name}: {version}"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            version: version.map(str::to_string),
        })
    }
}

// Names and versions end up in cache paths and must not be able to escape
// the cache directory.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn is_valid_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '+'))
}

/// True if `s` begins with a dotted numeric triple (`1.2.3`, `1.2.3-beta`).
pub fn starts_with_version_triple(s: &str) -> bool {
    let mut rest = s;
    for i in 0..3 {
        let digits = rest.chars().take_while(char::is_ascii_digit).count();
        if digits == 0 {
            return false;
        }
        rest = &rest[digits..];
        if i < 2 {
            match rest.strip_prefix('.') {
                Some(after) => rest = after,
                None => return false,
            }
        }
    }
    true
}

/// True if `token` contains a dotted numeric triple anywhere.
fn looks_like_version(token: &str) -> bool {
    token
        .char_indices()
        .any(|(i, c)| c.is_ascii_digit() && starts_with_version_triple(&token[i..]))
}

/// Resolves package requests against the disk cache, falling back to the
/// upstream registry.
pub struct PackageResolver {
    store: Arc<CacheStore>,
    memo: Arc<FreshnessMemo>,
    client: Arc<RegistryClient>,
    config: Arc<MirrorConfig>,
}

impl PackageResolver {
    /// Create a new resolver.
    pub fn new(
        store: Arc<CacheStore>,
        memo: Arc<FreshnessMemo>,
        client: Arc<RegistryClient>,
        config: Arc<MirrorConfig>,
    ) -> Self {
        Self {
            store,
            memo,
            client,
            config,
        }
    }

    /// Whole-package metadata: the cached path when fresh, otherwise
    /// fetched from the upstream, rewritten, and persisted.
    ///
    /// With stale-serving enabled, an expired document is refreshed
    /// best-effort: an upstream failure falls back to the stale copy.
    pub async fn meta(&self, spec: &PackageSpec) -> Result<PathBuf, CoreError> {
        let name = spec.name.as_str();
        let path = self.store.entry_path(EntryKind::Meta, name, None);

        match self.store.validate(EntryKind::Meta, name, None).await? {
            Freshness::Valid => {
                debug!(package = name, "metadata cache hit");
                Ok(path)
            }
            Freshness::Expired if self.config.cache_permit_stale => {
                match self.refresh_meta(name, &path).await {
                    Ok(()) => Ok(path),
                    Err(err @ CoreError::Upstream(_)) => {
                        warn!(package = name, error = %err, "upstream refresh failed, serving stale metadata");
                        Ok(path)
                    }
                    Err(err) => Err(err),
                }
            }
            freshness => {
                info!(package = name, ?freshness, "metadata cache miss, fetching from upstream");
                self.refresh_meta(name, &path).await?;
                Ok(path)
            }
        }
    }

    /// Metadata for whatever `dist-tags.latest` currently names.
    pub async fn latest_version_meta(&self, spec: &PackageSpec) -> Result<PathBuf, CoreError> {
        let meta_path = self.meta(spec).await?;
        let doc = self.load_meta_doc(&spec.name, &meta_path).await?;

        let latest = doc
            .get("dist-tags")
            .and_then(|tags| tags.get("latest"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CoreError::Resolution(format!("no latest dist-tag for {}", spec.name))
            })?
            .to_string();
        debug!(package = %spec.name, latest = %latest, "resolved latest dist-tag");

        let resolved = PackageSpec {
            name: spec.name.clone(),
            version: Some(latest),
        };
        self.version_meta(&resolved).await
    }

    /// Per-version metadata, materialized from the parent document on first
    /// request.
    pub async fn version_meta(&self, spec: &PackageSpec) -> Result<PathBuf, CoreError> {
        self.check_blacklist(&spec.name, spec.version.as_deref())?;
        let version = spec
            .version
            .as_deref()
            .ok_or_else(|| CoreError::Config(format!("no version resolved for {}", spec.name)))?;

        let meta_path = self.meta(spec).await?;
        let doc = self.load_meta_doc(&spec.name, &meta_path).await?;
        let version_doc = doc
            .get("versions")
            .and_then(|versions| versions.get(version))
            .ok_or_else(|| {
                CoreError::NotFound(format!("{} has no version {}", spec.name, version))
            })?;

        let path = self
            .store
            .entry_path(EntryKind::Meta, &spec.name, Some(version));

        // Version documents are immutable once derived; only materialize a
        // missing file.
        if self.store.validate_path(&path).await? == Freshness::NotExist {
            let body = serde_json::to_vec(version_doc).map_err(|e| {
                CoreError::MalformedMetadata {
                    name: spec.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            self.store.write(&path, Bytes::from(body)).await?;
            self.memo.set(&path, Freshness::Valid);
            info!(package = %spec.name, version, "materialized version metadata");
        }

        Ok(path)
    }

    /// Version tarball: the cached archive while its version is still
    /// listed in the parent metadata, otherwise streamed from the upstream.
    pub async fn tarball(&self, spec: &PackageSpec) -> Result<PathBuf, CoreError> {
        self.check_blacklist(&spec.name, spec.version.as_deref())?;
        let version = spec
            .version
            .as_deref()
            .ok_or_else(|| CoreError::Config(format!("no version resolved for {}", spec.name)))?;

        let path = self
            .store
            .entry_path(EntryKind::Tarball, &spec.name, Some(version));
        let freshness = self
            .store
            .validate(EntryKind::Tarball, &spec.name, Some(version))
            .await?;
        let cache_usable = freshness == Freshness::Valid
            || (freshness == Freshness::Expired && self.config.cache_permit_stale);

        if cache_usable {
            // a cached archive is only trusted while the parent metadata
            // still lists its version
            if self.version_listed(spec, version).await? {
                debug!(package = %spec.name, version, "tarball cache hit");
                return Ok(path);
            }
            info!(package = %spec.name, version, "cached tarball no longer listed, refetching");
        } else {
            info!(package = %spec.name, version, "tarball cache miss, fetching from upstream");
        }

        let upstream = self.client.fetch_tarball(&spec.name, version).await?;
        let stream: mirror_storage::ByteStream = Box::pin(
            upstream.map(|chunk| chunk.map_err(|e| StorageError::Io(std::io::Error::other(e)))),
        );
        self.store.write_stream(&path, stream).await?;
        self.memo.set(&path, Freshness::Valid);

        Ok(path)
    }

    /// Reject versions matching a configured blacklist range. A check
    /// without a resolved version is a configuration error.
    pub fn check_blacklist(&self, name: &str, version: Option<&str>) -> Result<(), CoreError> {
        let version = version.ok_or_else(|| {
            CoreError::Config(format!("blacklist check for {name} requires a resolved version"))
        })?;

        let Some(range) = self.config.blacklist.get(name) else {
            return Ok(());
        };

        match semver::Version::parse(version) {
            Ok(parsed) if range.matches(&parsed) => Err(CoreError::Blacklisted {
                name: name.to_string(),
                version: version.to_string(),
            }),
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(package = name, version, error = %err, "unparseable version, blacklist check skipped");
                Ok(())
            }
        }
    }

    // Fetch, persist the raw document, rewrite dist URLs, persist the
    // canonical document. The raw `.orig` copy stays on disk even when a
    // later step fails.
    async fn refresh_meta(&self, name: &str, path: &Path) -> Result<(), CoreError> {
        let raw = self.client.fetch_meta(name).await?;
        self.store
            .write(&self.store.raw_meta_path(name), raw.clone())
            .await?;

        let mut doc: Value =
            serde_json::from_slice(&raw).map_err(|e| CoreError::MalformedMetadata {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        self.rewrite_dist_urls(&mut doc);

        let body = serde_json::to_vec(&doc).map_err(|e| CoreError::MalformedMetadata {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        self.store.write(path, Bytes::from(body)).await?;
        self.memo.set(path, Freshness::Valid);

        Ok(())
    }

    /// Point every version's `dist.tarball` at this mirror.
    fn rewrite_dist_urls(&self, doc: &mut Value) {
        let Some(versions) = doc.get_mut("versions").and_then(Value::as_object_mut) else {
            return;
        };

        for version in versions.values_mut() {
            let Some(tarball) = version.get_mut("dist").and_then(|d| d.get_mut("tarball")) else {
                continue;
            };
            let Some(rewritten) = tarball.as_str().and_then(|t| self.rewrite_tarball_url(t))
            else {
                continue;
            };
            *tarball = Value::String(rewritten);
        }
    }

    fn rewrite_tarball_url(&self, tarball: &str) -> Option<String> {
        let mut url = Url::parse(tarball).ok()?;
        let scheme = if self.config.https_enabled { "https" } else { "http" };
        url.set_scheme(scheme).ok()?;
        url.set_host(Some(&self.config.server_address)).ok()?;
        url.set_port(Some(self.config.real_external_port)).ok()?;
        Some(url.to_string())
    }

    async fn version_listed(&self, spec: &PackageSpec, version: &str) -> Result<bool, CoreError> {
        let meta_path = self.meta(spec).await?;
        let doc = self.load_meta_doc(&spec.name, &meta_path).await?;
        Ok(doc
            .get("versions")
            .and_then(|versions| versions.get(version))
            .is_some())
    }

    async fn load_meta_doc(&self, name: &str, path: &Path) -> Result<Value, CoreError> {
        let bytes = self.store.read(path).await?;
        serde_json::from_slice(&bytes).map_err(|e| CoreError::MalformedMetadata {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}
