//! Disk-backed cache store
//!
//! Cache entries live under a fixed per-package layout:
//! `<root>/<name>/meta/<name>.json` for the whole-package metadata document
//! (with a `.orig` sibling holding the unrewritten upstream copy),
//! `<root>/<name>/meta/<name>-<version>.json` for per-version metadata, and
//! `<root>/<name>/tgz/<name>-<version>.tgz` for tarballs.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

/// Stream of byte chunks, as produced by an upstream fetch.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

const META_FOLDER: &str = "meta";
const TGZ_FOLDER: &str = "tgz";
const RAW_META_SUFFIX: &str = ".orig";

/// Kind of cached artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// A package metadata document (whole-package or per-version).
    Meta,
    /// A version's binary archive.
    Tarball,
}

/// Tri-state disk freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// No file at the entry's path.
    NotExist,
    /// The file exists but its age has reached the configured expiry.
    Expired,
    /// The file exists and is younger than the configured expiry.
    Valid,
}

/// Disk cache rooted at a single directory.
pub struct CacheStore {
    root: PathBuf,
    expiry: Duration,
}

impl CacheStore {
    /// Create a store over `root` with the given entry time-to-live.
    pub fn new(root: impl Into<PathBuf>, expiry: Duration) -> Self {
        Self {
            root: root.into(),
            expiry,
        }
    }

    /// Path for a cache entry. Pure: identical (kind, name, version) tuples
    /// always yield the identical path, distinct tuples never collide.
    pub fn entry_path(&self, kind: EntryKind, name: &str, version: Option<&str>) -> PathBuf {
        match (kind, version) {
            (EntryKind::Meta, None) => self
                .root
                .join(name)
                .join(META_FOLDER)
                .join(format!("{name}.json")),
            (EntryKind::Meta, Some(version)) => self
                .root
                .join(name)
                .join(META_FOLDER)
                .join(format!("{name}-{version}.json")),
            (EntryKind::Tarball, version) => {
                let version = version.unwrap_or_default();
                self.root
                    .join(name)
                    .join(TGZ_FOLDER)
                    .join(format!("{name}-{version}.tgz"))
            }
        }
    }

    /// Path of the raw (unrewritten) whole-package metadata document.
    pub fn raw_meta_path(&self, name: &str) -> PathBuf {
        let mut path = self
            .entry_path(EntryKind::Meta, name, None)
            .into_os_string();
        path.push(RAW_META_SUFFIX);
        PathBuf::from(path)
    }

    /// Classify the freshness of a cache entry with a disk stat.
    pub async fn validate(
        &self,
        kind: EntryKind,
        name: &str,
        version: Option<&str>,
    ) -> Result<Freshness, StorageError> {
        self.validate_path(&self.entry_path(kind, name, version))
            .await
    }

    /// Classify the freshness of a path. Absence is the `NotExist` value,
    /// not an error.
    pub async fn validate_path(&self, path: &Path) -> Result<Freshness, StorageError> {
        let metadata = match fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Freshness::NotExist);
            }
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mtime = metadata.modified()?;
        let age = SystemTime::now()
            .duration_since(mtime)
            .unwrap_or(Duration::ZERO);

        if age >= self.expiry {
            Ok(Freshness::Expired)
        } else {
            Ok(Freshness::Valid)
        }
    }

    /// Read a cache entry fully into memory.
    pub async fn read(&self, path: &Path) -> Result<Bytes, StorageError> {
        let data = fs::read(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.display().to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        Ok(Bytes::from(data))
    }

    /// Write bytes so they only become visible at `path` once complete.
    pub async fn write(&self, path: &Path, data: Bytes) -> Result<(), StorageError> {
        let temp_path = self.prepare_temp(path).await?;
        fs::write(&temp_path, &data).await?;
        fs::rename(&temp_path, path).await?;

        debug!(path = %path.display(), bytes = data.len(), "wrote cache entry");
        Ok(())
    }

    /// Stream chunks into `path`, atomically. Returns the byte count.
    pub async fn write_stream(
        &self,
        path: &Path,
        mut stream: ByteStream,
    ) -> Result<u64, StorageError> {
        let temp_path = self.prepare_temp(path).await?;
        let mut file = File::create(&temp_path).await?;
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    let _ = fs::remove_file(&temp_path).await;
                    return Err(e);
                }
            };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);
        fs::rename(&temp_path, path).await?;

        debug!(path = %path.display(), bytes = written, "wrote cache entry");
        Ok(written)
    }

    // Temp files get a unique name: concurrent writers for the same entry
    // are allowed and must not clobber each other's partial output.
    async fn prepare_temp(&self, path: &Path) -> Result<PathBuf, StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4())))
    }
}
