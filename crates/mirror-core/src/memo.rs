//! Memoized disk freshness checks
//!
//! A bounded, TTL-aware layer over `CacheStore` freshness checks: fixed
//! capacity with least-recently-used eviction, entry age capped at the cache
//! TTL so a memoized `Valid` cannot outlive a real check, and a single-flight
//! loader so concurrent lookups for one unresolved key share a single disk
//! stat. The memo is an early-exit hint; resolution logic performs its own
//! authoritative checks.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

use mirror_storage::{Freshness, StorageError};

/// Default number of memoized paths.
pub const DEFAULT_CAPACITY: usize = 5000;

struct MemoEntry {
    freshness: Freshness,
    inserted_at: Instant,
}

/// Bounded memo of per-path freshness results.
pub struct FreshnessMemo {
    max_age: Duration,
    entries: Mutex<LruCache<PathBuf, MemoEntry>>,
    in_flight: Mutex<HashMap<PathBuf, Arc<OnceCell<Freshness>>>>,
}

impl FreshnessMemo {
    /// Create a memo with the default capacity. `max_age` should equal the
    /// cache expiry.
    pub fn new(max_age: Duration) -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, max_age)
    }

    /// Create a memo bounded to `capacity` entries.
    pub fn with_capacity(capacity: usize, max_age: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            max_age,
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Memoized freshness for `path`, if present and younger than the memo
    /// age bound.
    pub fn peek(&self, path: &Path) -> Option<Freshness> {
        let mut entries = self.entries.lock();
        match entries.get(path) {
            Some(entry) if entry.inserted_at.elapsed() < self.max_age => Some(entry.freshness),
            Some(_) => {
                entries.pop(path);
                None
            }
            None => None,
        }
    }

    /// Record a known freshness, e.g. right after a completed write.
    pub fn set(&self, path: &Path, freshness: Freshness) {
        self.entries.lock().put(
            path.to_path_buf(),
            MemoEntry {
                freshness,
                inserted_at: Instant::now(),
            },
        );
        self.in_flight.lock().remove(path);
    }

    /// Memoized lookup with a single-flight fallback to `load`.
    ///
    /// Concurrent callers for the same unresolved path wait on one in-flight
    /// disk check and all receive its result. No lock is held across the
    /// loader await.
    pub async fn get_or_load<F, Fut>(&self, path: &Path, load: F) -> Result<Freshness, StorageError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Freshness, StorageError>>,
    {
        if let Some(freshness) = self.peek(path) {
            return Ok(freshness);
        }

        let cell = self
            .in_flight
            .lock()
            .entry(path.to_path_buf())
            .or_default()
            .clone();

        match cell.get_or_try_init(load).await.copied() {
            Ok(freshness) => {
                self.set(path, freshness);
                Ok(freshness)
            }
            Err(err) => {
                self.in_flight.lock().remove(path);
                Err(err)
            }
        }
    }
}
