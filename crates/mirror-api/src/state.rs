//! Application state

use mirror_core::{FreshnessMemo, MirrorConfig, PackageResolver};
use mirror_proxy::RegistryClient;
use mirror_storage::CacheStore;
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<PackageResolver>,
    pub store: Arc<CacheStore>,
    pub memo: Arc<FreshnessMemo>,
    pub client: Arc<RegistryClient>,
    pub config: Arc<MirrorConfig>,
}

impl AppState {
    pub fn new(
        resolver: Arc<PackageResolver>,
        store: Arc<CacheStore>,
        memo: Arc<FreshnessMemo>,
        client: Arc<RegistryClient>,
        config: Arc<MirrorConfig>,
    ) -> Self {
        Self {
            resolver,
            store,
            memo,
            client,
            config,
        }
    }
}
