//! Core error taxonomy
//!
//! Every failure class the resolution logic can produce, as an explicit
//! variant. The API layer matches these exhaustively when mapping to client
//! responses.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Version {version} of {name} is blacklisted")]
    Blacklisted { name: String, version: String },

    #[error("Upstream error: {0}")]
    Upstream(#[from] mirror_proxy::ProxyError),

    #[error("Storage error: {0}")]
    Storage(#[from] mirror_storage::StorageError),

    #[error("Malformed metadata for {name}: {reason}")]
    MalformedMetadata { name: String, reason: String },

    #[error("Resolution error: {0}")]
    Resolution(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
