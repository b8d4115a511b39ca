//! API error mapping
//!
//! The single place where the core error taxonomy is matched exhaustively
//! and turned into client responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{error, info};

use mirror_core::CoreError;
use mirror_proxy::ProxyError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Core(err) => match err {
                CoreError::NotFound(msg) => {
                    info!("not found: {}", msg);
                    (StatusCode::NOT_FOUND, format!("Resource not found: {msg}"))
                }
                CoreError::Blacklisted { name, version } => {
                    info!("rejected blacklisted version {} of {}", version, name);
                    (
                        StatusCode::FORBIDDEN,
                        format!("Version {version} of {name} is blacklisted"),
                    )
                }
                CoreError::Upstream(proxy_err) => {
                    error!("upstream failure: {}", proxy_err);
                    (
                        upstream_status(proxy_err),
                        "Upstream registry error".to_string(),
                    )
                }
                CoreError::Storage(storage_err) => {
                    error!("storage failure: {}", storage_err);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
                CoreError::MalformedMetadata { name, reason } => {
                    error!("malformed metadata for {}: {}", name, reason);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        format!("Malformed metadata for {name}"),
                    )
                }
                CoreError::Resolution(msg) => {
                    error!("resolution failure: {}", msg);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
                CoreError::Config(msg) => {
                    error!("configuration failure: {}", msg);
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error".to_string(),
                    )
                }
            },
            ApiError::Proxy(err) => {
                error!("pass-through proxy failure: {}", err);
                (upstream_status(err), "Upstream registry error".to_string())
            }
        };

        (status, message).into_response()
    }
}

// Propagate a meaningful upstream 4xx/5xx; everything else is a 500.
fn upstream_status(err: &ProxyError) -> StatusCode {
    match err {
        ProxyError::UpstreamStatus { status } => StatusCode::from_u16(*status)
            .ok()
            .filter(|code| code.is_client_error() || code.is_server_error())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        ProxyError::Http(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
