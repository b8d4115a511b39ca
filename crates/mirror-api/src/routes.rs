//! Request dispatch
//!
//! A single fallback handler matches the recognized path shapes and serves
//! resolved cache files through tower-http's `ServeFile`. Anything
//! unmatched, and any file that disappears between resolution and serving,
//! is proxied to the upstream verbatim.

use axum::Router;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use mime_guess::mime::{self, Mime};
use std::path::{Path, PathBuf};
use tower::ServiceExt;
use tower_http::services::ServeFile;
use tracing::debug;

use mirror_core::package::PackageSpec;
use mirror_core::CoreError;
use mirror_storage::{EntryKind, Freshness};

use crate::error::ApiError;
use crate::router::{Route, match_route};
use crate::state::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new().fallback(dispatch).with_state(state)
}

async fn dispatch(State(state): State<AppState>, req: Request) -> Response {
    // registry writes and exotic methods are never cached, only forwarded
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return proxy_upstream(&state, req).await;
    }

    let route = match_route(req.uri().path());
    debug!(path = req.uri().path(), ?route, "dispatching request");

    let resolved = match route {
        Route::LatestMeta { name } => latest_meta(&state, &name).await,
        Route::VersionMeta { name, version } => version_meta(&state, &name, &version).await,
        Route::Tarball { name, version } => tarball(&state, &name, &version).await,
        Route::Meta { name } => meta(&state, &name).await,
        Route::PassThrough => return proxy_upstream(&state, req).await,
    };

    match resolved {
        Ok((path, mime)) => serve_cached_file(&state, req, &path, mime).await,
        Err(err) => err.into_response(),
    }
}

/// Whole-package metadata. A memoized `Valid` short-circuits resolution
/// entirely; anything else goes through the resolver's authoritative checks.
async fn meta(state: &AppState, name: &str) -> Result<(PathBuf, Mime), ApiError> {
    let spec = PackageSpec::from_name(name)?;
    let path = state.store.entry_path(EntryKind::Meta, &spec.name, None);

    let store = state.store.clone();
    let check = {
        let path = path.clone();
        move || async move { store.validate_path(&path).await }
    };
    let freshness = state
        .memo
        .get_or_load(&path, check)
        .await
        .map_err(CoreError::Storage)?;
    if freshness == Freshness::Valid {
        debug!(package = %spec.name, "memoized metadata hit");
        return Ok((path, mime::APPLICATION_JSON));
    }

    let path = state.resolver.meta(&spec).await?;
    Ok((path, mime::APPLICATION_JSON))
}

async fn latest_meta(state: &AppState, name: &str) -> Result<(PathBuf, Mime), ApiError> {
    let spec = PackageSpec::from_name(name)?;
    let path = state.resolver.latest_version_meta(&spec).await?;
    Ok((path, mime::APPLICATION_JSON))
}

async fn version_meta(
    state: &AppState,
    name: &str,
    version: &str,
) -> Result<(PathBuf, Mime), ApiError> {
    let spec = PackageSpec::with_version(name, version)?;
    let path = state.resolver.version_meta(&spec).await?;
    Ok((path, mime::APPLICATION_JSON))
}

async fn tarball(
    state: &AppState,
    name: &str,
    version: &str,
) -> Result<(PathBuf, Mime), ApiError> {
    let spec = PackageSpec::with_version(name, version)?;
    let path = state.resolver.tarball(&spec).await?;
    Ok((path, mime::APPLICATION_OCTET_STREAM))
}

/// Serve a resolved cache file through the static-file delegate. A 404 from
/// the delegate means the entry vanished between resolution and serving; it
/// falls back to the upstream like any unrecognized request.
async fn serve_cached_file(
    state: &AppState,
    req: Request,
    path: &Path,
    mime: Mime,
) -> Response {
    let (parts, body) = req.into_parts();

    let mut serve_req = Request::new(Body::empty());
    *serve_req.method_mut() = parts.method.clone();
    *serve_req.uri_mut() = parts.uri.clone();
    *serve_req.headers_mut() = parts.headers.clone();

    let response = match ServeFile::new_with_mime(path, &mime).oneshot(serve_req).await {
        Ok(response) => response,
        Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    };

    if response.status() == StatusCode::NOT_FOUND {
        let req = Request::from_parts(parts, body);
        return proxy_upstream(state, req).await;
    }

    response.map(Body::new).into_response()
}

/// Forward a request to the upstream registry verbatim, streaming both ways.
async fn proxy_upstream(state: &AppState, req: Request) -> Response {
    let method = req.method().clone();
    let headers = req.headers().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let body = req.into_body().into_data_stream();

    match state
        .client
        .forward(method, &path_and_query, headers, body)
        .await
    {
        Ok(forwarded) => {
            let mut builder = Response::builder().status(forwarded.status);
            if let Some(headers) = builder.headers_mut() {
                *headers = forwarded.headers;
            }
            match builder.body(Body::from_stream(forwarded.body)) {
                Ok(response) => response.into_response(),
                Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            }
        }
        Err(err) => ApiError::Proxy(err).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use axum::routing::get;
    use bytes::Bytes;
    use semver::VersionReq;
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    use mirror_core::{FreshnessMemo, MirrorConfig, PackageResolver};
    use mirror_proxy::{RegistryClient, RegistryClientConfig};
    use mirror_storage::CacheStore;

    fn foo_doc() -> Value {
        json!({
            "name": "foo",
            "dist-tags": { "latest": "1.0.0" },
            "versions": {
                "1.0.0": {
                    "name": "foo",
                    "version": "1.0.0",
                    "dist": {
                        "tarball": "https://registry.npmjs.org/foo/-/foo-1.0.0.tgz"
                    }
                }
            }
        })
    }

    fn upstream_router() -> Router {
        let doc = foo_doc();
        Router::new()
            .route(
                "/foo",
                get(move || {
                    let doc = doc.clone();
                    async move { axum::Json(doc) }
                }),
            )
            .route(
                "/foo/-/foo-1.0.0.tgz",
                get(|| async { Bytes::from_static(b"tarball-bytes") }),
            )
            .route("/-/ping", get(|| async { "pong" }))
    }

    async fn spawn_upstream(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn app_for(dir: &Path, upstream_port: u16) -> Router {
        let mut blacklist = HashMap::new();
        blacklist.insert("badpkg".to_string(), VersionReq::parse("<2.0.0").unwrap());
        let config = Arc::new(MirrorConfig {
            server_address: "mirror.internal".to_string(),
            real_external_port: 8080,
            https_enabled: false,
            cache_dir: dir.to_path_buf(),
            cache_expiry: Duration::from_secs(60),
            cache_permit_stale: false,
            blacklist,
        });
        let store = Arc::new(CacheStore::new(dir, config.cache_expiry));
        let memo = Arc::new(FreshnessMemo::new(config.cache_expiry));
        let client = Arc::new(
            RegistryClient::new(RegistryClientConfig {
                host: "127.0.0.1".to_string(),
                port: upstream_port,
                use_https: false,
                verify_ssl: true,
                http_proxy: None,
                https_proxy: None,
                timeout: Duration::from_secs(2),
            })
            .unwrap(),
        );
        let resolver = Arc::new(PackageResolver::new(
            store.clone(),
            memo.clone(),
            client.clone(),
            config.clone(),
        ));
        create_router(AppState::new(resolver, store, memo, client, config))
    }

    async fn get_response(app: &Router, uri: &str) -> Response {
        app.clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap()
    }

    async fn body_bytes(response: Response) -> Bytes {
        axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn get_meta_fetches_rewrites_and_serves() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/foo").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );

        let doc: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(
            doc["versions"]["1.0.0"]["dist"]["tarball"],
            "http://mirror.internal:8080/foo/-/foo-1.0.0.tgz"
        );

        // the cache now holds both the canonical and the raw document
        assert!(dir.path().join("foo/meta/foo.json").exists());
        assert!(dir.path().join("foo/meta/foo.json.orig").exists());
    }

    #[tokio::test]
    async fn get_version_meta_materializes_file() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/foo/1.0.0").await;
        assert_eq!(response.status(), StatusCode::OK);

        let doc: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(doc["version"], "1.0.0");
        assert!(dir.path().join("foo/meta/foo-1.0.0.json").exists());
    }

    #[tokio::test]
    async fn get_latest_meta_resolves_dist_tag() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/foo/latest").await;
        assert_eq!(response.status(), StatusCode::OK);

        let doc: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(doc["version"], "1.0.0");
    }

    #[tokio::test]
    async fn get_tarball_streams_octet_stream() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/foo/-/foo-1.0.0.tgz").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/octet-stream"
        );
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"tarball-bytes"));
        assert!(dir.path().join("foo/tgz/foo-1.0.0.tgz").exists());
    }

    #[tokio::test]
    async fn get_tarball_unknown_version_is_404() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/foo/-/foo-9.9.9.tgz").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn get_unknown_version_meta_is_404() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/foo/9.9.9").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn blacklisted_version_is_rejected() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/badpkg/1.5.0").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unrecognized_path_passes_through() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let response = get_response(&app, "/-/ping").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, Bytes::from_static(b"pong"));
    }

    #[tokio::test]
    async fn second_meta_request_hits_the_cache() {
        let dir = tempdir().unwrap();
        let port = spawn_upstream(upstream_router()).await;
        let app = app_for(dir.path(), port);

        let first = get_response(&app, "/foo").await;
        assert_eq!(first.status(), StatusCode::OK);
        let first_body = body_bytes(first).await;

        // served from disk (and the freshness memo) on repeat
        let second = get_response(&app, "/foo").await;
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(body_bytes(second).await, first_body);
    }
}
