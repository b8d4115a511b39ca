//! Upstream registry client

use bytes::Bytes;
use futures::{Stream, TryStreamExt};
use http::{HeaderMap, Method, StatusCode, header};
use reqwest::Client;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ProxyError;

/// Stream of response body chunks.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// Upstream registry client configuration, resolved once at startup.
#[derive(Clone, Debug)]
pub struct RegistryClientConfig {
    /// Upstream registry host.
    pub host: String,
    /// Upstream registry port.
    pub port: u16,
    /// Use HTTPS when talking to the upstream.
    pub use_https: bool,
    /// Verify the upstream's TLS certificates.
    pub verify_ssl: bool,
    /// Outbound proxy for plain HTTP requests.
    pub http_proxy: Option<String>,
    /// Outbound proxy for HTTPS requests.
    pub https_proxy: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// HTTP client for the upstream package registry.
pub struct RegistryClient {
    config: RegistryClientConfig,
    client: Client,
}

/// A pass-through response from the upstream, ready to stream back to the
/// inbound connection.
pub struct ForwardedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl RegistryClient {
    /// Create a new registry client.
    pub fn new(config: RegistryClientConfig) -> Result<Self, ProxyError> {
        // connect/read timeouts rather than a total one: tarball downloads
        // stream for as long as data keeps flowing
        let mut builder = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout);

        if !config.verify_ssl {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if let Some(proxy) = &config.http_proxy {
            builder = builder.proxy(reqwest::Proxy::http(proxy)?);
        }
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }

        let client = builder.build()?;

        info!("Created registry client for {}", config.host);

        Ok(Self { config, client })
    }

    /// Base URL of the upstream registry.
    fn base_url(&self) -> String {
        let scheme = if self.config.use_https { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.config.host, self.config.port)
    }

    /// Fetch the whole-package metadata document.
    pub async fn fetch_meta(&self, name: &str) -> Result<Bytes, ProxyError> {
        let url = format!("{}/{}", self.base_url(), name);
        debug!("Fetching metadata: {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        Ok(response.bytes().await?)
    }

    /// Fetch a version's tarball as a stream of chunks.
    pub async fn fetch_tarball(&self, name: &str, version: &str) -> Result<ByteStream, ProxyError> {
        let url = format!("{}/{}/-/{}-{}.tgz", self.base_url(), name, name, version);
        debug!("Fetching tarball: {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ProxyError::UpstreamStatus {
                status: status.as_u16(),
            });
        }

        Ok(Box::pin(response.bytes_stream().map_err(ProxyError::Http)))
    }

    /// Forward a request to the upstream verbatim and stream the response
    /// back without buffering.
    pub async fn forward<S, E>(
        &self,
        method: Method,
        path_and_query: &str,
        mut headers: HeaderMap,
        body: S,
    ) -> Result<ForwardedResponse, ProxyError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let url = format!("{}{}", self.base_url(), path_and_query);
        info!("Proxying request to registry: {} {}", method, path_and_query);

        // reqwest derives the Host header from the target URL
        headers.remove(header::HOST);

        let request = self
            .client
            .request(method.clone(), &url)
            .headers(headers);

        // GET/HEAD carry no body; a streamed empty body would force chunked
        // encoding on the upstream request
        let request = if matches!(method, Method::GET | Method::HEAD) {
            request
        } else {
            request.body(reqwest::Body::wrap_stream(body))
        };

        let response = request.send().await?;
        let status = response.status();
        let mut headers = response.headers().clone();
        // the response body is re-framed when streamed back out
        headers.remove(header::TRANSFER_ENCODING);
        headers.remove(header::CONNECTION);

        debug!("Upstream response: {} for {}", status, path_and_query);

        Ok(ForwardedResponse {
            status,
            headers,
            body: Box::pin(response.bytes_stream().map_err(ProxyError::Http)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::routing::get;
    use futures::StreamExt;

    fn test_config(port: u16) -> RegistryClientConfig {
        RegistryClientConfig {
            host: "127.0.0.1".to_string(),
            port,
            use_https: false,
            verify_ssl: true,
            http_proxy: None,
            https_proxy: None,
            timeout: Duration::from_secs(5),
        }
    }

    async fn spawn_upstream(app: Router) -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn fetch_meta_returns_body() {
        let app = Router::new().route("/foo", get(|| async { r#"{"name":"foo"}"# }));
        let port = spawn_upstream(app).await;
        let client = RegistryClient::new(test_config(port)).unwrap();

        let body = client.fetch_meta("foo").await.unwrap();
        assert_eq!(body, Bytes::from_static(br#"{"name":"foo"}"#));
    }

    #[tokio::test]
    async fn fetch_meta_maps_non_200_to_upstream_status() {
        let app = Router::new();
        let port = spawn_upstream(app).await;
        let client = RegistryClient::new(test_config(port)).unwrap();

        let err = client.fetch_meta("missing").await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamStatus { status: 404 }));
    }

    #[tokio::test]
    async fn fetch_tarball_streams_chunks() {
        let app = Router::new().route(
            "/foo/-/foo-1.0.0.tgz",
            get(|| async { Bytes::from_static(b"tarball-bytes") }),
        );
        let port = spawn_upstream(app).await;
        let client = RegistryClient::new(test_config(port)).unwrap();

        let mut stream = client.fetch_tarball("foo", "1.0.0").await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"tarball-bytes");
    }

    #[tokio::test]
    async fn forward_relays_status_and_body() {
        let app = Router::new().route("/-/ping", get(|| async { "pong" }));
        let port = spawn_upstream(app).await;
        let client = RegistryClient::new(test_config(port)).unwrap();

        let forwarded = client
            .forward(
                Method::GET,
                "/-/ping",
                HeaderMap::new(),
                futures::stream::empty::<Result<Bytes, std::io::Error>>(),
            )
            .await
            .unwrap();

        assert_eq!(forwarded.status, StatusCode::OK);
        let mut body = forwarded.body;
        let mut collected = Vec::new();
        while let Some(chunk) = body.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"pong");
    }
}
