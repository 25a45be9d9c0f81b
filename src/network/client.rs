//! Outbound HTTP client shared by the remote storage backends and the
//! recording proxy

use std::time::Duration;

use http_body_util::{BodyExt, Full};
use bytes::Bytes;
use hyper::{Method, Request, Uri};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, warn};

use crate::{Result, StubvaultError};

/// HTTP(S) client with a per-attempt timeout and one retry on transport failure
#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    timeout: Duration,
}

impl HttpClient {
    /// Create a new HTTP client
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_or_http()
            .enable_http1()
            .build();

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build(connector);

        Self { client, timeout }
    }

    /// Send a request, retrying once if the first attempt fails to connect
    /// or times out
    ///
    /// Any HTTP status is a successful exchange; callers interpret it.
    ///
    /// # Errors
    ///
    /// Returns error if both attempts fail at the transport level
    pub async fn send(&self, request: &OutboundRequest) -> Result<ForwardedResponse> {
        match self.attempt(request).await {
            Ok(response) => Ok(response),
            Err(first) => {
                warn!("{} {} failed, retrying once: {}", request.method, request.uri, first);
                self.attempt(request).await
            }
        }
    }

    async fn attempt(&self, request: &OutboundRequest) -> Result<ForwardedResponse> {
        debug!("Sending {} {}", request.method, request.uri);

        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.uri.clone());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let http_request = builder
            .body(Full::new(request.body.clone()))
            .map_err(|e| StubvaultError::Other(format!("Failed to build request: {e}")))?;

        let exchange = async {
            let response = self
                .client
                .request(http_request)
                .await
                .map_err(|e| StubvaultError::Other(format!("Request failed: {e}")))?;

            let status = response.status().as_u16();
            let headers: Vec<(String, String)> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        value.to_str().unwrap_or("<invalid>").to_string(),
                    )
                })
                .collect();

            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| StubvaultError::Other(format!("Failed to read response body: {e}")))?
                .to_bytes();

            Ok(ForwardedResponse {
                status,
                headers,
                body,
            })
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| {
                StubvaultError::Other(format!(
                    "Request timed out after {} ms",
                    self.timeout.as_millis()
                ))
            })?
    }
}

/// Request to send
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    /// HTTP method
    pub method: Method,
    /// Absolute target URI
    pub uri: Uri,
    /// Request headers
    pub headers: Vec<(String, String)>,
    /// Request body
    pub body: Bytes,
}

impl OutboundRequest {
    /// Request without headers or body
    #[must_use]
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Add a header
    #[must_use]
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// Set the body
    #[must_use]
    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// Response from an outbound request
#[derive(Debug, Clone)]
pub struct ForwardedResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Bytes,
}

impl ForwardedResponse {
    /// Whether the status is 2xx
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Body as lossy UTF-8, truncated for log and error messages
    #[must_use]
    pub fn body_excerpt(&self) -> String {
        let text = String::from_utf8_lossy(&self.body);
        text.chars().take(200).collect()
    }
}

/// Build a URI from a base URL, a path and query parameters
///
/// Path segments are percent-encoded individually; `/` separators are kept.
///
/// # Errors
///
/// Returns error if the result is not a valid URI
pub fn build_uri(base: &str, path: &str, query: &[(&str, &str)]) -> Result<Uri> {
    let mut uri = base.trim_end_matches('/').to_string();

    for segment in path.split('/').filter(|s| !s.is_empty()) {
        uri.push('/');
        uri.push_str(&urlencoding::encode(segment));
    }

    if !query.is_empty() {
        uri.push('?');
        for (i, (key, value)) in query.iter().enumerate() {
            if i > 0 {
                uri.push('&');
            }
            uri.push_str(&urlencoding::encode(key));
            uri.push('=');
            uri.push_str(&urlencoding::encode(value));
        }
    }

    uri.parse::<Uri>()
        .map_err(|e| StubvaultError::Other(format!("Invalid URI '{uri}': {e}")))
}
