//! Mock listener: serve stubs, or proxy and capture while recording

use std::sync::Arc;

use bytes::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, StatusCode, Uri};
use serde_json::json;
use tracing::{debug, warn};

use super::client::OutboundRequest;
use super::http::{error_response, json_response, raw_response, HttpResponse};
use crate::app::App;
use crate::engine::CapturedExchange;
use crate::fingerprint::CapturedRequest;
use crate::StubvaultError;

/// Request headers never forwarded upstream
const SKIPPED_REQUEST_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "host",
    "keep-alive",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Response headers never relayed back to the client
const SKIPPED_RESPONSE_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// Inbound request as seen by the mock listener
#[derive(Debug, Clone)]
pub struct MockRequest {
    /// HTTP method
    pub method: Method,
    /// Request path
    pub path: String,
    /// Raw query string
    pub query: Option<String>,
    /// Request headers
    pub headers: HeaderMap,
    /// Request body
    pub body: Bytes,
}

/// Handler for the mock listener
pub struct MockService {
    app: Arc<App>,
}

impl MockService {
    /// Create the handler
    #[must_use]
    pub fn new(app: Arc<App>) -> Self {
        Self { app }
    }

    /// Answer one request
    pub async fn handle(&self, request: MockRequest) -> HttpResponse {
        match self.app.store.recording_target().await {
            Some(upstream) => self.proxy(&upstream, request).await,
            None => self.serve(&request).await,
        }
    }

    async fn serve(&self, request: &MockRequest) -> HttpResponse {
        let found = self
            .app
            .store
            .find_match(request.method.as_str(), &request.path, request.query.as_deref())
            .await;

        match found {
            Ok(Some(stub)) => {
                debug!("{} {} matched {}", request.method, request.path, stub.mapping_id);
                raw_response(
                    stub.status,
                    stub.headers.iter().map(|(k, v)| (k.as_str(), v.as_str())),
                    stub.body,
                )
            }
            Ok(None) => {
                debug!("No stub for {} {}", request.method, request.path);
                json_response(
                    StatusCode::NOT_FOUND,
                    &json!({
                        "error": "No stub mapping matches the request",
                        "method": request.method.as_str(),
                        "path": request.path,
                    }),
                )
            }
            Err(e) => error_response(&e),
        }
    }

    async fn proxy(&self, upstream: &str, request: MockRequest) -> HttpResponse {
        let target = match upstream_uri(upstream, &request.path, request.query.as_deref()) {
            Ok(uri) => uri,
            Err(e) => return error_response(&e),
        };

        let mut outbound = OutboundRequest::new(request.method.clone(), target);
        for (name, value) in &request.headers {
            if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
                continue;
            }
            if let Ok(value) = value.to_str() {
                outbound = outbound.header(name.as_str(), value);
            }
        }
        let outbound = outbound.body(request.body.clone());

        let response = match self.app.client.send(&outbound).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Upstream {} unreachable: {}", upstream, e);
                return json_response(
                    StatusCode::BAD_GATEWAY,
                    &json!({ "error": format!("Upstream unreachable: {upstream}") }),
                );
            }
        };

        if response.body.len() > self.app.config.limits.max_response_size {
            return error_response(&StubvaultError::DataTooLarge {
                size: response.body.len(),
                limit: self.app.config.limits.max_response_size,
            });
        }

        let relay = raw_response(
            response.status,
            response
                .headers
                .iter()
                .filter(|(name, _)| !SKIPPED_RESPONSE_HEADERS.contains(&name.to_ascii_lowercase().as_str()))
                .map(|(k, v)| (k.as_str(), v.as_str())),
            response.body.clone(),
        );

        let exchange = CapturedExchange {
            request: CapturedRequest {
                method: request.method.as_str().to_string(),
                path: request.path,
                query: request.query,
                body: request.body.to_vec(),
            },
            status: response.status,
            headers: response.headers,
            body: response.body.to_vec(),
        };
        if !self.app.store.capture(exchange).await {
            debug!("Recording stopped while proxying; exchange not captured");
        }

        relay
    }
}

/// Upstream URI for a proxied request; the path and query are kept as sent
fn upstream_uri(upstream: &str, path: &str, query: Option<&str>) -> crate::Result<Uri> {
    let mut uri = format!("{}{}", upstream.trim_end_matches('/'), path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        uri.push('?');
        uri.push_str(query);
    }
    uri.parse()
        .map_err(|e| StubvaultError::Other(format!("Invalid upstream URI '{uri}': {e}")))
}
