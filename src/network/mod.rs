//! Network layer for Stubvault
//!
//! Two HTTP/1.1 listeners share one connection pool: the admin listener
//! serves the snapshot and recording API, and the mock listener answers from
//! stubs or proxies to the recording upstream. The outbound client is used
//! for proxying and by the remote storage backends.

mod admin;
mod client;
mod connection_pool;
mod handler;
mod http;
mod mock;

pub use admin::AdminApi;
pub use client::{build_uri, ForwardedResponse, HttpClient, OutboundRequest};
pub use connection_pool::{ConnectionGuard, ConnectionPool};
pub use handler::NetworkHandler;
pub use http::{
    create_response, error_response, json_response, query_param, raw_response, read_body,
    text_response, validate_request, HttpResponse,
};
pub use mock::{MockRequest, MockService};

/// Maximum number of concurrent connections
pub const MAX_CONNECTIONS: usize = 4096;

/// Graceful shutdown timeout
pub const SHUTDOWN_TIMEOUT_MS: u64 = 5000;
