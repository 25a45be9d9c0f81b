//! Response builders and request guards shared by both listeners

use http_body_util::{BodyExt, Full};
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::config::LimitsConfig;
use crate::{Result, StubvaultError};

/// Response type produced by every route
pub type HttpResponse = Response<Full<Bytes>>;

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

/// Response with a body and content type
#[must_use]
pub fn create_response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

/// Plain text response
#[must_use]
pub fn text_response(status: StatusCode, body: impl Into<String>) -> HttpResponse {
    create_response(status, TEXT, body.into())
}

/// JSON response; a serialization failure becomes a 500
#[must_use]
pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> HttpResponse {
    match serde_json::to_vec(value) {
        Ok(body) => create_response(status, JSON, body),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            create_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                JSON,
                r#"{"error":"Failed to serialize response"}"#,
            )
        }
    }
}

/// `{"error": message}` with the status class of `error`
#[must_use]
pub fn error_response(error: &StubvaultError) -> HttpResponse {
    let status = error.status_code();
    if status.is_server_error() {
        error!("Request failed: {}", error);
    } else {
        warn!("Request rejected: {}", error);
    }
    json_response(status, &serde_json::json!({ "error": error.to_string() }))
}

/// Response with arbitrary headers; invalid header names or values are
/// skipped
#[must_use]
pub fn raw_response<'a>(
    status: u16,
    headers: impl IntoIterator<Item = (&'a str, &'a str)>,
    body: impl Into<Bytes>,
) -> HttpResponse {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().append(name, value);
            }
            _ => debug!("Skipping invalid header: {}", name),
        }
    }

    response
}

/// Reject requests that declare an oversized body or carry too many headers
///
/// # Errors
///
/// Returns `DataTooLarge` for an oversized body, `Other` for too many headers
pub fn validate_request<B>(request: &Request<B>, limits: &LimitsConfig) -> Result<()> {
    let declared = request
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<usize>().ok());

    if let Some(length) = declared {
        if length > limits.max_request_size {
            return Err(StubvaultError::DataTooLarge {
                size: length,
                limit: limits.max_request_size,
            });
        }
    }

    let header_count = request.headers().len();
    if header_count > limits.max_headers {
        return Err(StubvaultError::Other(format!(
            "Too many headers: {header_count}"
        )));
    }

    Ok(())
}

/// Read a request body with a size limit
///
/// # Errors
///
/// Returns error if the body is too large or the read fails
pub async fn read_body<B>(body: B, max_size: usize) -> Result<Bytes>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let limited = http_body_util::Limited::new(body, max_size);
    let collected = limited.collect().await.map_err(|e| {
        if e.is::<http_body_util::LengthLimitError>() {
            StubvaultError::DataTooLarge {
                size: max_size + 1,
                limit: max_size,
            }
        } else {
            StubvaultError::Other(format!("Failed to read body: {e}"))
        }
    })?;

    Ok(collected.to_bytes())
}

/// Split a raw query string into decoded key/value pairs
#[must_use]
pub fn query_pairs(query: Option<&str>) -> Vec<(String, String)> {
    query
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

/// First value of `key` in a raw query string
#[must_use]
pub fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query_pairs(query)
        .into_iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v)
}

/// Percent-decode one URL component, treating `+` as a space
#[must_use]
pub fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).map_or_else(|_| spaced.clone(), |decoded| decoded.into_owned())
}
