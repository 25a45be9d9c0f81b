//! Stub mapping data model
//!
//! A mapping pairs a request predicate with a canned response. The JSON shape
//! follows the WireMock mapping format so archives stay portable.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::archive::normalize_entry_path;
use crate::fingerprint::mapping_id;
use crate::{Result, StubvaultError};

/// Method wildcard accepted in request predicates
pub const ANY_METHOD: &str = "ANY";

/// One request-predicate/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mapping {
    /// Identifier, unique within a store
    #[serde(default)]
    pub id: String,
    /// Request predicate
    pub request: RequestPattern,
    /// Response served on match
    pub response: ResponseDefinition,
    /// Fields kept verbatim (`uuid`, `name`, `priority`, `metadata`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Request predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
    /// HTTP method, or `ANY`
    #[serde(default = "any_method")]
    pub method: String,
    /// Exact path including query string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Exact path, query string ignored
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    /// Regex over path and query string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_pattern: Option<String>,
    /// Regex over the path only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_path_pattern: Option<String>,
    /// Matchers this engine does not evaluate, kept for round-trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for RequestPattern {
    fn default() -> Self {
        Self {
            method: any_method(),
            url: None,
            url_path: None,
            url_pattern: None,
            url_path_pattern: None,
            extra: Map::new(),
        }
    }
}

fn any_method() -> String {
    ANY_METHOD.to_string()
}

/// Canned response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseDefinition {
    /// Status code
    #[serde(default = "ok_status")]
    pub status: u16,
    /// Response headers, sorted by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    /// Inline text body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    /// Inline JSON body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_body: Option<serde_json::Value>,
    /// Inline binary body, base64 encoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base64_body: Option<String>,
    /// Body stored as a file under `__files/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_file_name: Option<String>,
    /// Fields kept verbatim (`fixedDelayMilliseconds`, `transformers`, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn ok_status() -> u16 {
    200
}

impl Default for ResponseDefinition {
    fn default() -> Self {
        Self {
            status: ok_status(),
            headers: BTreeMap::new(),
            body: None,
            json_body: None,
            base64_body: None,
            body_file_name: None,
            extra: Map::new(),
        }
    }
}

impl Mapping {
    /// Build a `GET <url>` mapping answering with an inline body
    #[must_use]
    pub fn get(id: impl Into<String>, url: impl Into<String>, status: u16, body: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            request: RequestPattern {
                method: "GET".to_string(),
                url: Some(url.into()),
                ..RequestPattern::default()
            },
            response: ResponseDefinition {
                status,
                body: Some(body.into()),
                ..ResponseDefinition::default()
            },
            extra: Map::new(),
        }
    }

    /// Parse and validate one mapping document
    ///
    /// A document without `id` takes its `uuid`, or failing that an id
    /// derived from the SHA-256 of the document.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` if the JSON is malformed or the mapping is unusable
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let mut mapping: Self = serde_json::from_slice(data)
            .map_err(|e| StubvaultError::InvalidMapping(format!("Failed to parse mapping: {e}")))?;
        if mapping.id.is_empty() {
            mapping.id = match mapping.extra.get("uuid").and_then(Value::as_str) {
                Some(uuid) if validate_id(uuid).is_ok() => uuid.to_string(),
                _ => {
                    let hash: [u8; 32] = Sha256::digest(data).into();
                    mapping_id(&hash)
                }
            };
        }
        mapping.validate()?;
        Ok(mapping)
    }

    /// Canonical serialization (pretty JSON, trailing newline)
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn to_json(&self) -> Result<Vec<u8>> {
        let mut data = serde_json::to_vec_pretty(self)
            .map_err(|e| StubvaultError::InvalidMapping(format!("Failed to serialize mapping: {e}")))?;
        data.push(b'\n');
        Ok(data)
    }

    /// File name of this mapping inside `mappings/`
    #[must_use]
    pub fn file_name(&self) -> String {
        format!("{}.json", self.id)
    }

    /// Check structural rules the matching engine relies on
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` describing the first violated rule
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;

        if self.request.method.trim().is_empty() {
            return Err(StubvaultError::InvalidMapping(format!(
                "Mapping {}: method cannot be empty",
                self.id
            )));
        }

        for (key, pattern) in [
            ("urlPattern", &self.request.url_pattern),
            ("urlPathPattern", &self.request.url_path_pattern),
        ] {
            if let Some(pattern) = pattern {
                Regex::new(pattern).map_err(|e| {
                    StubvaultError::InvalidMapping(format!("Mapping {}: bad {key}: {e}", self.id))
                })?;
            }
        }

        let response = &self.response;
        if !(100..=999).contains(&response.status) {
            return Err(StubvaultError::InvalidMapping(format!(
                "Mapping {}: status {} out of range",
                self.id, response.status
            )));
        }

        let sources = [
            response.body.is_some(),
            response.json_body.is_some(),
            response.base64_body.is_some(),
            response.body_file_name.is_some(),
        ];
        if sources.iter().filter(|set| **set).count() > 1 {
            return Err(StubvaultError::InvalidMapping(format!(
                "Mapping {}: at most one of body, jsonBody, base64Body, bodyFileName",
                self.id
            )));
        }

        if let Some(file) = &response.body_file_name {
            match normalize_entry_path(file) {
                Some(normalized) if normalized == *file => {}
                _ => {
                    return Err(StubvaultError::InvalidMapping(format!(
                        "Mapping {}: unsafe bodyFileName '{file}'",
                        self.id
                    )))
                }
            }
        }

        if let Some(encoded) = &response.base64_body {
            BASE64.decode(encoded).map_err(|e| {
                StubvaultError::InvalidMapping(format!("Mapping {}: bad base64Body: {e}", self.id))
            })?;
        }

        Ok(())
    }
}

impl ResponseDefinition {
    /// Relative file reference, if the body lives in `__files/`
    #[must_use]
    pub fn body_reference(&self) -> Option<&str> {
        self.body_file_name.as_deref()
    }

    /// Inline body bytes; `None` when the body is a file reference or absent
    #[must_use]
    pub fn inline_body(&self) -> Option<Vec<u8>> {
        if let Some(body) = &self.body {
            return Some(body.as_bytes().to_vec());
        }
        if let Some(json) = &self.json_body {
            return serde_json::to_vec(json).ok();
        }
        if let Some(encoded) = &self.base64_body {
            return BASE64.decode(encoded).ok();
        }
        None
    }
}

/// Mapping ids double as file names, so they follow the same rules as
/// snapshot names plus a restricted character set.
fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > 200 {
        return Err(StubvaultError::InvalidMapping(format!(
            "Mapping id must be 1..=200 bytes: '{id}'"
        )));
    }

    let allowed = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    if id.starts_with('.') || !id.chars().all(allowed) {
        return Err(StubvaultError::InvalidMapping(format!(
            "Mapping id contains unsupported characters: '{id}'"
        )));
    }

    Ok(())
}

/// Request predicate with its pattern compiled once
#[derive(Debug, Clone)]
pub struct RequestMatcher {
    method: String,
    url: Option<String>,
    url_path: Option<String>,
    url_pattern: Option<Regex>,
    url_path_pattern: Option<Regex>,
}

fn anchored(key: &str, pattern: Option<&str>) -> Result<Option<Regex>> {
    pattern
        .map(|p| Regex::new(&format!("^(?:{p})$")))
        .transpose()
        .map_err(|e| StubvaultError::InvalidMapping(format!("Bad {key}: {e}")))
}

impl RequestMatcher {
    /// Compile a request predicate
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` if a pattern is not a valid regex, or if the
    /// predicate uses a matcher (`bodyPatterns`, `headers`, ...) that cannot
    /// be evaluated here. Ignoring it would match more requests than intended.
    pub fn compile(pattern: &RequestPattern) -> Result<Self> {
        if let Some(key) = pattern.extra.keys().next() {
            return Err(StubvaultError::InvalidMapping(format!(
                "Unsupported request matcher '{key}'"
            )));
        }

        Ok(Self {
            method: pattern.method.to_uppercase(),
            url: pattern.url.clone(),
            url_path: pattern.url_path.clone(),
            url_pattern: anchored("urlPattern", pattern.url_pattern.as_deref())?,
            url_path_pattern: anchored("urlPathPattern", pattern.url_path_pattern.as_deref())?,
        })
    }

    /// Whether a request with this method, path and raw query matches
    #[must_use]
    pub fn matches(&self, method: &str, path: &str, query: Option<&str>) -> bool {
        if self.method != ANY_METHOD && !self.method.eq_ignore_ascii_case(method) {
            return false;
        }

        let full = match query {
            Some(q) if !q.is_empty() => format!("{path}?{q}"),
            _ => path.to_string(),
        };

        if let Some(url) = &self.url {
            if *url != full {
                return false;
            }
        }
        if let Some(url_path) = &self.url_path {
            if url_path != path {
                return false;
            }
        }
        if let Some(pattern) = &self.url_pattern {
            if !pattern.is_match(&full) {
                return false;
            }
        }
        if let Some(pattern) = &self.url_path_pattern {
            if !pattern.is_match(path) {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_wiremock_document() {
        let json = br#"{
            "id": "0b6f1a52-6d3c-4f21-9a1e-2c5b7e3d9f10",
            "request": { "method": "GET", "url": "/api/clients/1" },
            "response": {
                "status": 200,
                "headers": { "Content-Type": "application/json" },
                "jsonBody": { "id": 1 }
            }
        }"#;

        let mapping = Mapping::from_json(json).unwrap();
        assert_eq!(mapping.request.method, "GET");
        assert_eq!(mapping.request.url.as_deref(), Some("/api/clients/1"));
        assert_eq!(mapping.response.inline_body().unwrap(), br#"{"id":1}"#.to_vec());
    }

    #[test]
    fn test_method_defaults_to_any() {
        let json = br#"{"id":"m1","request":{"urlPath":"/x"},"response":{"status":204}}"#;
        let mapping = Mapping::from_json(json).unwrap();

        assert_eq!(mapping.request.method, ANY_METHOD);
        let matcher = RequestMatcher::compile(&mapping.request).unwrap();
        assert!(matcher.matches("DELETE", "/x", Some("a=1")));
    }

    #[test]
    fn test_rejects_multiple_body_sources() {
        let mut mapping = Mapping::get("m1", "/a", 200, "text");
        mapping.response.body_file_name = Some("a.json".to_string());

        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_rejects_traversal_in_body_file() {
        let mut mapping = Mapping::get("m1", "/a", 200, "text");
        mapping.response.body = None;
        mapping.response.body_file_name = Some("../secret".to_string());

        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_rejects_path_like_id() {
        let mapping = Mapping::get("../m1", "/a", 200, "x");
        assert!(mapping.validate().is_err());

        let mapping = Mapping::get("", "/a", 200, "x");
        assert!(mapping.validate().is_err());
    }

    #[test]
    fn test_url_matches_query_exactly() {
        let mapping = Mapping::get("m1", "/search?q=rust", 200, "");
        let matcher = RequestMatcher::compile(&mapping.request).unwrap();

        assert!(matcher.matches("GET", "/search", Some("q=rust")));
        assert!(!matcher.matches("GET", "/search", Some("q=go")));
        assert!(!matcher.matches("POST", "/search", Some("q=rust")));
    }

    #[test]
    fn test_url_pattern_is_anchored() {
        let pattern = RequestPattern {
            method: "GET".to_string(),
            url_pattern: Some("/api/clients/[0-9]+".to_string()),
            ..RequestPattern::default()
        };
        let matcher = RequestMatcher::compile(&pattern).unwrap();

        assert!(matcher.matches("get", "/api/clients/42", None));
        assert!(!matcher.matches("GET", "/api/clients/42/orders", None));
    }

    #[test]
    fn test_serialization_is_stable() {
        let mut mapping = Mapping::get("m1", "/a", 200, "hello");
        mapping
            .response
            .headers
            .insert("X-B".to_string(), "2".to_string());
        mapping
            .response
            .headers
            .insert("X-A".to_string(), "1".to_string());

        let first = mapping.to_json().unwrap();
        let second = Mapping::from_json(&first).unwrap().to_json().unwrap();
        assert_eq!(first, second);

        let text = String::from_utf8(first).unwrap();
        assert!(text.find("X-A").unwrap() < text.find("X-B").unwrap());
    }

    const ORDER_STUB: &[u8] = br#"{
        "id": "a",
        "priority": 1,
        "request": {
            "method": "POST",
            "urlPathPattern": "/orders/[0-9]+",
            "bodyPatterns": [{ "matchesJsonPath": "$.sku" }]
        },
        "response": { "status": 201, "fixedDelayMilliseconds": 50 }
    }"#;

    #[test]
    fn test_unknown_fields_survive_round_trip() {
        let mapping = Mapping::from_json(ORDER_STUB).unwrap();
        assert_eq!(mapping.request.url_path_pattern.as_deref(), Some("/orders/[0-9]+"));

        let encoded: serde_json::Value =
            serde_json::from_slice(&mapping.to_json().unwrap()).unwrap();
        let original: serde_json::Value = serde_json::from_slice(ORDER_STUB).unwrap();
        assert_eq!(encoded, original);
    }

    #[test]
    fn test_unsupported_matcher_does_not_compile() {
        let mapping = Mapping::from_json(ORDER_STUB).unwrap();
        let result = RequestMatcher::compile(&mapping.request);

        assert!(matches!(result, Err(StubvaultError::InvalidMapping(ref m)) if m.contains("bodyPatterns")));
    }

    #[test]
    fn test_url_path_pattern_ignores_query() {
        let pattern = RequestPattern {
            method: "POST".to_string(),
            url_path_pattern: Some("/orders/[0-9]+".to_string()),
            ..RequestPattern::default()
        };
        let matcher = RequestMatcher::compile(&pattern).unwrap();

        assert!(matcher.matches("POST", "/orders/7", Some("expand=lines")));
        assert!(!matcher.matches("POST", "/totally/unrelated", None));
        assert!(!matcher.matches("POST", "/orders/7/lines", None));
    }

    #[test]
    fn test_missing_id_taken_from_uuid() {
        let json = br#"{"uuid":"5d1f0c2e-1111-4c2a-9b7e-0f5c3a2b1d00","request":{"url":"/a"},"response":{}}"#;
        let mapping = Mapping::from_json(json).unwrap();

        assert_eq!(mapping.id, "5d1f0c2e-1111-4c2a-9b7e-0f5c3a2b1d00");
    }

    #[test]
    fn test_missing_id_derived_from_content() {
        let json = br#"{"request":{"url":"/a"},"response":{"body":"x"}}"#;
        let first = Mapping::from_json(json).unwrap();
        let second = Mapping::from_json(json).unwrap();
        let other = Mapping::from_json(br#"{"request":{"url":"/b"},"response":{}}"#).unwrap();

        assert_eq!(first.id, second.id);
        assert_ne!(first.id, other.id);
        assert!(first.validate().is_ok());
    }
}
