//! Deterministic ids for recorded mappings
//!
//! Each captured request is hashed together with the hash of the request
//! captured before it, so repeating the same recording session produces the
//! same ids while identical requests within one session still get distinct ones.

use sha2::{Digest, Sha256};

/// Chain seed for the first request of a recording session
pub const CHAIN_HEAD_HASH: [u8; 32] = [0u8; 32];

/// Request fields that identify a captured exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedRequest {
    /// HTTP method
    pub method: String,
    /// Request path
    pub path: String,
    /// Raw query string, without `?`
    pub query: Option<String>,
    /// Request body
    pub body: Vec<u8>,
}

impl CapturedRequest {
    /// Path plus query string, as matched by a `url` predicate
    #[must_use]
    pub fn url(&self) -> String {
        match self.query.as_deref() {
            Some(q) if !q.is_empty() => format!("{}?{q}", self.path),
            _ => self.path.clone(),
        }
    }
}

/// Compute the SHA-256 fingerprint of a captured request
///
/// Covers the uppercase method, the normalized path, the query parameters
/// sorted by key, the body and the previous hash of the chain.
#[must_use]
pub fn fingerprint_request(request: &CapturedRequest, prev_hash: [u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();

    let method = request.method.to_uppercase();
    hasher.update((method.len() as u32).to_le_bytes());
    hasher.update(method.as_bytes());

    let path = normalize_path(&request.path);
    hasher.update((path.len() as u32).to_le_bytes());
    hasher.update(path.as_bytes());

    let mut query: Vec<&str> = request
        .query
        .as_deref()
        .unwrap_or_default()
        .split('&')
        .filter(|pair| !pair.is_empty())
        .collect();
    query.sort_unstable();
    hasher.update((query.len() as u32).to_le_bytes());
    for pair in query {
        hasher.update((pair.len() as u32).to_le_bytes());
        hasher.update(pair.as_bytes());
    }

    hasher.update((request.body.len() as u32).to_le_bytes());
    hasher.update(&request.body);

    hasher.update(prev_hash);

    hasher.finalize().into()
}

/// Render the first 16 bytes of a hash in UUID layout (8-4-4-4-12)
#[must_use]
pub fn mapping_id(hash: &[u8; 32]) -> String {
    let hex = hex::encode(&hash[..16]);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

/// Normalize a URL path
fn normalize_path(path: &str) -> String {
    let trimmed = path.trim();

    if trimmed.is_empty() || !trimmed.starts_with('/') {
        format!("/{trimmed}")
    } else {
        trimmed.to_string()
    }
}

/// Running hash over the requests of one recording session
#[derive(Debug, Clone, Copy)]
pub struct RequestChain {
    current_hash: [u8; 32],
}

impl RequestChain {
    /// Create a new request chain
    #[must_use]
    pub fn new() -> Self {
        Self {
            current_hash: CHAIN_HEAD_HASH,
        }
    }

    /// Process a request and return its id
    pub fn next_id(&mut self, request: &CapturedRequest) -> String {
        let hash = fingerprint_request(request, self.current_hash);
        self.current_hash = hash;
        mapping_id(&hash)
    }

    /// Reset the chain
    pub fn reset(&mut self) {
        self.current_hash = CHAIN_HEAD_HASH;
    }
}

impl Default for RequestChain {
    fn default() -> Self {
        Self::new()
    }
}
