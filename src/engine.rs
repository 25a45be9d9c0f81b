//! Request-matching engine behind the mapping store
//!
//! [`MatchingEngine`] is the narrow contract the rest of the crate consumes.
//! [`StubEngine`] is the in-process implementation: stubs and body files live
//! in memory, and while a proxy recording is active the mock listener hands
//! every forwarded exchange to [`MatchingEngine::capture`].

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, info};

use crate::archive::ArchiveContents;
use crate::fingerprint::{CapturedRequest, RequestChain};
use crate::mapping::{Mapping, RequestMatcher, RequestPattern, ResponseDefinition};
use crate::{Result, StubvaultError};

/// Response headers never copied into recorded mappings
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "content-length",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// One proxied request/response pair
#[derive(Debug, Clone)]
pub struct CapturedExchange {
    /// Request as received by the mock listener
    pub request: CapturedRequest,
    /// Upstream status code
    pub status: u16,
    /// Upstream response headers
    pub headers: Vec<(String, String)>,
    /// Upstream response body
    pub body: Vec<u8>,
}

/// Contract of the stub matching engine
///
/// Methods take `&mut self` for mutation; callers serialize access (the
/// mapping store holds the engine behind one readers-writer lock).
pub trait MatchingEngine: Send + Sync {
    /// Register a stub, replacing any stub with the same id in place
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` if the request predicate cannot be compiled
    fn add_stub(&mut self, mapping: Mapping) -> Result<()>;

    /// All stubs in insertion order
    fn all_stubs(&self) -> Vec<Mapping>;

    /// Number of registered stubs
    fn stub_count(&self) -> usize;

    /// First stub, in insertion order, matching the request
    fn find_stub(&self, method: &str, path: &str, query: Option<&str>) -> Option<&Mapping>;

    /// Remove every stub and body file
    fn reset_all(&mut self);

    /// Begin proxying to `upstream`, capturing every exchange
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRecording` if a recording is active
    fn start_proxy_recording(&mut self, upstream: &str) -> Result<()>;

    /// End the recording, turning captured exchanges into stubs
    ///
    /// Returns the recorded mappings and the body files they reference.
    ///
    /// # Errors
    ///
    /// Returns `NotRecording` if no recording is active
    fn stop_proxy_recording(&mut self) -> Result<ArchiveContents>;

    /// Upstream of the active recording
    fn recording_target(&self) -> Option<&str>;

    /// Buffer one exchange; returns false (and drops it) when not recording
    fn capture(&mut self, exchange: CapturedExchange) -> bool;

    /// Body file by name relative to `__files/`
    fn body_file(&self, name: &str) -> Option<&[u8]>;

    /// Store a body file
    fn put_body_file(&mut self, name: String, data: Vec<u8>);

    /// All body files keyed by name
    fn body_files(&self) -> &BTreeMap<String, Vec<u8>>;

    /// Whether the mock listener is serving
    fn is_running(&self) -> bool;

    /// Mark the mock listener as serving or stopped
    fn set_running(&mut self, running: bool);

    /// Port of the mock listener
    fn port(&self) -> u16;
}

struct Stub {
    mapping: Mapping,
    matcher: RequestMatcher,
}

struct ActiveRecording {
    upstream: String,
    exchanges: Vec<CapturedExchange>,
}

/// In-memory matching engine
pub struct StubEngine {
    stubs: Vec<Stub>,
    index: HashMap<String, usize>,
    bodies: BTreeMap<String, Vec<u8>>,
    recording: Option<ActiveRecording>,
    inline_body_limit: usize,
    port: u16,
    running: bool,
}

impl StubEngine {
    /// Create an empty engine for the mock listener on `port`
    ///
    /// Recorded bodies up to `inline_body_limit` bytes are kept inline.
    #[must_use]
    pub fn new(port: u16, inline_body_limit: usize) -> Self {
        Self {
            stubs: Vec::new(),
            index: HashMap::new(),
            bodies: BTreeMap::new(),
            recording: None,
            inline_body_limit,
            port,
            running: false,
        }
    }

    /// Convert one captured exchange into a mapping plus optional body file
    fn to_mapping(&self, id: String, exchange: CapturedExchange) -> (Mapping, Option<(String, Vec<u8>)>) {
        let mut headers = BTreeMap::new();
        for (name, value) in exchange.headers {
            let name = name.to_ascii_lowercase();
            if HOP_BY_HOP_HEADERS.contains(&name.as_str()) {
                continue;
            }
            headers
                .entry(name)
                .and_modify(|existing: &mut String| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }

        let content_type = headers.get("content-type").cloned().unwrap_or_default();
        let mut response = ResponseDefinition {
            status: exchange.status,
            headers,
            ..ResponseDefinition::default()
        };

        let mut body_file = None;
        if !exchange.body.is_empty() {
            let text = std::str::from_utf8(&exchange.body)
                .ok()
                .filter(|_| exchange.body.len() <= self.inline_body_limit);

            match text {
                Some(text) if content_type.contains("json") => {
                    match serde_json::from_str::<serde_json::Value>(text) {
                        Ok(value) => response.json_body = Some(value),
                        Err(_) => response.body = Some(text.to_string()),
                    }
                }
                Some(text) => response.body = Some(text.to_string()),
                None => {
                    let file_name = format!("{id}.{}", extension_for(&content_type));
                    response.body_file_name = Some(file_name.clone());
                    body_file = Some((file_name, exchange.body));
                }
            }
        }

        let mapping = Mapping {
            id,
            request: RequestPattern {
                method: exchange.request.method.to_uppercase(),
                url: Some(exchange.request.url()),
                ..RequestPattern::default()
            },
            response,
            extra: serde_json::Map::new(),
        };

        (mapping, body_file)
    }
}

impl MatchingEngine for StubEngine {
    fn add_stub(&mut self, mapping: Mapping) -> Result<()> {
        let matcher = RequestMatcher::compile(&mapping.request)?;

        if let Some(&position) = self.index.get(&mapping.id) {
            debug!("Replacing stub: {}", mapping.id);
            self.stubs[position] = Stub { mapping, matcher };
        } else {
            self.index.insert(mapping.id.clone(), self.stubs.len());
            self.stubs.push(Stub { mapping, matcher });
        }

        Ok(())
    }

    fn all_stubs(&self) -> Vec<Mapping> {
        self.stubs.iter().map(|stub| stub.mapping.clone()).collect()
    }

    fn stub_count(&self) -> usize {
        self.stubs.len()
    }

    fn find_stub(&self, method: &str, path: &str, query: Option<&str>) -> Option<&Mapping> {
        self.stubs
            .iter()
            .find(|stub| stub.matcher.matches(method, path, query))
            .map(|stub| &stub.mapping)
    }

    fn reset_all(&mut self) {
        self.stubs.clear();
        self.index.clear();
        self.bodies.clear();
    }

    fn start_proxy_recording(&mut self, upstream: &str) -> Result<()> {
        if let Some(active) = &self.recording {
            return Err(StubvaultError::AlreadyRecording {
                upstream: active.upstream.clone(),
            });
        }

        info!("Proxy recording started against {}", upstream);
        self.recording = Some(ActiveRecording {
            upstream: upstream.to_string(),
            exchanges: Vec::new(),
        });
        Ok(())
    }

    fn stop_proxy_recording(&mut self) -> Result<ArchiveContents> {
        let active = self.recording.take().ok_or(StubvaultError::NotRecording)?;

        let mut chain = RequestChain::new();
        let mut recorded = ArchiveContents::default();

        for exchange in active.exchanges {
            let id = chain.next_id(&exchange.request);
            let (mapping, body_file) = self.to_mapping(id, exchange);

            if let Some((name, data)) = body_file {
                self.bodies.insert(name.clone(), data.clone());
                recorded.bodies.insert(name, data);
            }
            self.add_stub(mapping.clone())?;
            recorded.mappings.push(mapping);
        }

        info!(
            "Proxy recording against {} stopped: {} exchanges",
            active.upstream,
            recorded.mappings.len()
        );
        Ok(recorded)
    }

    fn recording_target(&self) -> Option<&str> {
        self.recording.as_ref().map(|active| active.upstream.as_str())
    }

    fn capture(&mut self, exchange: CapturedExchange) -> bool {
        match &mut self.recording {
            Some(active) => {
                debug!(
                    "Captured {} {} -> {}",
                    exchange.request.method,
                    exchange.request.url(),
                    exchange.status
                );
                active.exchanges.push(exchange);
                true
            }
            None => {
                debug!("Dropping exchange captured after recording stopped");
                false
            }
        }
    }

    fn body_file(&self, name: &str) -> Option<&[u8]> {
        self.bodies.get(name).map(Vec::as_slice)
    }

    fn put_body_file(&mut self, name: String, data: Vec<u8>) {
        self.bodies.insert(name, data);
    }

    fn body_files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.bodies
    }

    fn is_running(&self) -> bool {
        self.running
    }

    fn set_running(&mut self, running: bool) {
        self.running = running;
    }

    fn port(&self) -> u16 {
        self.port
    }
}

fn extension_for(content_type: &str) -> &'static str {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    match essence.as_str() {
        t if t.ends_with("json") => "json",
        "text/html" => "html",
        t if t.ends_with("xml") => "xml",
        "text/plain" => "txt",
        "text/css" => "css",
        "application/javascript" | "text/javascript" => "js",
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "application/pdf" => "pdf",
        _ => "bin",
    }
}
