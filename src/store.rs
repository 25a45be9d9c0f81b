//! Mapping store façade
//!
//! All access to the matching engine goes through one readers-writer lock.
//! Serving and export take the read side; bulk replacement takes the write
//! side for the whole reset-then-load sequence, so concurrent readers see
//! either the old mapping set or the new one, never a mix.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::archive::{read_from_directory, ArchiveContents};
use crate::engine::{CapturedExchange, MatchingEngine};
use crate::mapping::{Mapping, RequestMatcher, RequestPattern, ResponseDefinition};
use crate::{Result, StubvaultError};

/// Response materialized for the mock listener
#[derive(Debug, Clone, PartialEq)]
pub struct StubResponse {
    /// Id of the mapping that matched
    pub mapping_id: String,
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: BTreeMap<String, String>,
    /// Response body
    pub body: Vec<u8>,
}

/// Engine state summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineStatus {
    /// Whether the mock listener is serving
    pub running: bool,
    /// Mock listener port
    pub port: u16,
    /// Number of registered mappings
    pub mappings: usize,
    /// Number of stored body files
    pub body_files: usize,
}

/// Thread-safe façade over a [`MatchingEngine`]
pub struct MappingStore {
    engine: RwLock<Box<dyn MatchingEngine>>,
}

static_assertions::assert_impl_all!(MappingStore: Send, Sync);

impl MappingStore {
    /// Wrap an engine
    #[must_use]
    pub fn new(engine: Box<dyn MatchingEngine>) -> Self {
        Self {
            engine: RwLock::new(engine),
        }
    }

    /// Register a mapping; an existing mapping with the same id is replaced
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` if the mapping is unusable
    pub async fn add_mapping(&self, mapping: Mapping) -> Result<()> {
        mapping.validate()?;
        self.engine.write().await.add_stub(mapping)
    }

    /// Store a response body file
    pub async fn put_body_file(&self, name: impl Into<String>, data: Vec<u8>) {
        self.engine.write().await.put_body_file(name.into(), data);
    }

    /// All mappings in insertion order
    pub async fn list_mappings(&self) -> Vec<Mapping> {
        self.engine.read().await.all_stubs()
    }

    /// Number of mappings
    pub async fn mapping_count(&self) -> usize {
        self.engine.read().await.stub_count()
    }

    /// Remove every mapping and body file
    pub async fn reset_all(&self) {
        self.engine.write().await.reset_all();
        info!("All mappings reset");
    }

    /// Add every mapping and body file found below `root`
    ///
    /// Unparseable mapping files are logged and skipped. Returns the number
    /// of mappings added.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    pub async fn load_from_directory(&self, root: &Path) -> Result<usize> {
        let contents = read_from_directory(root).await?;
        let mut engine = self.engine.write().await;

        for (name, data) in contents.bodies {
            engine.put_body_file(name, data);
        }

        let mut loaded = 0;
        for mapping in contents.mappings {
            let id = mapping.id.clone();
            match engine.add_stub(mapping) {
                Ok(()) => loaded += 1,
                Err(e) => warn!("Skipping mapping {}: {}", id, e),
            }
        }

        info!(
            "Loaded {} mappings from {} ({} skipped)",
            loaded,
            root.display(),
            contents.skipped
        );
        Ok(loaded)
    }

    /// Replace the whole store with the mappings and bodies below `root`
    ///
    /// Files are read and parsed before the lock is taken; the reset and the
    /// load then happen in one write-lock section.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read; the store is unchanged
    pub async fn replace_from_directory(&self, root: &Path) -> Result<usize> {
        let contents = read_from_directory(root).await?;
        if contents.skipped > 0 {
            warn!(
                "{} mapping files below {} were skipped",
                contents.skipped,
                root.display()
            );
        }

        self.replace_all(ArchiveContents {
            mappings: contents.mappings,
            bodies: contents.bodies,
        })
        .await
    }

    /// Replace the whole store with `contents` in one write-lock section
    ///
    /// # Errors
    ///
    /// Returns `InvalidMapping` if a mapping is unusable; the store is
    /// unchanged
    pub async fn replace_all(&self, contents: ArchiveContents) -> Result<usize> {
        // Validate outside the lock so a bad mapping cannot leave a half-loaded store
        for mapping in &contents.mappings {
            mapping.validate()?;
            RequestMatcher::compile(&mapping.request)
                .map_err(|e| StubvaultError::InvalidMapping(format!("Mapping {}: {e}", mapping.id)))?;
        }

        let count = contents.mappings.len();
        let mut engine = self.engine.write().await;
        engine.reset_all();
        for (name, data) in contents.bodies {
            engine.put_body_file(name, data);
        }
        for mapping in contents.mappings {
            engine.add_stub(mapping)?;
        }
        drop(engine);

        info!("Mapping store replaced: {} mappings", count);
        Ok(count)
    }

    /// First mapping whose `url` or `urlPath` equals `path`
    pub async fn find_by_logical_path(&self, path: &str) -> Option<Mapping> {
        let engine = self.engine.read().await;
        engine
            .all_stubs()
            .into_iter()
            .find(|mapping| {
                mapping.request.url.as_deref() == Some(path)
                    || mapping.request.url_path.as_deref() == Some(path)
            })
    }

    /// Response for a request, resolved under one read lock
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the matching mapping references a missing body
    /// file
    pub async fn find_match(
        &self,
        method: &str,
        path: &str,
        query: Option<&str>,
    ) -> Result<Option<StubResponse>> {
        let engine = self.engine.read().await;
        let Some(mapping) = engine.find_stub(method, path, query) else {
            return Ok(None);
        };

        let body = resolve(&**engine, &mapping.response)?;
        Ok(Some(StubResponse {
            mapping_id: mapping.id.clone(),
            status: mapping.response.status,
            headers: mapping.response.headers.clone(),
            body,
        }))
    }

    /// Materialized response body of a mapping
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the body file is missing
    pub async fn resolve_body(&self, mapping: &Mapping) -> Result<Vec<u8>> {
        let engine = self.engine.read().await;
        resolve(&**engine, &mapping.response)
    }

    /// Consistent copy of all mappings and the body files they reference
    pub async fn export(&self) -> ArchiveContents {
        let engine = self.engine.read().await;
        let mappings = engine.all_stubs();

        let mut bodies = BTreeMap::new();
        for mapping in &mappings {
            if let Some(name) = mapping.response.body_reference() {
                match engine.body_file(name) {
                    Some(data) => {
                        bodies.insert(name.to_string(), data.to_vec());
                    }
                    None => warn!("Mapping {} references missing body file {}", mapping.id, name),
                }
            }
        }

        ArchiveContents { mappings, bodies }
    }

    /// Register `GET <prefix>/<name>` for every `<name>.json` directly in `dir`
    ///
    /// Each file's content becomes a 200 JSON response body. Files already
    /// referenced as a mapping body are skipped. Returns the number of
    /// endpoints registered; a missing directory registers none.
    ///
    /// # Errors
    ///
    /// Returns error if the directory exists but cannot be listed
    pub async fn load_endpoint_files(&self, dir: &Path, prefix: &str) -> Result<usize> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Endpoint directory not found: {}, skipping load", dir.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_file() && name.ends_with(".json") {
                files.push((name, entry.path()));
            }
        }
        files.sort();

        // Bodies of existing mappings are not endpoints of their own
        let referenced: HashSet<String> = self
            .list_mappings()
            .await
            .iter()
            .filter_map(|m| m.response.body_reference().map(str::to_string))
            .collect();

        let prefix = prefix.trim_end_matches('/');
        let mut loaded = 0;
        for (name, path) in files {
            if referenced.contains(&name) {
                debug!("Skipping body file of an existing mapping: {}", name);
                continue;
            }
            let stem = name.trim_end_matches(".json");
            let body = match fs::read_to_string(&path).await {
                Ok(body) => body,
                Err(e) => {
                    warn!("Failed to read endpoint file {}: {}", path.display(), e);
                    continue;
                }
            };

            let mapping = Mapping {
                id: format!("endpoint-{}", sanitize_id(stem)),
                request: RequestPattern {
                    method: "GET".to_string(),
                    url: Some(format!("{prefix}/{stem}")),
                    ..RequestPattern::default()
                },
                response: ResponseDefinition {
                    headers: BTreeMap::from([(
                        "Content-Type".to_string(),
                        "application/json".to_string(),
                    )]),
                    body: Some(body),
                    ..ResponseDefinition::default()
                },
                extra: serde_json::Map::new(),
            };

            match self.add_mapping(mapping).await {
                Ok(()) => {
                    debug!("Loaded endpoint {}/{} from {}", prefix, stem, name);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping endpoint file {}: {}", name, e),
            }
        }

        info!("Loaded {} endpoints from {}", loaded, dir.display());
        Ok(loaded)
    }

    /// Begin proxy recording in the engine
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRecording` if the engine is already recording
    pub async fn start_proxy_recording(&self, upstream: &str) -> Result<()> {
        self.engine.write().await.start_proxy_recording(upstream)
    }

    /// Finalize the engine recording under the write lock
    ///
    /// # Errors
    ///
    /// Returns `NotRecording` if the engine is not recording
    pub async fn stop_proxy_recording(&self) -> Result<ArchiveContents> {
        self.engine.write().await.stop_proxy_recording()
    }

    /// Upstream the engine is recording against
    pub async fn recording_target(&self) -> Option<String> {
        self.engine.read().await.recording_target().map(str::to_string)
    }

    /// Hand a proxied exchange to the engine; false when it was dropped
    pub async fn capture(&self, exchange: CapturedExchange) -> bool {
        self.engine.write().await.capture(exchange)
    }

    /// Mark the mock listener as serving or stopped
    pub async fn set_running(&self, running: bool) {
        self.engine.write().await.set_running(running);
    }

    /// Engine running flag, port, mapping and body file counts
    pub async fn status(&self) -> EngineStatus {
        let engine = self.engine.read().await;
        EngineStatus {
            running: engine.is_running(),
            port: engine.port(),
            mappings: engine.stub_count(),
            body_files: engine.body_files().len(),
        }
    }
}

fn resolve(engine: &dyn MatchingEngine, response: &ResponseDefinition) -> Result<Vec<u8>> {
    if let Some(name) = response.body_reference() {
        return engine
            .body_file(name)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| StubvaultError::NotFound(format!("Body file {name}")));
    }
    Ok(response.inline_body().unwrap_or_default())
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
