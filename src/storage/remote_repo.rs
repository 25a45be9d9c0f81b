//! Git-hosted repository backend using the GitHub contents API
//!
//! Each snapshot is `<base_dir>/<name>.zip` on the configured branch. Every
//! write or delete is one commit. Concurrent writers from several servers
//! resolve as last writer wins: a sha conflict re-reads the sha and retries
//! once.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::{Method, Uri};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{name_from_file, validate_snapshot_name, SnapshotStorage, SNAPSHOT_EXTENSION};
use crate::config::RemoteRepoConfig;
use crate::network::{build_uri, ForwardedResponse, HttpClient, OutboundRequest};
use crate::{Result, StubvaultError};

const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw";
const API_VERSION: &str = "2022-11-28";

/// Snapshots stored as files in a Git repository
pub struct RemoteRepoStorage {
    config: RemoteRepoConfig,
    client: HttpClient,
}

/// File entry returned by the contents API
#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContent<'a> {
    message: String,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Debug, Serialize)]
struct DeleteContent<'a> {
    message: String,
    sha: String,
    branch: &'a str,
}

impl RemoteRepoStorage {
    /// Create the backend
    #[must_use]
    pub fn new(config: RemoteRepoConfig, client: HttpClient) -> Self {
        info!(
            "Remote repository storage for {}@{}",
            config.repository, config.branch
        );
        Self { config, client }
    }

    fn file_path(&self, name: &str) -> Result<String> {
        validate_snapshot_name(name)?;
        let base = self.config.base_dir.trim_matches('/');
        Ok(if base.is_empty() {
            format!("{name}.{SNAPSHOT_EXTENSION}")
        } else {
            format!("{base}/{name}.{SNAPSHOT_EXTENSION}")
        })
    }

    fn contents_uri(&self, path: &str, with_ref: bool) -> Result<Uri> {
        let api_path = format!("repos/{}/contents/{path}", self.config.repository);
        if with_ref {
            build_uri(&self.config.api_url, &api_path, &[("ref", self.config.branch.as_str())])
        } else {
            build_uri(&self.config.api_url, &api_path, &[])
        }
    }

    fn request(&self, method: Method, uri: Uri, accept: &str) -> OutboundRequest {
        OutboundRequest::new(method, uri)
            .header("Authorization", format!("Bearer {}", self.config.token))
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", API_VERSION)
            .header(
                "User-Agent",
                concat!("stubvault/", env!("CARGO_PKG_VERSION")),
            )
    }

    async fn send(&self, request: OutboundRequest) -> Result<ForwardedResponse> {
        self.client
            .send(&request)
            .await
            .map_err(|e| StubvaultError::unavailable(self.describe(), e))
    }

    fn status_error(&self, response: &ForwardedResponse) -> StubvaultError {
        StubvaultError::unavailable(
            self.describe(),
            format!("HTTP {}: {}", response.status, response.body_excerpt()),
        )
    }

    /// Fetch file metadata (and inline content); `None` when absent
    async fn fetch_entry(&self, path: &str) -> Result<Option<ContentEntry>> {
        let uri = self.contents_uri(path, true)?;
        let response = self.send(self.request(Method::GET, uri, ACCEPT_JSON)).await?;

        match response.status {
            404 => Ok(None),
            _ if response.is_success() => {
                let entry: ContentEntry = serde_json::from_slice(&response.body).map_err(|e| {
                    StubvaultError::unavailable(self.describe(), format!("Unexpected response: {e}"))
                })?;
                Ok(Some(entry))
            }
            _ => Err(self.status_error(&response)),
        }
    }

    /// Raw download, used when the file is too large for inline content
    async fn fetch_raw(&self, name: &str, path: &str) -> Result<Vec<u8>> {
        let uri = self.contents_uri(path, true)?;
        let response = self.send(self.request(Method::GET, uri, ACCEPT_RAW)).await?;

        match response.status {
            404 => Err(StubvaultError::NotFound(name.to_string())),
            _ if response.is_success() => Ok(response.body.to_vec()),
            _ => Err(self.status_error(&response)),
        }
    }

    async fn write(&self, name: &str, path: &str, encoded: &str) -> Result<ForwardedResponse> {
        let sha = self.fetch_entry(path).await?.map(|entry| entry.sha);
        let message = if sha.is_some() {
            format!("Update mock snapshot: {name}")
        } else {
            format!("Add mock snapshot: {name}")
        };

        let body = serde_json::to_vec(&PutContent {
            message,
            content: encoded.to_string(),
            branch: &self.config.branch,
            sha,
        })
        .map_err(|e| StubvaultError::Other(format!("Failed to encode request: {e}")))?;

        let uri = self.contents_uri(path, false)?;
        self.send(
            self.request(Method::PUT, uri, ACCEPT_JSON)
                .header("Content-Type", "application/json")
                .body(body),
        )
        .await
    }
}

#[async_trait]
impl SnapshotStorage for RemoteRepoStorage {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let path = self.file_path(name)?;
        let encoded = BASE64.encode(&data);

        let mut response = self.write(name, &path, &encoded).await?;
        if matches!(response.status, 409 | 422) {
            // Another writer moved the file since we read its sha
            warn!("Sha conflict writing {}, retrying with fresh sha", path);
            response = self.write(name, &path, &encoded).await?;
        }

        if !response.is_success() {
            return Err(self.status_error(&response));
        }

        info!("Stored snapshot {} in {}", name, self.describe());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.file_path(name)?;
        let entry = self
            .fetch_entry(&path)
            .await?
            .ok_or_else(|| StubvaultError::NotFound(name.to_string()))?;

        if entry.kind != "file" {
            return Err(StubvaultError::unavailable(
                self.describe(),
                format!("Path is not a file: {path}"),
            ));
        }

        match (entry.encoding.as_deref(), entry.content.as_deref()) {
            (Some("base64"), Some(content)) if !content.is_empty() => {
                let compact: String = content.chars().filter(|c| !c.is_whitespace()).collect();
                let data = BASE64.decode(compact).map_err(|e| {
                    StubvaultError::CorruptArchive(format!("Invalid base64 content for {path}: {e}"))
                })?;
                info!("Loaded snapshot {} from {}", name, self.describe());
                Ok(data)
            }
            _ => self.fetch_raw(name, &path).await,
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let base = self.config.base_dir.trim_matches('/');
        let uri = self.contents_uri(base, true)?;
        let response = self.send(self.request(Method::GET, uri, ACCEPT_JSON)).await?;

        if response.status == 404 {
            warn!("Snapshot directory not found in repository: {}", base);
            return Ok(Vec::new());
        }
        if !response.is_success() {
            return Err(self.status_error(&response));
        }

        let entries: Vec<ContentEntry> = serde_json::from_slice(&response.body).map_err(|e| {
            StubvaultError::unavailable(self.describe(), format!("Unexpected listing: {e}"))
        })?;

        let mut names: Vec<String> = entries
            .iter()
            .filter(|entry| entry.kind == "file")
            .filter_map(|entry| name_from_file(&entry.name))
            .map(str::to_string)
            .collect();
        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.file_path(name)?;
        let Some(entry) = self.fetch_entry(&path).await? else {
            warn!("Snapshot not found for deletion: {}", name);
            return Ok(false);
        };

        let body = serde_json::to_vec(&DeleteContent {
            message: format!("Delete mock snapshot: {name}"),
            sha: entry.sha,
            branch: &self.config.branch,
        })
        .map_err(|e| StubvaultError::Other(format!("Failed to encode request: {e}")))?;

        let uri = self.contents_uri(&path, false)?;
        let response = self
            .send(
                self.request(Method::DELETE, uri, ACCEPT_JSON)
                    .header("Content-Type", "application/json")
                    .body(body),
            )
            .await?;

        match response.status {
            404 => Ok(false),
            _ if response.is_success() => {
                info!("Deleted snapshot {} from {}", name, self.describe());
                Ok(true)
            }
            _ => Err(self.status_error(&response)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.file_path(name)?;
        Ok(self.fetch_entry(&path).await?.is_some())
    }

    fn describe(&self) -> String {
        format!(
            "remote_repo:{}@{}",
            self.config.repository, self.config.branch
        )
    }
}
