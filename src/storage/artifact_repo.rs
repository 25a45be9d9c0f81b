//! Artifact repository backend (Nexus-style maven2 layout)
//!
//! A snapshot named `v1` with group `com.example` and artifact `mocks` lives at
//! `<url>/repository/<repo>/com/example/mocks/v1/mocks-v1.zip`: the snapshot
//! name is the artifact version.

use std::collections::BTreeSet;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hyper::{Method, Uri};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{validate_snapshot_name, SnapshotStorage, SNAPSHOT_EXTENSION};
use crate::config::ArtifactRepoConfig;
use crate::network::{build_uri, ForwardedResponse, HttpClient, OutboundRequest};
use crate::{Result, StubvaultError};

/// Upper bound on search result pages followed by `list`
const MAX_SEARCH_PAGES: usize = 100;

/// Snapshots stored as versions of one maven artifact
pub struct ArtifactRepoStorage {
    config: ArtifactRepoConfig,
    client: HttpClient,
    authorization: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchPage {
    #[serde(default)]
    items: Vec<SearchAsset>,
    #[serde(default)]
    continuation_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchAsset {
    path: String,
}

impl ArtifactRepoStorage {
    /// Create the backend
    #[must_use]
    pub fn new(config: ArtifactRepoConfig, client: HttpClient) -> Self {
        let authorization = match (&config.username, &config.password) {
            (Some(user), Some(password)) => {
                Some(format!("Basic {}", BASE64.encode(format!("{user}:{password}"))))
            }
            _ => None,
        };

        info!(
            "Artifact repository storage for {} ({}:{})",
            config.repository, config.group_id, config.artifact_id
        );

        Self {
            config,
            client,
            authorization,
        }
    }

    /// Repository-relative directory holding every version of the artifact
    fn artifact_dir(&self) -> String {
        format!(
            "{}/{}",
            self.config.group_id.replace('.', "/"),
            self.config.artifact_id
        )
    }

    fn artifact_uri(&self, name: &str) -> Result<Uri> {
        validate_snapshot_name(name)?;
        let artifact = &self.config.artifact_id;
        let path = format!(
            "repository/{}/{}/{name}/{artifact}-{name}.{SNAPSHOT_EXTENSION}",
            self.config.repository,
            self.artifact_dir()
        );
        build_uri(&self.config.url, &path, &[])
    }

    fn request(&self, method: Method, uri: Uri) -> OutboundRequest {
        let request = OutboundRequest::new(method, uri);
        match &self.authorization {
            Some(value) => request.header("Authorization", value.clone()),
            None => request,
        }
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

    /// Snapshot name from an asset path, if it is one of our archives
    fn name_from_asset(&self, path: &str) -> Option<String> {
        let path = path.trim_start_matches('/');
        let rest = path.strip_prefix(&self.artifact_dir())?.strip_prefix('/')?;
        let (version, file) = rest.split_once('/')?;
        let expected = format!(
            "{}-{version}.{SNAPSHOT_EXTENSION}",
            self.config.artifact_id
        );
        if file != expected || validate_snapshot_name(version).is_err() {
            return None;
        }
        Some(version.to_string())
    }
}

#[async_trait]
impl SnapshotStorage for ArtifactRepoStorage {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let uri = self.artifact_uri(name)?;
        let response = self
            .send(
                self.request(Method::PUT, uri)
                    .header("Content-Type", "application/octet-stream")
                    .body(data),
            )
            .await?;

        if !response.is_success() {
            return Err(self.status_error(&response));
        }

        info!("Snapshot saved to artifact repository: {}", name);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let uri = self.artifact_uri(name)?;
        let response = self.send(self.request(Method::GET, uri)).await?;

        match response.status {
            404 => Err(StubvaultError::NotFound(name.to_string())),
            _ if response.is_success() => {
                info!("Snapshot loaded from artifact repository: {}", name);
                Ok(response.body.to_vec())
            }
            _ => Err(self.status_error(&response)),
        }
    }

    /// Lists through the search API. Servers without one (404, 405, 501)
    /// yield an empty list instead of an error.
    async fn list(&self) -> Result<Vec<String>> {
        let mut names = BTreeSet::new();
        let mut token: Option<String> = None;

        for _ in 0..MAX_SEARCH_PAGES {
            let mut query = vec![
                ("repository", self.config.repository.as_str()),
                ("maven.groupId", self.config.group_id.as_str()),
                ("maven.artifactId", self.config.artifact_id.as_str()),
                ("maven.extension", SNAPSHOT_EXTENSION),
            ];
            if let Some(token) = token.as_deref() {
                query.push(("continuationToken", token));
            }

            let uri = build_uri(&self.config.url, "service/rest/v1/search/assets", &query)?;
            let response = self.send(self.request(Method::GET, uri)).await?;

            if matches!(response.status, 404 | 405 | 501) {
                warn!(
                    "Artifact repository has no search capability (HTTP {}); listing is empty",
                    response.status
                );
                return Ok(Vec::new());
            }
            if !response.is_success() {
                return Err(self.status_error(&response));
            }

            let page: SearchPage = serde_json::from_slice(&response.body).map_err(|e| {
                StubvaultError::unavailable(self.describe(), format!("Unexpected search result: {e}"))
            })?;

            for asset in &page.items {
                match self.name_from_asset(&asset.path) {
                    Some(name) => {
                        names.insert(name);
                    }
                    None => debug!("Skipping unrelated asset: {}", asset.path),
                }
            }

            match page.continuation_token {
                Some(next) if !next.is_empty() => token = Some(next),
                _ => return Ok(names.into_iter().collect()),
            }
        }

        warn!("Stopped listing after {} search pages", MAX_SEARCH_PAGES);
        Ok(names.into_iter().collect())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let uri = self.artifact_uri(name)?;
        let response = self.send(self.request(Method::DELETE, uri)).await?;

        match response.status {
            404 => {
                warn!("Snapshot not found for deletion: {}", name);
                Ok(false)
            }
            _ if response.is_success() => {
                info!("Snapshot deleted from artifact repository: {}", name);
                Ok(true)
            }
            _ => Err(self.status_error(&response)),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let uri = self.artifact_uri(name)?;
        let response = self.send(self.request(Method::HEAD, uri)).await?;

        match response.status {
            404 => Ok(false),
            _ if response.is_success() => Ok(true),
            _ => Err(self.status_error(&response)),
        }
    }

    fn describe(&self) -> String {
        format!(
            "artifact_repo:{}/repository/{}",
            self.config.url.trim_end_matches('/'),
            self.config.repository
        )
    }
}
