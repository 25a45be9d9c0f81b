//! Snapshot storage backends
//!
//! Every backend stores named binary archives behind the same five
//! operations. One backend is selected from configuration at startup and
//! shared as `Arc<dyn SnapshotStorage>`.

mod artifact_repo;
mod local;
mod remote_repo;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

pub use artifact_repo::ArtifactRepoStorage;
pub use local::LocalStorage;
pub use remote_repo::RemoteRepoStorage;

use crate::config::{StorageConfig, StorageType};
use crate::network::HttpClient;
use crate::{Result, StubvaultError};

/// File extension of stored archives
pub const SNAPSHOT_EXTENSION: &str = "zip";

/// Maximum snapshot name length in bytes
pub const MAX_NAME_LEN: usize = 255;

/// Uniform contract over named snapshot archives
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// Store or overwrite the archive under `name`
    ///
    /// Readers never observe a partially written archive.
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` on connectivity or auth failure
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()>;

    /// Fetch the archive stored under `name`
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if absent, `StorageUnavailable` on backend failure
    async fn get(&self, name: &str) -> Result<Vec<u8>>;

    /// Names of all stored archives, sorted ascending
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` only; an empty backend is an empty list
    async fn list(&self) -> Result<Vec<String>>;

    /// Delete the archive under `name`, returning whether one existed
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` on backend failure, never for absence
    async fn delete(&self, name: &str) -> Result<bool>;

    /// Whether an archive is stored under `name`
    ///
    /// # Errors
    ///
    /// Returns `StorageUnavailable` on backend failure
    async fn exists(&self, name: &str) -> Result<bool>;

    /// Human-readable backend label for logs and error context
    fn describe(&self) -> String;
}

/// Build the configured backend
///
/// # Errors
///
/// Returns `ConfigError` if the selected backend lacks required parameters,
/// or an I/O error if the local directory cannot be created
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn SnapshotStorage>> {
    config.validate()?;

    let storage: Arc<dyn SnapshotStorage> = match config.storage_type {
        StorageType::Local => Arc::new(LocalStorage::new(config.local.directory.clone())?),
        StorageType::RemoteRepo => {
            let client = HttpClient::new(Duration::from_millis(config.request_timeout_ms));
            Arc::new(RemoteRepoStorage::new(config.remote_repo.clone(), client))
        }
        StorageType::ArtifactRepo => {
            let client = HttpClient::new(Duration::from_millis(config.request_timeout_ms));
            Arc::new(ArtifactRepoStorage::new(config.artifact_repo.clone(), client))
        }
    };

    info!("Snapshot storage initialized: {}", storage.describe());
    Ok(storage)
}

/// Validate a snapshot name before it becomes a storage key
///
/// # Errors
///
/// Returns `InvalidSnapshotName` if the name is empty, too long, contains a
/// path separator or NUL byte, or starts with a dot
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StubvaultError::InvalidSnapshotName(
            "Snapshot name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_NAME_LEN {
        return Err(StubvaultError::InvalidSnapshotName(format!(
            "Snapshot name too long: {} > {MAX_NAME_LEN}",
            name.len()
        )));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(StubvaultError::InvalidSnapshotName(format!(
            "Snapshot name cannot contain path separators: {name}"
        )));
    }

    if name.starts_with('.') {
        return Err(StubvaultError::InvalidSnapshotName(format!(
            "Snapshot name cannot start with dot: {name}"
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(StubvaultError::InvalidSnapshotName(
            "Snapshot name cannot contain control characters".to_string(),
        ));
    }

    Ok(())
}

/// Strip the archive extension from a stored file name
pub(crate) fn name_from_file(file_name: &str) -> Option<&str> {
    let name = file_name.strip_suffix(SNAPSHOT_EXTENSION)?.strip_suffix('.')?;
    validate_snapshot_name(name).ok().map(|()| name)
}
