//! Local directory backend: one `<name>.zip` file per snapshot

use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::fs;
use tracing::{debug, info};

use super::{name_from_file, validate_snapshot_name, SnapshotStorage, SNAPSHOT_EXTENSION};
use crate::{Result, StubvaultError};

/// Snapshots stored as files in a local directory
#[derive(Debug, Clone)]
pub struct LocalStorage {
    directory: PathBuf,
}

impl LocalStorage {
    /// Create the backend, creating the directory if needed
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created
    pub fn new(directory: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&directory)?;
        info!("Local storage at: {}", directory.display());
        Ok(Self { directory })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        validate_snapshot_name(name)?;
        Ok(self.directory.join(format!("{name}.{SNAPSHOT_EXTENSION}")))
    }
}

#[async_trait]
impl SnapshotStorage for LocalStorage {
    async fn put(&self, name: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(name)?;
        let directory = self.directory.clone();
        let target = path.clone();

        // Write next to the target and rename over it so readers see either
        // the old archive or the complete new one
        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&directory)?;
            let mut file = NamedTempFile::new_in(&directory)?;
            file.write_all(&data)?;
            file.as_file().sync_all()?;
            file.persist(&target).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| StubvaultError::Other(format!("Snapshot write task failed: {e}")))??;

        info!("Snapshot saved locally: {}", path.display());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.path_for(name)?;
        match fs::read(&path).await {
            Ok(data) => {
                debug!("Loaded snapshot from: {}", path.display());
                Ok(data)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StubvaultError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(&self.directory).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if let Some(name) = name_from_file(&file_name) {
                names.push(name.to_string());
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Deleted snapshot: {}", name);
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let path = self.path_for(name)?;
        match fs::metadata(&path).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn describe(&self) -> String {
        format!("local:{}", self.directory.display())
    }
}
