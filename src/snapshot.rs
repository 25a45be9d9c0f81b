//! Snapshot service
//!
//! Ties the mapping store, the archive codec and the storage backend
//! together. Backend I/O and decoding finish before the store is touched, so
//! a failed create or restore leaves both the backend and the store as they
//! were. A restore swaps the data directory first and the store last; the
//! directory swap is undone if the store swap fails.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use serde::Serialize;
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::archive::{self, clear_directory, write_to_directory, ArchiveLimits, FILES_DIR, MAPPINGS_DIR};
use crate::storage::{validate_snapshot_name, SnapshotStorage};
use crate::store::MappingStore;
use crate::{Result, StubvaultError};

/// Directory below the data root where restores are staged
pub const STAGING_DIR: &str = ".staging";

/// Directory below the data root holding the replaced sections until a
/// restore commits
pub const BACKUP_DIR: &str = ".previous";

/// Outcome of a create or restore
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotInfo {
    /// Snapshot name
    pub name: String,
    /// Number of mappings in the snapshot
    pub mappings: usize,
    /// Number of body files in the snapshot
    pub body_files: usize,
    /// Encoded archive size
    pub size_bytes: usize,
    /// Backend label
    pub backend: String,
}

/// Create, restore, list and delete snapshots
pub struct SnapshotService {
    storage: Arc<dyn SnapshotStorage>,
    store: Arc<MappingStore>,
    root_dir: PathBuf,
    limits: ArchiveLimits,
    data_dir_lock: Arc<Mutex<()>>,
}

impl SnapshotService {
    /// Create the service
    ///
    /// `root_dir` is the live data directory (`mappings/`, `__files/`) that
    /// restores are promoted into while holding `data_dir_lock`.
    #[must_use]
    pub fn new(
        storage: Arc<dyn SnapshotStorage>,
        store: Arc<MappingStore>,
        root_dir: PathBuf,
        limits: ArchiveLimits,
        data_dir_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            storage,
            store,
            root_dir,
            limits,
            data_dir_lock,
        }
    }

    /// Backend label
    #[must_use]
    pub fn backend(&self) -> String {
        self.storage.describe()
    }

    /// Encode the current store and save it under `name`
    ///
    /// # Errors
    ///
    /// Returns `Snapshot` wrapping the name, codec or backend failure
    pub async fn create(&self, name: &str) -> Result<SnapshotInfo> {
        self.create_inner(name)
            .await
            .map_err(|e| self.wrap("create", name, e))
    }

    async fn create_inner(&self, name: &str) -> Result<SnapshotInfo> {
        validate_snapshot_name(name)?;

        let contents = self.store.export().await;
        let data = archive::encode(&contents)?;
        let info = SnapshotInfo {
            name: name.to_string(),
            mappings: contents.mappings.len(),
            body_files: contents.bodies.len(),
            size_bytes: data.len(),
            backend: self.backend(),
        };

        self.storage.put(name, data).await?;

        info!(
            "Snapshot created: {} ({} mappings, {} bytes)",
            name, info.mappings, info.size_bytes
        );
        Ok(info)
    }

    /// Create a snapshot named after the current local time
    ///
    /// # Errors
    ///
    /// Same as [`SnapshotService::create`]
    pub async fn create_auto(&self) -> Result<SnapshotInfo> {
        let name = auto_name();
        self.create(&name).await
    }

    /// Replace the store with the snapshot saved under `name`
    ///
    /// # Errors
    ///
    /// Returns `Snapshot` wrapping `SnapshotNotFound`, `CorruptArchive`, a
    /// backend failure or a data directory failure; the store and the live
    /// data directory are unchanged in each case
    pub async fn restore(&self, name: &str) -> Result<SnapshotInfo> {
        self.restore_inner(name)
            .await
            .map_err(|e| self.wrap("restore", name, e))
    }

    async fn restore_inner(&self, name: &str) -> Result<SnapshotInfo> {
        validate_snapshot_name(name)?;

        let data = self.storage.get(name).await.map_err(|e| match e {
            StubvaultError::NotFound(_) => StubvaultError::SnapshotNotFound(name.to_string()),
            other => other,
        })?;
        let contents = archive::decode(&data, &self.limits)?;

        let info = SnapshotInfo {
            name: name.to_string(),
            mappings: contents.mappings.len(),
            body_files: contents.bodies.len(),
            size_bytes: data.len(),
            backend: self.backend(),
        };

        let _guard = self.data_dir_lock.lock().await;

        let staging = self.root_dir.join(STAGING_DIR);
        let backup = self.root_dir.join(BACKUP_DIR);
        remove_dir_if_exists(&staging).await?;

        let promoted: Result<()> = async {
            write_to_directory(&contents, &staging).await?;
            self.promote(&staging, &backup).await
        }
        .await;
        if let Err(e) = promoted {
            if let Err(cleanup) = remove_dir_if_exists(&staging).await {
                warn!("Failed to remove {}: {}", staging.display(), cleanup);
            }
            return Err(e);
        }

        if let Err(e) = self.store.replace_from_directory(&self.root_dir).await {
            self.roll_back(&backup).await;
            return Err(e);
        }
        if let Err(e) = remove_dir_if_exists(&backup).await {
            warn!("Failed to remove {}: {}", backup.display(), e);
        }

        info!(
            "Snapshot restored: {} ({} mappings, {} body files)",
            name, info.mappings, info.body_files
        );
        Ok(info)
    }

    /// Move the live sections into `backup` and the staged ones into place
    ///
    /// A failure part way puts the live sections back before returning.
    async fn promote(&self, staging: &Path, backup: &Path) -> Result<()> {
        remove_dir_if_exists(backup).await?;
        fs::create_dir_all(backup).await?;

        let swapped: Result<()> = async {
            for section in [MAPPINGS_DIR, FILES_DIR] {
                rename_if_exists(&self.root_dir.join(section), &backup.join(section)).await?;
            }
            for section in [MAPPINGS_DIR, FILES_DIR] {
                fs::rename(staging.join(section), self.root_dir.join(section)).await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = swapped {
            self.roll_back(backup).await;
            return Err(e);
        }

        if let Err(e) = remove_dir_if_exists(staging).await {
            warn!("Failed to remove {}: {}", staging.display(), e);
        }
        Ok(())
    }

    /// Put the sections saved in `backup` back into the data directory
    async fn roll_back(&self, backup: &Path) {
        let result: Result<()> = async {
            clear_directory(&self.root_dir).await?;
            for section in [MAPPINGS_DIR, FILES_DIR] {
                rename_if_exists(&backup.join(section), &self.root_dir.join(section)).await?;
            }
            remove_dir_if_exists(backup).await
        }
        .await;

        match result {
            Ok(()) => info!("Rolled back data directory {}", self.root_dir.display()),
            Err(e) => warn!(
                "Failed to roll back data directory {}: {}",
                self.root_dir.display(),
                e
            ),
        }
    }

    /// Names of all stored snapshots, sorted
    ///
    /// # Errors
    ///
    /// Returns `Snapshot` wrapping a backend failure
    pub async fn list(&self) -> Result<Vec<String>> {
        self.storage
            .list()
            .await
            .map_err(|e| self.wrap("list", "*", e))
    }

    /// Delete a snapshot, returning whether it existed
    ///
    /// # Errors
    ///
    /// Returns `Snapshot` wrapping a name or backend failure
    pub async fn delete(&self, name: &str) -> Result<bool> {
        let result: Result<bool> = async {
            validate_snapshot_name(name)?;
            self.storage.delete(name).await
        }
        .await;

        let deleted = result.map_err(|e| self.wrap("delete", name, e))?;
        if deleted {
            info!("Snapshot deleted: {}", name);
        }
        Ok(deleted)
    }

    /// Whether a snapshot exists
    ///
    /// # Errors
    ///
    /// Returns `Snapshot` wrapping a name or backend failure
    pub async fn exists(&self, name: &str) -> Result<bool> {
        let result: Result<bool> = async {
            validate_snapshot_name(name)?;
            self.storage.exists(name).await
        }
        .await;

        result.map_err(|e| self.wrap("check", name, e))
    }

    /// Restore the configured snapshot at startup, if one is configured
    ///
    /// # Errors
    ///
    /// Same as [`SnapshotService::restore`]
    pub async fn load_startup_snapshot(&self, name: Option<&str>) -> Result<Option<SnapshotInfo>> {
        match name {
            Some(name) => {
                info!("Loading startup snapshot: {}", name);
                self.restore(name).await.map(Some)
            }
            None => {
                warn!("No startup snapshot configured");
                Ok(None)
            }
        }
    }

    fn wrap(&self, operation: &'static str, name: &str, source: StubvaultError) -> StubvaultError {
        StubvaultError::Snapshot {
            operation,
            name: name.to_string(),
            backend: self.backend(),
            source: Box::new(source),
        }
    }
}

/// Snapshot name derived from the local time, `snapshot-YYYYMMDD-HHMMSS`
#[must_use]
pub fn auto_name() -> String {
    Local::now().format("snapshot-%Y%m%d-%H%M%S").to_string()
}

async fn rename_if_exists(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::StubEngine;
    use crate::mapping::Mapping;
    use crate::storage::LocalStorage;
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        temp_dir: TempDir,
        root: PathBuf,
        storage: Arc<LocalStorage>,
        store: Arc<MappingStore>,
        service: SnapshotService,
    }

    fn fixture() -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("data");
        let storage = Arc::new(LocalStorage::new(temp_dir.path().join("snapshots")).unwrap());
        let store = Arc::new(MappingStore::new(Box::new(StubEngine::new(8089, 4096))));
        let service = SnapshotService::new(
            Arc::clone(&storage) as Arc<dyn SnapshotStorage>,
            Arc::clone(&store),
            root.clone(),
            ArchiveLimits::default(),
            Arc::new(Mutex::new(())),
        );

        Fixture {
            temp_dir,
            root,
            storage,
            store,
            service,
        }
    }

    fn ids(mappings: &[Mapping]) -> Vec<&str> {
        mappings.iter().map(|m| m.id.as_str()).collect()
    }

    fn sorted_ids(mappings: &[Mapping]) -> Vec<String> {
        let mut ids: Vec<String> = mappings.iter().map(|m| m.id.clone()).collect();
        ids.sort();
        ids
    }

    #[tokio::test]
    async fn test_create_then_restore_replaces_store() {
        let f = fixture();
        f.store
            .add_mapping(Mapping::get("client-1", "/api/clients/1", 200, r#"{"id":1}"#))
            .await
            .unwrap();
        f.service.create("v1").await.unwrap();

        f.store.reset_all().await;
        f.store.add_mapping(Mapping::get("other", "/other", 200, "x")).await.unwrap();

        let info = f.service.restore("v1").await.unwrap();
        assert_eq!(info.mappings, 1);

        let mappings = f.store.list_mappings().await;
        assert_eq!(ids(&mappings), vec!["client-1"]);
        assert!(f.root.join("mappings/client-1.json").is_file());
        assert!(!f.root.join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_create_twice_decodes_identically() {
        let f = fixture();
        f.store.add_mapping(Mapping::get("b", "/b", 200, "x")).await.unwrap();
        f.store.add_mapping(Mapping::get("a", "/a", 200, "y")).await.unwrap();

        f.service.create("first").await.unwrap();
        f.service.create("second").await.unwrap();

        let first = f.storage.get("first").await.unwrap();
        let second = f.storage.get("second").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_restore_absent_keeps_store() {
        let f = fixture();
        f.store.add_mapping(Mapping::get("keep", "/keep", 200, "x")).await.unwrap();

        let err = f.service.restore("absent").await.unwrap_err();
        assert!(matches!(err.root(), StubvaultError::SnapshotNotFound(_)));
        assert_eq!(err.status_code(), hyper::StatusCode::NOT_FOUND);

        assert_eq!(ids(&f.store.list_mappings().await), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_delete_missing_returns_false() {
        let f = fixture();
        assert!(!f.service.delete("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_sorted() {
        let f = fixture();
        assert!(f.service.list().await.unwrap().is_empty());

        f.service.create("b").await.unwrap();
        f.service.create("a").await.unwrap();

        assert_eq!(f.service.list().await.unwrap(), vec!["a", "b"]);
        assert!(f.service.exists("a").await.unwrap());
        assert!(!f.service.exists("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_name_wrapped() {
        let f = fixture();

        let err = f.service.create("../escape").await.unwrap_err();
        assert!(matches!(
            err,
            StubvaultError::Snapshot { operation: "create", .. }
        ));
        assert!(matches!(err.root(), StubvaultError::InvalidSnapshotName(_)));
    }

    #[tokio::test]
    async fn test_zip_slip_rejected_nothing_written() {
        let f = fixture();
        f.store.add_mapping(Mapping::get("keep", "/keep", 200, "x")).await.unwrap();

        let mut buffer = std::io::Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buffer);
            zip.start_file("../../evil", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"pwned").unwrap();
            zip.finish().unwrap();
        }
        f.storage.put("evil", buffer.into_inner()).await.unwrap();

        let err = f.service.restore("evil").await.unwrap_err();
        assert!(matches!(err.root(), StubvaultError::CorruptArchive(_)));

        assert!(!f.root.exists());
        assert!(!f.temp_dir.path().join("evil").exists());
        assert_eq!(ids(&f.store.list_mappings().await), vec!["keep"]);
    }

    #[tokio::test]
    async fn test_restore_round_trips_body_files() {
        let f = fixture();
        let mut mapping = Mapping::get("report", "/report", 200, "");
        mapping.response.body = None;
        mapping.response.body_file_name = Some("reports/report.pdf".to_string());
        f.store.put_body_file("reports/report.pdf", vec![0x25, 0x50, 0x44, 0x46]).await;
        f.store.add_mapping(mapping).await.unwrap();

        f.service.create("with-files").await.unwrap();
        f.store.reset_all().await;
        let info = f.service.restore("with-files").await.unwrap();
        assert_eq!(info.body_files, 1);

        let response = f.store.find_match("GET", "/report", None).await.unwrap().unwrap();
        assert_eq!(response.body, vec![0x25, 0x50, 0x44, 0x46]);
        assert!(f.root.join("__files/reports/report.pdf").is_file());
    }

    /// Store holds `old`, the data directory holds `old.json`, and `v1` is
    /// saved in the backend
    async fn with_old_state_and_v1(f: &Fixture) {
        f.store.add_mapping(Mapping::get("v1", "/v1", 200, "x")).await.unwrap();
        f.service.create("v1").await.unwrap();
        f.store.reset_all().await;

        f.store.add_mapping(Mapping::get("old", "/old", 200, "x")).await.unwrap();
        write_to_directory(&f.store.export().await, &f.root).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_promote_leaves_store_and_directory() {
        let f = fixture();
        with_old_state_and_v1(&f).await;
        std::fs::write(f.root.join(BACKUP_DIR), b"not a directory").unwrap();

        assert!(f.service.restore("v1").await.is_err());

        assert_eq!(ids(&f.store.list_mappings().await), vec!["old"]);
        assert!(f.root.join("mappings/old.json").is_file());
        assert!(!f.root.join("mappings/v1.json").exists());
        assert!(!f.root.join(STAGING_DIR).exists());
    }

    #[tokio::test]
    async fn test_restore_over_stray_file_is_consistent() {
        let f = fixture();
        with_old_state_and_v1(&f).await;
        std::fs::remove_dir_all(f.root.join("mappings")).unwrap();
        std::fs::write(f.root.join("mappings"), b"stray").unwrap();

        f.service.restore("v1").await.unwrap();

        assert_eq!(ids(&f.store.list_mappings().await), vec!["v1"]);
        assert!(f.root.join("mappings/v1.json").is_file());
        assert!(!f.root.join(BACKUP_DIR).exists());
    }

    #[tokio::test]
    async fn test_restore_atomic_to_readers() {
        let f = fixture();
        let old: Vec<Mapping> = (0..50)
            .map(|i| Mapping::get(format!("old-{i}"), format!("/old/{i}"), 200, "x"))
            .collect();
        let new: Vec<Mapping> = (0..50)
            .map(|i| Mapping::get(format!("new-{i}"), format!("/new/{i}"), 200, "x"))
            .collect();

        for mapping in &new {
            f.store.add_mapping(mapping.clone()).await.unwrap();
        }
        f.service.create("new").await.unwrap();
        f.store.reset_all().await;
        for mapping in &old {
            f.store.add_mapping(mapping.clone()).await.unwrap();
        }
        f.service.create("old").await.unwrap();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let store = Arc::clone(&f.store);
            let done = Arc::clone(&done);
            let (old, new) = (sorted_ids(&old), sorted_ids(&new));
            tokio::spawn(async move {
                let mut polls = 0;
                while !done.load(std::sync::atomic::Ordering::Acquire) || polls == 0 {
                    let seen = sorted_ids(&store.list_mappings().await);
                    assert!(seen == old || seen == new, "observed a mixed mapping set");
                    polls += 1;
                    tokio::task::yield_now().await;
                }
                polls
            })
        };

        for round in 0..6 {
            let name = if round % 2 == 0 { "new" } else { "old" };
            f.service.restore(name).await.unwrap();
            tokio::task::yield_now().await;
        }
        done.store(true, std::sync::atomic::Ordering::Release);

        assert!(reader.await.unwrap() > 0);
        assert_eq!(sorted_ids(&f.store.list_mappings().await), sorted_ids(&old));
    }

    #[tokio::test]
    async fn test_load_startup_snapshot() {
        let f = fixture();
        assert!(f.service.load_startup_snapshot(None).await.unwrap().is_none());

        f.store.add_mapping(Mapping::get("a", "/a", 200, "x")).await.unwrap();
        f.service.create("boot").await.unwrap();
        f.store.reset_all().await;

        let info = f.service.load_startup_snapshot(Some("boot")).await.unwrap();
        assert_eq!(info.unwrap().mappings, 1);
        assert_eq!(f.store.mapping_count().await, 1);
    }

    #[test]
    fn test_auto_name_format() {
        let name = auto_name();
        assert!(name.starts_with("snapshot-"));
        assert_eq!(name.len(), "snapshot-20240101-120000".len());
        assert!(validate_snapshot_name(&name).is_ok());
    }
}
