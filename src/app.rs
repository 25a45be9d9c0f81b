//! Application wiring: one shared instance of every service

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::archive::{ArchiveLimits, FILES_DIR};
use crate::config::{Config, Mode};
use crate::engine::StubEngine;
use crate::network::HttpClient;
use crate::recording::Recorder;
use crate::snapshot::SnapshotService;
use crate::storage::{self, SnapshotStorage};
use crate::store::MappingStore;
use crate::Result;

/// Shared state behind both listeners
pub struct App {
    /// Validated configuration
    pub config: Config,
    /// Mapping store
    pub store: Arc<MappingStore>,
    /// Recording coordinator
    pub recorder: Recorder,
    /// Snapshot service
    pub snapshots: SnapshotService,
    /// Client used to proxy recorded traffic
    pub client: HttpClient,
}

impl App {
    /// Build every service from configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or the selected
    /// backend lacks required parameters
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let storage = storage::from_config(&config.storage)?;
        Ok(Self::with_storage(config, storage))
    }

    /// Build every service around an existing storage backend
    #[must_use]
    pub fn with_storage(config: Config, storage: Arc<dyn SnapshotStorage>) -> Self {
        let store = Arc::new(MappingStore::new(Box::new(StubEngine::new(
            config.server.mock_port,
            config.recording.inline_body_limit,
        ))));

        // Recording stop and snapshot restore both write the data directory
        let data_dir_lock = Arc::new(Mutex::new(()));

        let recorder = Recorder::new(
            Arc::clone(&store),
            config.recording.proxy_url.clone(),
            config.root_dir.clone(),
            Arc::clone(&data_dir_lock),
        );

        let snapshots = SnapshotService::new(
            storage,
            Arc::clone(&store),
            config.root_dir.clone(),
            ArchiveLimits::from(&config.limits),
            data_dir_lock,
        );

        let client = HttpClient::new(Duration::from_millis(config.storage.request_timeout_ms));

        Self {
            config,
            store,
            recorder,
            snapshots,
            client,
        }
    }

    /// Bring the store into the state the configured mode starts from
    ///
    /// - replay: restore the configured snapshot
    /// - stub and record: load the data directory if auto-load is on
    /// - record: then start recording against the configured upstream
    ///
    /// # Errors
    ///
    /// Returns error if the startup snapshot cannot be restored, the data
    /// directory cannot be read, or recording cannot start
    pub async fn initialize(&self) -> Result<()> {
        match self.config.mode {
            Mode::Replay => {
                self.snapshots
                    .load_startup_snapshot(self.config.replay.snapshot.as_deref())
                    .await?;
            }
            Mode::Stub | Mode::Record => {
                if self.config.auto_load {
                    let root = &self.config.root_dir;
                    self.store.load_from_directory(root).await?;
                    self.store
                        .load_endpoint_files(&root.join(FILES_DIR), &self.config.logical_path_prefix)
                        .await?;
                } else {
                    info!("Auto-load disabled, skipping data loading");
                }
            }
        }

        if self.config.mode == Mode::Record {
            self.recorder.start(None).await?;
        }

        info!(
            "Initialized in {:?} mode with {} mappings",
            self.config.mode,
            self.store.mapping_count().await
        );
        Ok(())
    }
}
