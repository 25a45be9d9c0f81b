//! Recording coordinator
//!
//! A single-flight state machine, `Idle -> Recording -> Idle`, guarded by
//! one mutex so start and stop never interleave.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hyper::Uri;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::archive::write_to_directory;
use crate::store::MappingStore;
use crate::{Result, StubvaultError};

/// Recording session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordingState {
    /// Not recording
    Idle,
    /// Proxying and capturing against `upstream`
    Recording {
        /// Upstream base URL
        upstream: String,
        /// When the session started
        started_at: DateTime<Utc>,
    },
}

/// Snapshot of the coordinator state, for polling
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    /// Whether a session is active
    pub is_recording: bool,
    /// Upstream of the active session, or the configured default
    pub proxy_url: String,
    /// Start time of the active session
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Current number of mappings in the store
    pub mappings_count: usize,
    /// Mock listener port
    pub mock_port: u16,
    /// Whether the mock listener is serving
    pub is_running: bool,
}

/// Result of stopping a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSummary {
    /// Mappings captured during the session
    pub mappings_recorded: usize,
    /// Mappings in the store after the session
    pub mappings_total: usize,
}

/// Coordinates proxy recording sessions over the mapping store
pub struct Recorder {
    store: Arc<MappingStore>,
    default_upstream: String,
    root_dir: PathBuf,
    data_dir_lock: Arc<Mutex<()>>,
    state: Mutex<RecordingState>,
}

impl Recorder {
    /// Create an idle coordinator
    ///
    /// Captured mappings are also written below `root_dir` when a session
    /// stops, under `data_dir_lock`. Restores promote into the same
    /// directory and must hold the same lock.
    #[must_use]
    pub fn new(
        store: Arc<MappingStore>,
        default_upstream: String,
        root_dir: PathBuf,
        data_dir_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            store,
            default_upstream,
            root_dir,
            data_dir_lock,
            state: Mutex::new(RecordingState::Idle),
        }
    }

    /// Start recording against `upstream`, or the configured proxy URL
    ///
    /// # Errors
    ///
    /// Returns `AlreadyRecording` if a session is active, or `ConfigError`
    /// if the upstream is not an absolute http(s) URL
    pub async fn start(&self, upstream: Option<String>) -> Result<RecordingState> {
        let upstream = upstream
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| self.default_upstream.clone());
        validate_upstream(&upstream)?;

        let mut state = self.state.lock().await;
        if let RecordingState::Recording { upstream: active, .. } = &*state {
            return Err(StubvaultError::AlreadyRecording {
                upstream: active.clone(),
            });
        }

        self.store.start_proxy_recording(&upstream).await?;

        *state = RecordingState::Recording {
            upstream: upstream.clone(),
            started_at: Utc::now(),
        };
        info!("Recording started, proxying to: {}", upstream);
        Ok(state.clone())
    }

    /// Stop the active session and keep what it captured
    ///
    /// # Errors
    ///
    /// Returns `NotRecording` if idle. A failure to write the captured
    /// mappings to disk is logged; the mappings stay in the store.
    pub async fn stop(&self) -> Result<StopSummary> {
        let mut state = self.state.lock().await;
        if *state == RecordingState::Idle {
            return Err(StubvaultError::NotRecording);
        }

        // Held from the store update until the files are on disk, so a
        // restore cannot land between the two
        let data_dir = self.data_dir_lock.lock().await;
        let recorded = self.store.stop_proxy_recording().await?;
        *state = RecordingState::Idle;
        drop(state);

        if !recorded.mappings.is_empty() {
            if let Err(e) = write_to_directory(&recorded, &self.root_dir).await {
                warn!(
                    "Failed to write recorded mappings to {}: {}",
                    self.root_dir.display(),
                    e
                );
            }
        }
        drop(data_dir);

        let summary = StopSummary {
            mappings_recorded: recorded.mappings.len(),
            mappings_total: self.store.mapping_count().await,
        };
        info!(
            "Recording stopped: {} recorded, {} total",
            summary.mappings_recorded, summary.mappings_total
        );
        Ok(summary)
    }

    /// Current state; never mutates anything
    pub async fn status(&self) -> RecordingStatus {
        let state = self.state.lock().await.clone();
        let engine = self.store.status().await;

        let (is_recording, proxy_url, started_at) = match state {
            RecordingState::Idle => (false, self.default_upstream.clone(), None),
            RecordingState::Recording {
                upstream,
                started_at,
            } => (true, upstream, Some(started_at)),
        };

        RecordingStatus {
            is_recording,
            proxy_url,
            started_at,
            mappings_count: engine.mappings,
            mock_port: engine.port,
            is_running: engine.running,
        }
    }

    /// Current state
    pub async fn state(&self) -> RecordingState {
        self.state.lock().await.clone()
    }

    /// Clear all mappings; allowed in any state
    pub async fn reset(&self) {
        self.store.reset_all().await;
    }
}

fn validate_upstream(upstream: &str) -> Result<()> {
    let uri: Uri = upstream
        .parse()
        .map_err(|e| StubvaultError::ConfigError(format!("Invalid upstream URL '{upstream}': {e}")))?;

    match uri.scheme_str() {
        Some("http" | "https") if uri.authority().is_some() => Ok(()),
        _ => Err(StubvaultError::ConfigError(format!(
            "Upstream must be an absolute http(s) URL: {upstream}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{CapturedExchange, StubEngine};
    use crate::fingerprint::CapturedRequest;
    use tempfile::TempDir;

    fn recorder(temp_dir: &TempDir) -> (Arc<MappingStore>, Recorder) {
        let store = Arc::new(MappingStore::new(Box::new(StubEngine::new(8089, 4096))));
        let recorder = Recorder::new(
            Arc::clone(&store),
            "http://localhost:8081".to_string(),
            temp_dir.path().to_path_buf(),
            Arc::new(Mutex::new(())),
        );
        (store, recorder)
    }

    fn exchange(path: &str) -> CapturedExchange {
        CapturedExchange {
            request: CapturedRequest {
                method: "GET".to_string(),
                path: path.to_string(),
                query: None,
                body: Vec::new(),
            },
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: br#"{"ok":true}"#.to_vec(),
        }
    }

    #[tokio::test]
    async fn test_start_stop_cycle() {
        let temp_dir = TempDir::new().unwrap();
        let (store, recorder) = recorder(&temp_dir);

        let state = recorder.start(None).await.unwrap();
        assert!(matches!(
            state,
            RecordingState::Recording { ref upstream, .. } if upstream == "http://localhost:8081"
        ));

        assert!(store.capture(exchange("/a")).await);
        assert!(store.capture(exchange("/b")).await);

        let summary = recorder.stop().await.unwrap();
        assert_eq!(summary.mappings_recorded, 2);
        assert_eq!(summary.mappings_total, 2);
        assert_eq!(recorder.state().await, RecordingState::Idle);

        let written = std::fs::read_dir(temp_dir.path().join("mappings")).unwrap().count();
        assert_eq!(written, 2);
    }

    #[tokio::test]
    async fn test_stop_waits_for_data_directory() {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MappingStore::new(Box::new(StubEngine::new(8089, 4096))));
        let data_dir_lock = Arc::new(Mutex::new(()));
        let recorder = Arc::new(Recorder::new(
            Arc::clone(&store),
            "http://localhost:8081".to_string(),
            temp_dir.path().to_path_buf(),
            Arc::clone(&data_dir_lock),
        ));

        recorder.start(None).await.unwrap();
        assert!(store.capture(exchange("/a")).await);

        let held = data_dir_lock.lock().await;
        let stopping = tokio::spawn({
            let recorder = Arc::clone(&recorder);
            async move { recorder.stop().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!stopping.is_finished());
        assert_eq!(store.mapping_count().await, 0);
        assert!(!temp_dir.path().join("mappings").exists());

        drop(held);
        let summary = stopping.await.unwrap().unwrap();
        assert_eq!(summary.mappings_recorded, 1);
        assert_eq!(
            std::fs::read_dir(temp_dir.path().join("mappings")).unwrap().count(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_when_idle() {
        let temp_dir = TempDir::new().unwrap();
        let (_, recorder) = recorder(&temp_dir);

        assert!(matches!(
            recorder.stop().await,
            Err(StubvaultError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_start_single_flight() {
        let temp_dir = TempDir::new().unwrap();
        let (_, recorder) = recorder(&temp_dir);
        let recorder = Arc::new(recorder);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let recorder = Arc::clone(&recorder);
                tokio::spawn(async move { recorder.start(None).await })
            })
            .collect();

        let mut started = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => started += 1,
                Err(StubvaultError::AlreadyRecording { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(started, 1);
        assert_eq!(rejected, 7);
    }

    #[tokio::test]
    async fn test_capture_after_stop_discarded() {
        let temp_dir = TempDir::new().unwrap();
        let (store, recorder) = recorder(&temp_dir);

        recorder.start(Some("http://upstream:9000".to_string())).await.unwrap();
        recorder.stop().await.unwrap();

        assert!(!store.capture(exchange("/late")).await);
        assert_eq!(store.mapping_count().await, 0);
    }

    #[tokio::test]
    async fn test_status_is_pure() {
        let temp_dir = TempDir::new().unwrap();
        let (_, recorder) = recorder(&temp_dir);

        let idle = recorder.status().await;
        assert!(!idle.is_recording);
        assert_eq!(idle.proxy_url, "http://localhost:8081");
        assert!(idle.started_at.is_none());

        recorder.start(Some("http://upstream:9000".to_string())).await.unwrap();
        let first = recorder.status().await;
        let second = recorder.status().await;
        assert!(first.is_recording);
        assert_eq!(first.proxy_url, "http://upstream:9000");
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(first.mock_port, 8089);
    }

    #[tokio::test]
    async fn test_rejects_relative_upstream() {
        let temp_dir = TempDir::new().unwrap();
        let (_, recorder) = recorder(&temp_dir);

        assert!(matches!(
            recorder.start(Some("/not/absolute".to_string())).await,
            Err(StubvaultError::ConfigError(_))
        ));
        assert_eq!(recorder.state().await, RecordingState::Idle);
    }

    #[tokio::test]
    async fn test_reset_in_any_state() {
        let temp_dir = TempDir::new().unwrap();
        let (store, recorder) = recorder(&temp_dir);

        store
            .add_mapping(crate::mapping::Mapping::get("a", "/a", 200, "x"))
            .await
            .unwrap();
        recorder.start(None).await.unwrap();
        recorder.reset().await;

        assert_eq!(store.mapping_count().await, 0);
        assert!(recorder.state().await != RecordingState::Idle);
    }
}
