//! Configuration types for Stubvault

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::{Result, StubvaultError};

/// Operating mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Stub mode: serve mappings loaded from the data directory
    #[default]
    Stub,
    /// Record mode: proxy to the upstream and capture traffic from startup
    Record,
    /// Replay mode: restore a stored snapshot at startup and serve it
    Replay,
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode
    #[serde(default)]
    pub mode: Mode,
    /// Directory holding the live `mappings/` and `__files/` areas
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Load mappings (and endpoint files) from `root_dir` at startup
    #[serde(default = "default_true")]
    pub auto_load: bool,
    /// Prefix prepended to logical paths in introspection queries
    #[serde(default = "default_path_prefix")]
    pub logical_path_prefix: String,
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Recording configuration
    #[serde(default)]
    pub recording: RecordingConfig,
    /// Replay configuration
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Snapshot storage backend
    #[serde(default)]
    pub storage: StorageConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            root_dir: default_root_dir(),
            auto_load: true,
            logical_path_prefix: default_path_prefix(),
            server: ServerConfig::default(),
            recording: RecordingConfig::default(),
            replay: ReplayConfig::default(),
            storage: StorageConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

fn default_root_dir() -> PathBuf {
    PathBuf::from("./mock-data")
}

fn default_true() -> bool {
    true
}

fn default_path_prefix() -> String {
    "/api".to_string()
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address both listeners bind to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Port of the admin API (snapshots, recording, introspection)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,
    /// Port serving stubs (or proxying while recording)
    #[serde(default = "default_mock_port")]
    pub mock_port: u16,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    8080
}

fn default_mock_port() -> u16 {
    8089
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            admin_port: default_admin_port(),
            mock_port: default_mock_port(),
        }
    }
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingConfig {
    /// Upstream used when a start request names none
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    /// Response bodies up to this size (UTF-8 only) are stored inline
    #[serde(default = "default_inline_body_limit")]
    pub inline_body_limit: usize,
}

fn default_proxy_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_inline_body_limit() -> usize {
    4096
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            proxy_url: default_proxy_url(),
            inline_body_limit: default_inline_body_limit(),
        }
    }
}

/// Replay configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Snapshot restored at startup in replay mode
    #[serde(default)]
    pub snapshot: Option<String>,
}

/// Storage backend selector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    /// Local directory
    #[default]
    #[serde(alias = "LOCAL")]
    Local,
    /// Git-hosted repository through the contents API
    #[serde(alias = "REMOTE_REPO", alias = "github", alias = "GITHUB")]
    RemoteRepo,
    /// Artifact repository with maven2 layout
    #[serde(alias = "ARTIFACT_REPO", alias = "nexus", alias = "NEXUS")]
    ArtifactRepo,
}

/// Snapshot storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default, rename = "type")]
    pub storage_type: StorageType,
    /// Timeout for a single remote call
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Local backend parameters
    #[serde(default)]
    pub local: LocalStorageConfig,
    /// Remote repository parameters
    #[serde(default)]
    pub remote_repo: RemoteRepoConfig,
    /// Artifact repository parameters
    #[serde(default)]
    pub artifact_repo: ArtifactRepoConfig,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Local,
            request_timeout_ms: default_request_timeout_ms(),
            local: LocalStorageConfig::default(),
            remote_repo: RemoteRepoConfig::default(),
            artifact_repo: ArtifactRepoConfig::default(),
        }
    }
}

/// Local directory backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalStorageConfig {
    /// Directory holding `<name>.zip` archives
    #[serde(default = "default_snapshot_dir")]
    pub directory: PathBuf,
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("./snapshots")
}

impl Default for LocalStorageConfig {
    fn default() -> Self {
        Self {
            directory: default_snapshot_dir(),
        }
    }
}

/// Git-hosted repository backend (GitHub contents API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRepoConfig {
    /// API base URL
    #[serde(default = "default_github_api")]
    pub api_url: String,
    /// Repository as `owner/name`
    #[serde(default)]
    pub repository: String,
    /// Branch receiving snapshot commits
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Access token
    #[serde(default)]
    pub token: String,
    /// Directory inside the repository
    #[serde(default = "default_base_dir")]
    pub base_dir: String,
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_base_dir() -> String {
    "snapshots".to_string()
}

impl Default for RemoteRepoConfig {
    fn default() -> Self {
        Self {
            api_url: default_github_api(),
            repository: String::new(),
            branch: default_branch(),
            token: String::new(),
            base_dir: default_base_dir(),
        }
    }
}

/// Artifact repository backend (maven2 layout)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRepoConfig {
    /// Repository manager base URL
    #[serde(default)]
    pub url: String,
    /// Hosted repository name
    #[serde(default)]
    pub repository: String,
    /// Basic auth user
    #[serde(default)]
    pub username: Option<String>,
    /// Basic auth password
    #[serde(default)]
    pub password: Option<String>,
    /// Maven group id (dots become path segments)
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Maven artifact id
    #[serde(default = "default_artifact_id")]
    pub artifact_id: String,
}

fn default_group_id() -> String {
    "com.example".to_string()
}

fn default_artifact_id() -> String {
    "mock-snapshots".to_string()
}

impl Default for ArtifactRepoConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            repository: String::new(),
            username: None,
            password: None,
            group_id: default_group_id(),
            artifact_id: default_artifact_id(),
        }
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    /// Maximum headers per request/response
    pub max_headers: usize,
    /// Maximum snapshot archive size in bytes
    pub max_archive_size: usize,
    /// Maximum uncompressed size of one archive entry
    pub max_entry_size: usize,
    /// Maximum number of archive entries
    pub max_archive_entries: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            max_headers: 128,
            max_archive_size: 512 * 1024 * 1024, // 512 MB
            max_entry_size: 256 * 1024 * 1024,   // 256 MB
            max_archive_entries: 100_000,
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StubvaultError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| StubvaultError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid or the selected backend
    /// lacks required credentials or identifiers
    pub fn validate(&self) -> Result<()> {
        if self.server.admin_port == 0 || self.server.mock_port == 0 {
            return Err(StubvaultError::ConfigError(
                "Listener ports cannot be 0".to_string(),
            ));
        }

        if self.server.admin_port == self.server.mock_port {
            return Err(StubvaultError::ConfigError(format!(
                "admin_port and mock_port must differ (both {})",
                self.server.admin_port
            )));
        }

        if self.mode == Mode::Replay && self.replay.snapshot.is_none() {
            return Err(StubvaultError::ConfigError(
                "Replay mode requires replay.snapshot".to_string(),
            ));
        }

        if self.mode == Mode::Record && self.recording.proxy_url.trim().is_empty() {
            return Err(StubvaultError::ConfigError(
                "Record mode requires recording.proxy_url".to_string(),
            ));
        }

        if !self.logical_path_prefix.is_empty() && !self.logical_path_prefix.starts_with('/') {
            return Err(StubvaultError::ConfigError(format!(
                "logical_path_prefix must start with '/': {}",
                self.logical_path_prefix
            )));
        }

        self.storage.validate()?;

        let limits = &self.limits;
        for (name, value) in [
            ("max_connections", limits.max_connections),
            ("max_request_size", limits.max_request_size),
            ("max_response_size", limits.max_response_size),
            ("max_headers", limits.max_headers),
            ("max_archive_size", limits.max_archive_size),
            ("max_entry_size", limits.max_entry_size),
            ("max_archive_entries", limits.max_archive_entries),
        ] {
            if value == 0 {
                return Err(StubvaultError::ConfigError(format!("{name} must be > 0")));
            }
        }

        Ok(())
    }
}

impl StorageConfig {
    /// Validate the parameters of the selected backend only
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` naming the first missing parameter
    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(StubvaultError::ConfigError(
                "storage.request_timeout_ms must be > 0".to_string(),
            ));
        }

        match self.storage_type {
            StorageType::Local => {
                if self.local.directory.as_os_str().is_empty() {
                    return Err(StubvaultError::ConfigError(
                        "storage.local.directory is required for local storage".to_string(),
                    ));
                }
            }
            StorageType::RemoteRepo => {
                let repo = &self.remote_repo;
                if repo.token.trim().is_empty() {
                    return Err(StubvaultError::ConfigError(
                        "storage.remote_repo.token is required for remote_repo storage".to_string(),
                    ));
                }
                if repo.repository.split('/').filter(|s| !s.is_empty()).count() != 2 {
                    return Err(StubvaultError::ConfigError(format!(
                        "storage.remote_repo.repository must be 'owner/name', got '{}'",
                        repo.repository
                    )));
                }
                if repo.branch.trim().is_empty() {
                    return Err(StubvaultError::ConfigError(
                        "storage.remote_repo.branch cannot be empty".to_string(),
                    ));
                }
            }
            StorageType::ArtifactRepo => {
                let repo = &self.artifact_repo;
                if repo.url.trim().is_empty() {
                    return Err(StubvaultError::ConfigError(
                        "storage.artifact_repo.url is required for artifact_repo storage".to_string(),
                    ));
                }
                if repo.repository.trim().is_empty() {
                    return Err(StubvaultError::ConfigError(
                        "storage.artifact_repo.repository is required for artifact_repo storage"
                            .to_string(),
                    ));
                }
                if repo.group_id.trim().is_empty() || repo.artifact_id.trim().is_empty() {
                    return Err(StubvaultError::ConfigError(
                        "storage.artifact_repo group_id and artifact_id cannot be empty"
                            .to_string(),
                    ));
                }
                if repo.username.is_some() != repo.password.is_some() {
                    return Err(StubvaultError::ConfigError(
                        "storage.artifact_repo username and password must be set together"
                            .to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            mode = "record"
            root_dir = "/tmp/mock-data"

            [recording]
            proxy_url = "http://localhost:9000"

            [storage]
            type = "local"

            [storage.local]
            directory = "/tmp/snapshots"
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.mode, Mode::Record);
        assert_eq!(config.recording.proxy_url, "http://localhost:9000");
        assert_eq!(config.storage.storage_type, StorageType::Local);
        assert_eq!(config.server.admin_port, 8080);
        assert_eq!(config.logical_path_prefix, "/api");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r#"
            mode = "replay"

            [replay]
            snapshot = "v1"

            [storage]
            type = "ARTIFACT_REPO"

            [storage.artifact_repo]
            url = "https://nexus.example.com"
            repository = "mocks"
        "#;
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mode, Mode::Replay);
        assert_eq!(config.storage.storage_type, StorageType::ArtifactRepo);
        assert_eq!(config.storage.artifact_repo.artifact_id, "mock-snapshots");
    }

    #[test]
    fn test_remote_repo_requires_token() {
        let config_toml = r#"
            [storage]
            type = "remote_repo"

            [storage.remote_repo]
            repository = "acme/mocks"
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, StubvaultError::ConfigError(ref msg) if msg.contains("token")));
    }

    #[test]
    fn test_remote_repo_requires_owner_and_name() {
        let mut config = Config::default();
        config.storage.storage_type = StorageType::RemoteRepo;
        config.storage.remote_repo.token = "t0ken".to_string();
        config.storage.remote_repo.repository = "just-a-name".to_string();

        assert!(config.validate().is_err());

        config.storage.remote_repo.repository = "acme/mocks".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_artifact_repo_requires_url() {
        let mut config = Config::default();
        config.storage.storage_type = StorageType::ArtifactRepo;
        config.storage.artifact_repo.repository = "mocks".to_string();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replay_requires_snapshot() {
        let config = Config {
            mode: Mode::Replay,
            ..Config::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ports_must_differ() {
        let mut config = Config::default();
        config.server.mock_port = config.server.admin_port;

        assert!(config.validate().is_err());
    }
}
