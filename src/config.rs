//! Client configuration
//!
//! Manages the syncpoint.toml configuration file.
//!
//! ## Environment Variables
//!
//! The following environment variables override config file settings:
//!
//! - `SYNCPOINT_REMOTE_URL` - URL of the remote Syncpoint service
//! - `SYNCPOINT_APP_ID` - Application id
//! - `SYNCPOINT_DATA_DIR` - Directory holding the local store
//!
//! These can be set in a `.env` file next to the configuration file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{SyncpointError, SyncpointResult};

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "syncpoint.toml";

/// Local store file name inside the data directory
pub const STORE_FILE_NAME: &str = "syncpoint.db";

/// Environment variable names
pub const ENV_REMOTE_URL: &str = "SYNCPOINT_REMOTE_URL";
pub const ENV_APP_ID: &str = "SYNCPOINT_APP_ID";
pub const ENV_DATA_DIR: &str = "SYNCPOINT_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// URL of the remote Syncpoint-enabled server
    pub remote_url: String,
    /// Relates the client code to the server storage
    pub app_id: String,
    /// Directory of the local store; defaults to `<user data dir>/<app_id>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    /// Local database holding session, channel, subscription and
    /// installation documents
    #[serde(default = "default_control_database")]
    pub control_database: String,
    /// Remote database used for the pairing handshake
    #[serde(default = "default_handshake_database")]
    pub handshake_database: String,
    /// Start replication of local installations automatically
    #[serde(default = "default_auto_sync")]
    pub auto_sync: bool,
    #[serde(default = "default_retry_interval_ms")]
    pub retry_interval_ms: u64,
}

fn default_control_database() -> String {
    "sp_control".to_string()
}

fn default_handshake_database() -> String {
    "sp_handshake".to_string()
}

fn default_auto_sync() -> bool {
    true
}

fn default_retry_interval_ms() -> u64 {
    5000
}

impl ClientConfig {
    pub fn new(remote_url: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self {
            remote_url: remote_url.into(),
            app_id: app_id.into(),
            data_dir: None,
            control_database: default_control_database(),
            handshake_database: default_handshake_database(),
            auto_sync: default_auto_sync(),
            retry_interval_ms: default_retry_interval_ms(),
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(data_dir.into());
        self
    }

    pub fn with_auto_sync(mut self, auto_sync: bool) -> Self {
        self.auto_sync = auto_sync;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Load configuration from a directory
    ///
    /// This also loads any `.env` file in the directory and applies
    /// environment variable overrides.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let env_path = dir.join(".env");
        if env_path.exists() {
            let _ = dotenvy::from_path(&env_path);
        }

        let config_path = dir.join(CONFIG_FILE_NAME);
        if !config_path.exists() {
            anyhow::bail!(
                "Configuration file not found: {}\nRun 'syncpoint init' to create one.",
                config_path.display()
            );
        }

        let content = std::fs::read_to_string(&config_path)?;
        let mut config: ClientConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Save configuration to a directory
    pub fn save(&self, dir: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(dir.join(CONFIG_FILE_NAME), content)?;
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(remote_url) = std::env::var(ENV_REMOTE_URL) {
            if !remote_url.is_empty() {
                self.remote_url = remote_url;
            }
        }

        if let Ok(app_id) = std::env::var(ENV_APP_ID) {
            if !app_id.is_empty() {
                self.app_id = app_id;
            }
        }

        if let Ok(data_dir) = std::env::var(ENV_DATA_DIR) {
            if !data_dir.is_empty() {
                self.data_dir = Some(PathBuf::from(data_dir));
            }
        }
    }

    /// Check the settings that would otherwise only fail once the client runs
    pub fn validate(&self) -> SyncpointResult<()> {
        self.remote_url()?;
        if self.app_id.trim().is_empty() {
            return Err(SyncpointError::Config("app_id must not be empty".to_string()));
        }
        crate::storage::validate_database_name(&self.control_database)?;
        crate::storage::validate_database_name(&self.handshake_database)?;
        Ok(())
    }

    /// The remote URL, normalised to end in `/` so database names join
    /// under it rather than replacing its last segment.
    pub fn remote_url(&self) -> SyncpointResult<Url> {
        let mut url = Url::parse(&self.remote_url)
            .map_err(|e| SyncpointError::Config(format!("Invalid remote_url '{}': {}", self.remote_url, e)))?;
        if url.cannot_be_a_base() {
            return Err(SyncpointError::Config(format!(
                "remote_url '{}' cannot hold database paths",
                self.remote_url
            )));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// Directory of the local store
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(&self.app_id)
        })
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir().join(STORE_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("http://sync.example.com", "notes");
        assert_eq!(config.control_database, "sp_control");
        assert_eq!(config.handshake_database, "sp_handshake");
        assert!(config.auto_sync);
        assert_eq!(config.retry_interval(), Duration::from_secs(5));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_remote_url_is_normalised() {
        let config = ClientConfig::new("http://sync.example.com/api", "notes");
        let url = config.remote_url().unwrap();
        assert_eq!(url.as_str(), "http://sync.example.com/api/");
        assert_eq!(
            url.join("channel-1").unwrap().as_str(),
            "http://sync.example.com/api/channel-1"
        );

        let config = ClientConfig::new("http://sync.example.com", "notes");
        assert_eq!(config.remote_url().unwrap().as_str(), "http://sync.example.com/");
    }

    #[test]
    fn test_invalid_settings() {
        let config = ClientConfig::new("not a url", "notes");
        assert!(matches!(config.validate(), Err(SyncpointError::Config(_))));

        let config = ClientConfig::new("mailto:someone@example.com", "notes");
        assert!(matches!(config.remote_url(), Err(SyncpointError::Config(_))));

        let config = ClientConfig::new("http://sync.example.com", " ");
        assert!(matches!(config.validate(), Err(SyncpointError::Config(_))));

        let mut config = ClientConfig::new("http://sync.example.com", "notes");
        config.control_database = "Control".to_string();
        assert!(matches!(config.validate(), Err(SyncpointError::Store(_))));
    }

    #[test]
    fn test_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let config = ClientConfig::new("http://sync.example.com/", "notes")
            .with_auto_sync(false)
            .with_retry_interval(Duration::from_millis(250));
        config.save(tmp.path()).unwrap();

        let loaded = ClientConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.remote_url, config.remote_url);
        assert!(!loaded.auto_sync);
        assert_eq!(loaded.retry_interval_ms, 250);
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            "remote_url = \"http://sync.example.com/\"\napp_id = \"notes\"\n",
        )
        .unwrap();

        let loaded = ClientConfig::load(tmp.path()).unwrap();
        assert_eq!(loaded.control_database, "sp_control");
        assert!(loaded.auto_sync);
        assert!(loaded.data_dir.is_none());
    }

    #[test]
    fn test_missing_file() {
        let tmp = TempDir::new().unwrap();
        assert!(ClientConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn test_data_dir() {
        let config = ClientConfig::new("http://sync.example.com/", "notes").with_data_dir("/tmp/sp");
        assert_eq!(config.store_path(), PathBuf::from("/tmp/sp/syncpoint.db"));
    }
}
