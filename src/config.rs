use std::path::PathBuf;
use std::time::Duration;

use medisync_core::{MergePolicy, StoreConfig};
use serde::{Deserialize, Serialize};

const DEFAULT_SERVER_URL: &str = "http://localhost:8080";
const DEFAULT_SNAPSHOT_TIMEOUT_SECS: u64 = 10;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// How the stores reconcile with the server
#[derive(Debug, Clone, Serialize)]
pub struct SyncSettings {
    /// Merge policy applied to every snapshot
    pub merge_policy: ConfigValue<MergePolicy>,
    /// Seconds to wait for a live query's first snapshot
    pub snapshot_timeout_secs: ConfigValue<u64>,
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Server URL (e.g., "http://localhost:8080")
    pub server_url: ConfigValue<String>,
    /// API key for authentication
    #[serde(skip_serializing)]
    pub api_key: ConfigValue<Option<String>>,
    pub sync: SyncSettings,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
}

/// Internal struct for deserializing the sync section
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SyncFile {
    merge_policy: Option<MergePolicy>,
    snapshot_timeout_secs: Option<u64>,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    server_url: Option<String>,
    api_key: Option<String>,
    sync: Option<SyncFile>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut server_url =
            ConfigValue::new(DEFAULT_SERVER_URL.to_string(), ConfigSource::Default);
        let mut api_key = ConfigValue::new(None, ConfigSource::Default);
        let mut merge_policy = ConfigValue::new(MergePolicy::default(), ConfigSource::Default);
        let mut snapshot_timeout_secs =
            ConfigValue::new(DEFAULT_SNAPSHOT_TIMEOUT_SECS, ConfigSource::Default);
        let mut config_file = None;

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(url) = file_config.server_url {
                server_url = ConfigValue::new(url, ConfigSource::File);
            }
            if let Some(key) = file_config.api_key {
                api_key = ConfigValue::new(Some(key), ConfigSource::File);
            }
            if let Some(sync) = file_config.sync {
                if let Some(policy) = sync.merge_policy {
                    merge_policy = ConfigValue::new(policy, ConfigSource::File);
                }
                if let Some(secs) = sync.snapshot_timeout_secs {
                    snapshot_timeout_secs = ConfigValue::new(secs, ConfigSource::File);
                }
            }
        }

        // Apply environment variable overrides
        if let Ok(url) = std::env::var("MEDISYNC_SERVER_URL") {
            server_url = ConfigValue::new(url, ConfigSource::Environment);
        }
        if let Ok(key) = std::env::var("MEDISYNC_API_KEY") {
            api_key = ConfigValue::new(Some(key), ConfigSource::Environment);
        }

        Ok(Self {
            server_url,
            api_key,
            sync: SyncSettings {
                merge_policy,
                snapshot_timeout_secs,
            },
            config_file,
        })
    }

    /// API key, or an error telling the user how to set one.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key.value.as_deref().ok_or(ConfigError::MissingApiKey)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            merge_policy: self.sync.merge_policy.value,
            ..StoreConfig::default()
        }
    }

    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.snapshot_timeout_secs.value)
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/medisync/
    /// - macOS: ~/Library/Application Support/medisync/
    /// - Windows: %APPDATA%/medisync/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("medisync")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
    MissingApiKey,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::MissingApiKey => write!(
                f,
                "No API key configured. Set api_key in the config file or MEDISYNC_API_KEY."
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_without_file() {
        let temp_dir = tempdir().unwrap();
        let config = Config::load(Some(temp_dir.path().join("nonexistent.yaml"))).unwrap();

        assert!(config.config_file.is_none());
        assert_eq!(config.sync.merge_policy.value, MergePolicy::ServerWins);
        assert_eq!(config.sync.merge_policy.source, ConfigSource::Default);
        assert_eq!(config.snapshot_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "server_url: https://clinic.example.com").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  merge_policy: retain-unsynced").unwrap();
        writeln!(file, "  snapshot_timeout_secs: 3").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        if std::env::var("MEDISYNC_SERVER_URL").is_err() {
            assert_eq!(config.server_url.value, "https://clinic.example.com");
            assert_eq!(config.server_url.source, ConfigSource::File);
        }
        assert_eq!(config.sync.merge_policy.value, MergePolicy::RetainUnsynced);
        assert_eq!(config.sync.merge_policy.source, ConfigSource::File);
        assert_eq!(config.store_config().merge_policy, MergePolicy::RetainUnsynced);
        assert_eq!(config.snapshot_timeout(), Duration::from_secs(3));
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "api_key: fromfile").unwrap();

        std::env::set_var("MEDISYNC_API_KEY", "fromenv");
        let config = Config::load(Some(config_path)).unwrap();
        std::env::remove_var("MEDISYNC_API_KEY");

        assert_eq!(config.api_key.value.as_deref(), Some("fromenv"));
        assert_eq!(config.api_key.source, ConfigSource::Environment);
    }

    #[test]
    fn test_invalid_merge_policy_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  merge_policy: whatever").unwrap();

        let err = Config::load(Some(config_path)).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }

    #[test]
    fn test_api_key_is_not_serialized() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(&config_path, "api_key: super-secret\n").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("super-secret"));
    }
}
