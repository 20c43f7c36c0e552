use std::collections::HashMap;
use std::path::{Path, PathBuf};

use medisync_core::{AccessPolicy, OwnerId};
use serde::Deserialize;

/// API key entry in config
#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    pub owner_id: String,
}

/// Access rules applied to every caller.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Rules {
    /// Reject queries filtered by a field, as some deployments' rules do
    #[serde(default)]
    pub reject_filtered_queries: bool,
}

impl Rules {
    pub fn access_policy(&self) -> AccessPolicy {
        if self.reject_filtered_queries {
            AccessPolicy::RejectFilteredAtSetup
        } else {
            AccessPolicy::Open
        }
    }
}

/// Config file structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
    #[serde(default)]
    pub rules: Rules,
}

impl ConfigFile {
    /// Loads the config file. A missing or malformed file yields an empty
    /// config, so every authenticated request fails.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str::<ConfigFile>(&contents) {
                Ok(config) => config,
                Err(e) => {
                    tracing::warn!("Failed to parse config file: {}", e);
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {}", path.display(), e);
                tracing::warn!("No API keys loaded - all authenticated requests will fail");
                Self::default()
            }
        }
    }
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,
    /// Directory to persist collections
    pub data_dir: PathBuf,
    /// Path to config file
    pub config_path: PathBuf,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let port = std::env::var("MEDISYNC_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8080);

        let data_dir = std::env::var("MEDISYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("medisync-server")
            });

        let config_path = std::env::var("MEDISYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("medisync-server")
                    .join("config.yaml")
            });

        Self {
            port,
            data_dir,
            config_path,
        }
    }
}

/// Maps API keys to the owner they act for.
#[derive(Debug, Clone, Default)]
pub struct ApiKeyStore {
    keys: HashMap<String, OwnerId>,
}

impl ApiKeyStore {
    pub fn from_entries(entries: Vec<ApiKeyEntry>) -> Self {
        let keys: HashMap<String, OwnerId> = entries
            .into_iter()
            .map(|entry| (entry.key, OwnerId::new(entry.owner_id)))
            .collect();
        tracing::info!("Loaded {} API key(s)", keys.len());
        Self { keys }
    }

    /// Validate an API key and return the owner it belongs to
    pub fn validate(&self, key: &str) -> Option<OwnerId> {
        self.keys.get(key).cloned()
    }
}
