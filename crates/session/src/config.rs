//! Consumer configuration.
//!
//! Loaded from YAML with per-field defaults matching the vendor training
//! apps (localhost:14002, service DIRECT_FEED, item TRI, 300 second run).
//! The binary layers CLI overrides on top.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::directory::DirectoryBounds;
use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Local interface address to bind the outbound connection to.
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default = "default_run_time")]
    pub run_time_secs: u64,
    #[serde(default = "default_service")]
    pub service_name: String,
    #[serde(default = "default_item")]
    pub item_name: String,
    #[serde(default = "default_user")]
    pub user_name: String,
    /// Directory holding local dictionary files. When both files load,
    /// the dictionary download step is skipped entirely.
    #[serde(default)]
    pub dictionary_dir: Option<PathBuf>,
    #[serde(default)]
    pub directory_bounds: DirectoryBounds,
    /// Bound on flush iterations during graceful shutdown.
    #[serde(default = "default_flush_attempts")]
    pub shutdown_flush_attempts: u32,
}

fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    14002
}
fn default_run_time() -> u64 {
    300
}
fn default_service() -> String {
    "DIRECT_FEED".to_string()
}
fn default_item() -> String {
    "TRI".to_string()
}
fn default_user() -> String {
    "user".to_string()
}
fn default_flush_attempts() -> u32 {
    10
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            interface: None,
            run_time_secs: default_run_time(),
            service_name: default_service(),
            item_name: default_item(),
            user_name: default_user(),
            dictionary_dir: None,
            directory_bounds: DirectoryBounds::default(),
            shutdown_flush_attempts: default_flush_attempts(),
        }
    }
}

impl ConsumerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsumerConfig = serde_yaml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_match_training_apps() {
        let config = ConsumerConfig::default();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 14002);
        assert_eq!(config.run_time_secs, 300);
        assert_eq!(config.service_name, "DIRECT_FEED");
        assert_eq!(config.item_name, "TRI");
    }

    #[test]
    fn test_load_partial_yaml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "host: feed.example.com").unwrap();
        writeln!(file, "service_name: ELEKTRON_DD").unwrap();
        writeln!(file, "directory_bounds:").unwrap();
        writeln!(file, "  max_services: 8").unwrap();

        let config = ConsumerConfig::load(file.path()).unwrap();
        assert_eq!(config.host, "feed.example.com");
        assert_eq!(config.service_name, "ELEKTRON_DD");
        assert_eq!(config.port, 14002);
        assert_eq!(config.directory_bounds.max_services, 8);
    }
}
