//! Configuration management.
//!
//! finflow configuration can come from:
//! - Environment variables (FINFLOW_*)
//! - Config file (~/.config/finflow/config.toml)

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// finflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// AI text-generation backend
    #[serde(default)]
    pub ai: AiConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

/// Storage configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database
    #[serde(default)]
    pub database_path: Option<PathBuf>,
}

/// AI backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiConfig {
    /// Text-generation API endpoint
    #[serde(default = "default_ai_endpoint")]
    pub endpoint: String,

    /// Timeout for generation calls (seconds)
    #[serde(default = "default_ai_timeout")]
    pub timeout_seconds: u64,

    /// Maximum tokens per generation call
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Model to use (optional, backend default otherwise)
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            endpoint: default_ai_endpoint(),
            timeout_seconds: default_ai_timeout(),
            max_tokens: default_max_tokens(),
            model: None,
        }
    }
}

fn default_ai_endpoint() -> String {
    std::env::var("FINFLOW_AI_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:3000/api/chat".to_string())
}

fn default_ai_timeout() -> u64 {
    30
}

fn default_max_tokens() -> u32 {
    2000
}

impl Config {
    /// Load configuration from default locations.
    pub fn load() -> Self {
        let mut config = Self::default();

        let path = Self::config_dir().join("config.toml");
        if let Ok(file_config) = Self::load_from_path(&path) {
            config = file_config;
        }

        config.apply_env_overrides();
        config
    }

    /// Load configuration from a specific file.
    pub fn load_from_path(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents)
            .map_err(|e| crate::Error::Config(format!("Invalid config file: {}", e)))
    }

    /// Get the config directory.
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("finflow")
    }

    /// Get the data directory.
    pub fn data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("finflow")
    }

    /// Resolve the database path, defaulting to the data directory.
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::data_dir().join("finflow.db"))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("FINFLOW_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(host) = std::env::var("FINFLOW_HOST") {
            self.server.host = host;
        }
        if let Ok(db) = std::env::var("FINFLOW_DB") {
            self.storage.database_path = Some(PathBuf::from(db));
        }
        if let Ok(endpoint) = std::env::var("FINFLOW_AI_ENDPOINT") {
            self.ai.endpoint = endpoint;
        }
        if let Ok(timeout) = std::env::var("FINFLOW_AI_TIMEOUT") {
            if let Ok(timeout) = timeout.parse() {
                self.ai.timeout_seconds = timeout;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.ai.timeout_seconds, 30);
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9999

[ai]
endpoint = "http://ai.internal/generate"
timeout_seconds = 5
"#,
        )
        .unwrap();

        let config = Config::load_from_path(&path).unwrap();
        assert_eq!(config.server.port, 9999);
        assert_eq!(config.ai.endpoint, "http://ai.internal/generate");
        assert_eq!(config.ai.timeout_seconds, 5);
        // Unset sections fall back to defaults
        assert_eq!(config.server.host, "127.0.0.1");
    }
}
