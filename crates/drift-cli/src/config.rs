//! Configuration for the DRIFT CLI.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// DRIFT configuration, loaded from a TOML file.
///
/// Every field has a default; a missing config file means all defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Transfer configuration
    #[serde(default)]
    pub transfer: TransferConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Local bind address for the engine or receive server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

/// Transfer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Chunk payload size in bytes
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Directory for durable checkpoint records
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,
    /// Directory where received files are assembled
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (overridden by `RUST_LOG`)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            checkpoint_dir: default_checkpoint_dir(),
            output_dir: default_output_dir(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_chunk_size() -> usize {
    drift_engine::CHUNK_SIZE
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from("drift-state/checkpoints")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("received")
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from a TOML file; missing file means defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
