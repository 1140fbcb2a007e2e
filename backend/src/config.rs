use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "INGEST_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "ingest.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub pipeline: PipelineConfig,
    pub validation: ValidationConfig,
    pub cache: CacheConfig,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
    /// Where uploaded source files wait to be processed.
    pub upload_dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConfig {
    pub chunk_size: u32,
    pub max_file_size: u64,
    pub worker_count: usize,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub backoff_factor: f64,
    pub completion_timeout_secs: u64,
    /// Row errors retained per upload.
    pub error_cap: usize,
    pub channel_capacity: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ValidationConfig {
    pub required_columns: Vec<String>,
    pub allowed_mime_types: Vec<String>,
    /// Allowed gap between `Quantity * Item Price` and `Total`.
    pub price_tolerance: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("ingest.sqlite"),
            upload_dir: PathBuf::from("uploads"),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            max_file_size: 100 * 1024 * 1024,
            worker_count: 4,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            backoff_factor: 2.0,
            completion_timeout_secs: 30 * 60,
            error_cap: 100,
            channel_capacity: 1024,
        }
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            required_columns: [
                "Invoice ID",
                "Customer Name",
                "Item Name",
                "Item Price",
                "Quantity",
                "Total",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            allowed_mime_types: [
                "text/csv",
                "application/csv",
                "text/plain",
                "application/vnd.ms-excel",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            price_tolerance: 0.01,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            stale_after_secs: 24 * 60 * 60,
        }
    }
}

impl PipelineConfig {
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

impl Config {
    /// Loads `$INGEST_CONFIG` or `./ingest.toml`. A missing file means defaults.
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        if !path.exists() {
            return Ok(Config::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let toml_str = fs::read_to_string(path)?;
        Self::from_toml(&toml_str)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let config: Config = toml::from_str(toml_str)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let config = Config::from_toml(
            r#"
            [pipeline]
            chunk_size = 250
            max_retries = 5

            [sweeper]
            stale_after_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline.chunk_size, 250);
        assert_eq!(config.pipeline.max_retries, 5);
        assert_eq!(config.pipeline.worker_count, 4);
        assert_eq!(config.sweeper.stale_after(), Duration::from_secs(60));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.validation.required_columns.len(), 6);
    }

    #[test]
    fn defaults_follow_the_documented_limits() {
        let config = Config::default();
        assert_eq!(config.pipeline.chunk_size, 1000);
        assert_eq!(config.pipeline.completion_timeout(), Duration::from_secs(1800));
        assert_eq!(config.sweeper.stale_after(), Duration::from_secs(86_400));
    }
}
