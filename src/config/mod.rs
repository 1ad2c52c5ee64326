mod file_config;

pub use file_config::{FileConfig, TransferConfig};

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::transfer_manager::DEFAULT_BLOCK_SIZE;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub store_path: Option<PathBuf>,
    pub service_url: Option<String>,
    pub max_concurrent: Option<usize>,
    pub block_size: Option<u64>,
    pub request_timeout_secs: Option<u64>,
}

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Path to the SQLite progress store.
    pub store_path: PathBuf,
    /// Base URL of the object-storage service.
    pub service_url: String,
    pub transfer: TransferSettings,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let store_path = file
            .store_path
            .map(PathBuf::from)
            .or_else(|| cli.store_path.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("store_path must be specified via --store-path or in config file")
            })?;

        if let Some(parent) = store_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                bail!("Store directory does not exist: {:?}", parent);
            }
        }

        let service_url = file
            .service_url
            .or_else(|| cli.service_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("service_url must be specified via --service-url or in config file")
            })?;
        let service_url = service_url.trim_end_matches('/').to_string();
        if service_url.is_empty() {
            bail!("service_url must not be empty");
        }

        let tf = file.transfer.unwrap_or_default();
        let defaults = TransferSettings::default();
        let transfer = TransferSettings {
            max_concurrent: tf
                .max_concurrent
                .or(cli.max_concurrent)
                .unwrap_or(defaults.max_concurrent)
                .max(1),
            block_size: tf
                .block_size
                .or(cli.block_size)
                .unwrap_or(defaults.block_size)
                .max(1),
            max_retries: tf.max_retries.unwrap_or(defaults.max_retries),
            initial_backoff_ms: tf.initial_backoff_ms.unwrap_or(defaults.initial_backoff_ms),
            max_backoff_ms: tf.max_backoff_ms.unwrap_or(defaults.max_backoff_ms),
            backoff_multiplier: tf
                .backoff_multiplier
                .unwrap_or(defaults.backoff_multiplier),
            probe_interval_secs: tf
                .probe_interval_secs
                .unwrap_or(defaults.probe_interval_secs),
            request_timeout_secs: tf
                .request_timeout_secs
                .or(cli.request_timeout_secs)
                .unwrap_or(defaults.request_timeout_secs),
        };

        Ok(Self {
            store_path,
            service_url,
            transfer,
        })
    }
}

/// Tunables for the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Maximum number of work units running concurrently.
    pub max_concurrent: usize,
    /// Chunk size used for decomposition.
    pub block_size: u64,
    /// Retries per work unit before permanent failure.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Interval between reachability probes.
    pub probe_interval_secs: u64,
    /// Per-request timeout handed to the HTTP client.
    pub request_timeout_secs: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            block_size: DEFAULT_BLOCK_SIZE,
            max_retries: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            probe_interval_secs: 10,
            request_timeout_secs: 300,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_cli_only() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            store_path: Some(dir.path().join("transfers.db")),
            service_url: Some("http://store:9000/".to_string()),
            max_concurrent: Some(8),
            block_size: Some(1024),
            request_timeout_secs: Some(60),
        };

        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.store_path, dir.path().join("transfers.db"));
        // trailing slash is stripped
        assert_eq!(config.service_url, "http://store:9000");
        assert_eq!(config.transfer.max_concurrent, 8);
        assert_eq!(config.transfer.block_size, 1024);
        assert_eq!(config.transfer.request_timeout_secs, 60);
        // untouched tunables keep their defaults
        assert_eq!(config.transfer.max_retries, 3);
    }

    #[test]
    fn test_resolve_toml_overrides_cli() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            store_path: Some(PathBuf::from("/should/be/overridden/x.db")),
            service_url: Some("http://cli:1".to_string()),
            max_concurrent: Some(2),
            ..Default::default()
        };
        let file = FileConfig {
            store_path: Some(
                dir.path()
                    .join("transfers.db")
                    .to_string_lossy()
                    .to_string(),
            ),
            service_url: Some("http://toml:2".to_string()),
            transfer: Some(TransferConfig {
                max_concurrent: Some(6),
                max_retries: Some(5),
                ..Default::default()
            }),
        };

        let config = AppConfig::resolve(&cli, Some(file)).unwrap();
        assert_eq!(config.store_path, dir.path().join("transfers.db"));
        assert_eq!(config.service_url, "http://toml:2");
        assert_eq!(config.transfer.max_concurrent, 6);
        assert_eq!(config.transfer.max_retries, 5);
    }

    #[test]
    fn test_resolve_missing_store_path_error() {
        let cli = CliConfig {
            service_url: Some("http://store:9000".to_string()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("store_path must be specified"));
    }

    #[test]
    fn test_resolve_missing_service_url_error() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            store_path: Some(dir.path().join("transfers.db")),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("service_url must be specified"));
    }

    #[test]
    fn test_resolve_nonexistent_store_dir_error() {
        let cli = CliConfig {
            store_path: Some(PathBuf::from("/nonexistent/dir/transfers.db")),
            service_url: Some("http://store:9000".to_string()),
            ..Default::default()
        };
        let result = AppConfig::resolve(&cli, None);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("does not exist"));
    }

    #[test]
    fn test_zero_values_are_clamped() {
        let dir = TempDir::new().unwrap();
        let cli = CliConfig {
            store_path: Some(dir.path().join("transfers.db")),
            service_url: Some("http://store:9000".to_string()),
            max_concurrent: Some(0),
            block_size: Some(0),
            ..Default::default()
        };
        let config = AppConfig::resolve(&cli, None).unwrap();
        assert_eq!(config.transfer.max_concurrent, 1);
        assert_eq!(config.transfer.block_size, 1);
    }

    #[test]
    fn test_settings_defaults() {
        let settings = TransferSettings::default();
        assert_eq!(settings.max_concurrent, 4);
        assert_eq!(settings.block_size, DEFAULT_BLOCK_SIZE);
        assert_eq!(settings.max_retries, 3);
    }
}
