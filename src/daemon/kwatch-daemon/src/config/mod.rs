//! Configuration loading and validation
//!
//! Defaults, then the TOML file, then `KWATCH__SECTION__KEY` environment
//! variables, later layers overriding earlier ones.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use kwatch_core::BackendKind;
use kwatch_system::MIN_READ_BUFFER;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::report::OutputFormat;

/// Prefix of environment overrides
pub const ENV_PREFIX: &str = "KWATCH";

/// Main daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub watcher: WatcherConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

/// Notification backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Paths to watch, in registration order
    pub paths: Vec<PathBuf>,
    pub backend: BackendKind,
    /// Bytes per notification read
    pub read_buffer_size: usize,
    /// Upper bound on one wait for events, unbounded when unset
    pub poll_timeout_ms: Option<u64>,
}

/// Event report configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub format: OutputFormat,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, pretty, compact)
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Prometheus exporter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            paths: vec![],
            backend: BackendKind::Inotify,
            read_buffer_size: kwatch_system::DEFAULT_READ_BUFFER,
            poll_timeout_ms: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9091,
        }
    }
}

/// Configuration manager
#[derive(Debug, Default)]
pub struct ConfigManager {
    config: DaemonConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `path` over the defaults, then applies environment overrides
    pub fn load_from_file<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        self.config = Self::build(Some(&contents))
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        self.config_path = Some(path.to_path_buf());

        info!("Loaded configuration from: {}", path.display());
        Ok(())
    }

    /// Defaults plus environment overrides, without a file
    pub fn load_from_env(&mut self) -> Result<()> {
        self.config = Self::build(None).context("Failed to read configuration from environment")?;
        self.config_path = None;
        debug!("Using default configuration with environment overrides");
        Ok(())
    }

    fn build(file_contents: Option<&str>) -> Result<DaemonConfig> {
        let mut builder =
            Config::builder().add_source(Config::try_from(&DaemonConfig::default())?);
        if let Some(contents) = file_contents {
            builder = builder.add_source(File::from_str(contents, FileFormat::Toml));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .list_separator(":")
                .with_list_parse_key("watcher.paths")
                .try_parsing(true),
        );

        Ok(builder.build()?.try_deserialize()?)
    }

    /// Writes the current configuration as TOML
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(&self.config)?;

        std::fs::write(path.as_ref(), config_str)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;

        info!("Saved configuration to: {}", path.as_ref().display());
        Ok(())
    }

    pub fn get_config(&self) -> DaemonConfig {
        self.config.clone()
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Validate configuration
    pub fn validate(config: &DaemonConfig) -> Result<()> {
        if config.watcher.read_buffer_size < MIN_READ_BUFFER {
            anyhow::bail!(
                "read_buffer_size must be at least {} bytes, got {}",
                MIN_READ_BUFFER,
                config.watcher.read_buffer_size
            );
        }

        if config.watcher.poll_timeout_ms == Some(0) {
            anyhow::bail!("poll_timeout_ms must be > 0 when set");
        }

        tracing_subscriber::filter::LevelFilter::from_str(&config.logging.level)
            .with_context(|| format!("Invalid log level: {}", config.logging.level))?;

        if config.metrics.enabled && config.metrics.port == 0 {
            anyhow::bail!("Invalid metrics port: {}", config.metrics.port);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    #[test]
    fn test_config_load_over_defaults() {
        let mut temp_file = NamedTempFile::new().unwrap();

        let config_toml = r#"
[watcher]
paths = ["/tmp/a", "/tmp/b"]
backend = "fanotify"

[output]
format = "json"
"#;

        temp_file.write_all(config_toml.as_bytes()).unwrap();
        temp_file.flush().unwrap();

        let mut manager = ConfigManager::new();
        manager.load_from_file(temp_file.path()).unwrap();

        let config = manager.get_config();
        assert_eq!(
            config.watcher.paths,
            vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]
        );
        assert_eq!(config.watcher.backend, BackendKind::Fanotify);
        assert_eq!(config.watcher.read_buffer_size, 8192);
        assert_eq!(config.output.format, OutputFormat::Json);
        assert_eq!(config.logging, LoggingConfig::default());
        assert_eq!(manager.config_path(), Some(temp_file.path()));
    }

    #[test]
    fn test_saved_config_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("kwatch.toml");

        let manager = ConfigManager::new();
        manager.save_to_file(&path).unwrap();

        let mut loaded = ConfigManager::new();
        loaded.load_from_file(&path).unwrap();
        assert_eq!(loaded.get_config(), DaemonConfig::default());
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[watcher]\nbackend = \"kqueue\"\n")
            .unwrap();

        let mut manager = ConfigManager::new();
        assert!(manager.load_from_file(temp_file.path()).is_err());
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let mut manager = ConfigManager::new();
        assert!(manager.load_from_file(dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_validation() {
        assert!(ConfigManager::validate(&DaemonConfig::default()).is_ok());

        let mut config = DaemonConfig::default();
        config.watcher.read_buffer_size = 64;
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.logging.level = "loud".to_string();
        assert!(ConfigManager::validate(&config).is_err());

        let mut config = DaemonConfig::default();
        config.metrics.enabled = true;
        config.metrics.port = 0;
        assert!(ConfigManager::validate(&config).is_err());

        // Port is irrelevant while the exporter is off
        config.metrics.enabled = false;
        assert!(ConfigManager::validate(&config).is_ok());
    }
}
