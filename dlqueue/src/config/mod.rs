//! Application configuration.
//!
//! Loaded from a TOML file. Every section is optional and falls back to
//! defaults, so an empty file is a valid configuration.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::control::ControlConfig;
use crate::downloader::DownloadManagerConfig;
use crate::downloader::backend::BackendsConfig;
use crate::logging::LoggingSettings;
use crate::postprocess::PostProcessConfig;
use crate::process::SupervisorConfig;
use crate::utils::fs::io_error;
use crate::{Error, Result};

const APP_DIR: &str = "dlqueue";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Where the queue and id counter are stored. Defaults to the platform
    /// data directory.
    pub data_dir: Option<PathBuf>,
    pub queue: DownloadManagerConfig,
    pub supervisor: SupervisorConfig,
    pub control: ControlConfig,
    pub backends: BackendsConfig,
    pub postprocess: PostProcessConfig,
    pub logging: LoggingSettings,
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist. A missing file at the default location
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No configuration file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(io_error("reading configuration", &path, e)),
        };

        let config = Self::from_toml(&text)
            .map_err(|e| Error::config(format!("{}: {e}", path.display())))?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.queue.categories.is_empty() {
            return Err(Error::config("queue.categories must not be empty"));
        }
        if self.supervisor.poll_interval_ms == 0 {
            return Err(Error::config("supervisor.poll_interval_ms must be positive"));
        }
        if self.control.timeout_ms == 0 {
            return Err(Error::config("control.timeout_ms must be positive"));
        }
        if self.backends.order.is_empty() {
            return Err(Error::config("backends.order must name at least one backend"));
        }
        if self.logging.retention_days < 1 {
            return Err(Error::config("logging.retention_days must be at least 1"));
        }
        Ok(())
    }

    /// Data directory, falling back to the platform default.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(default_data_dir)
    }

    /// Log directory, falling back to `logs` under the data directory.
    pub fn log_dir(&self) -> PathBuf {
        self.logging
            .dir
            .clone()
            .unwrap_or_else(|| self.data_dir().join("logs"))
    }
}

/// `<config dir>/dlqueue/config.toml`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR).join(CONFIG_FILE))
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".dlqueue"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::SortOrder;
    use crate::downloader::backend::{BackendKind, Category};
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_default() {
        let config = AppConfig::from_toml("").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_parse_sections() {
        let text = r#"
            data_dir = "/var/lib/dlqueue"

            [queue]
            max_concurrent_downloads = 4
            max_download_retries = 5
            categories = ["audio", "thumbnails"]
            sort_order = "title-asc"
            remove_on_success = true

            [supervisor]
            graceful_timeout_ms = 1000

            [control]
            port = 50000

            [backends]
            order = ["yt-dlp", "direct-http"]

            [backends.yt_dlp]
            binary_path = "/opt/yt-dlp"
            extra_args = ["--no-mtime"]
        "#;
        let config = AppConfig::from_toml(text).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/dlqueue"));
        assert_eq!(config.queue.max_concurrent_downloads, 4);
        assert_eq!(config.queue.max_download_retries, 5);
        assert_eq!(
            config.queue.categories,
            vec![Category::Audio, Category::Thumbnails]
        );
        assert_eq!(config.queue.sort_order, SortOrder::TitleAsc);
        assert!(config.queue.remove_on_success);
        assert_eq!(config.supervisor.graceful_timeout_ms, 1000);
        assert_eq!(config.supervisor.poll_interval_ms, 250);
        assert_eq!(config.control.port, 50000);
        assert_eq!(
            config.backends.order,
            vec![BackendKind::YtDlp, BackendKind::DirectHttp]
        );
        assert_eq!(config.backends.yt_dlp.binary_path, "/opt/yt-dlp");
        assert_eq!(config.log_dir(), PathBuf::from("/var/lib/dlqueue/logs"));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(AppConfig::from_toml("[queue]\nmax_concurrent_downloads = 0").is_err());
        assert!(AppConfig::from_toml("[queue]\ncategories = []").is_err());
        assert!(AppConfig::from_toml("[queue]\nsort_order = \"sideways\"").is_err());
        assert!(AppConfig::from_toml("queue = 3").is_err());
    }

    #[test]
    fn test_round_trip_through_toml() {
        let mut config = AppConfig::default();
        config.queue.max_concurrent_downloads = 3;
        config.control.port = 40000;
        let text = config.to_toml().unwrap();
        assert_eq!(AppConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.toml");
        assert!(AppConfig::load(Some(&missing)).is_err());

        let path = temp.path().join("config.toml");
        std::fs::write(&path, "[control]\nport = 41000\n").unwrap();
        assert_eq!(AppConfig::load(Some(&path)).unwrap().control.port, 41000);
    }
}
