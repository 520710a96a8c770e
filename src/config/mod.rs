mod document;

pub use document::{ConfigDocument, ConfigError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Default location of the server configuration file.
pub const DEFAULT_CONFIG_FILE: &str = "server.yml";

/// Name of the plugin registry document inside the config directory.
pub const PLUGIN_REGISTRY_FILE: &str = "plugin.yml";

/// Server configuration, read from `server.yml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ServerConfig {
    #[serde(default = "default_version")]
    pub version: String,

    /// One of `debug`, `info`, `warn`, `error`
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log file; rolled daily next to this path
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,

    /// Parent of every plugin's private folder
    #[serde(default = "default_plugin_resource_path")]
    pub plugin_resource_path: PathBuf,

    /// Directory scanned for plugin modules
    #[serde(default = "default_plugin_path")]
    pub plugin_path: PathBuf,

    /// Plugin registry and per-plugin documents
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    #[serde(default)]
    pub debug_mode: bool,
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_path() -> PathBuf {
    PathBuf::from("./logs/oasis.log")
}

fn default_plugin_resource_path() -> PathBuf {
    PathBuf::from("./resources")
}

fn default_plugin_path() -> PathBuf {
    PathBuf::from("./plugins")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("./configs")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            log_path: default_log_path(),
            plugin_resource_path: default_plugin_resource_path(),
            plugin_path: default_plugin_path(),
            config_path: default_config_path(),
            debug_mode: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from a specific file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file {}", path.as_ref().display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Load `path`, writing the defaults there first when it does not exist.
    ///
    /// Never fails: unreadable files are logged and the defaults are used.
    /// An older `Version` is raised to the running one and written back.
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            let config = Self::default();
            if let Err(e) = config.save_to_file(path) {
                warn!("{e:#}");
            }
            return config;
        }

        match Self::load_from_file(path) {
            Ok(mut config) => {
                let current = default_version();
                if config.version < current {
                    config.version = current;
                    if let Err(e) = config.save_to_file(path) {
                        warn!("{e:#}");
                    }
                }
                config
            }
            Err(e) => {
                warn!("{e:#}, using defaults");
                Self::default()
            }
        }
    }

    /// Create every directory the host writes into.
    pub fn ensure_directories(&self) -> Result<()> {
        let mut dirs = vec![
            self.plugin_path.as_path(),
            self.plugin_resource_path.as_path(),
            self.config_path.as_path(),
        ];
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            dirs.push(parent);
        }

        for dir in dirs {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn plugin_registry_path(&self) -> PathBuf {
        self.config_path.join(PLUGIN_REGISTRY_FILE)
    }

    #[must_use]
    pub fn plugin_config_path(&self, plugin: &str) -> PathBuf {
        self.config_path.join(format!("{plugin}.yml"))
    }

    #[must_use]
    pub fn plugin_folder(&self, plugin: &str) -> PathBuf {
        self.plugin_resource_path.join(plugin)
    }

    /// Level the logging filter starts from.
    #[must_use]
    pub fn effective_log_level(&self) -> &str {
        if self.debug_mode {
            "debug"
        } else {
            match self.log_level.to_ascii_lowercase().as_str() {
                "debug" => "debug",
                "warn" | "warning" => "warn",
                "error" => "error",
                _ => "info",
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_file_uses_field_defaults() {
        let yaml = "LogLevel: warn\nPluginPath: ./mods\n";
        let config: ServerConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.log_level, "warn");
        assert_eq!(config.plugin_path, PathBuf::from("./mods"));
        assert_eq!(config.config_path, PathBuf::from("./configs"));
        assert!(!config.debug_mode);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);

        let config = ServerConfig::load_or_create(&path);
        assert_eq!(config, ServerConfig::default());

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("PluginResourcePath"));
        assert_eq!(ServerConfig::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_broken_file_falls_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "LogLevel: [").unwrap();

        assert_eq!(ServerConfig::load_or_create(&path), ServerConfig::default());
    }

    #[test]
    fn test_old_version_is_raised() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(DEFAULT_CONFIG_FILE);
        fs::write(&path, "Version: '0.0.1'\nLogLevel: error\n").unwrap();

        let config = ServerConfig::load_or_create(&path);
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
        assert_eq!(config.log_level, "error");
        assert!(fs::read_to_string(&path)
            .unwrap()
            .contains(env!("CARGO_PKG_VERSION")));
    }

    #[test]
    fn test_effective_log_level() {
        let mut config = ServerConfig {
            log_level: "WARNING".to_string(),
            ..ServerConfig::default()
        };
        assert_eq!(config.effective_log_level(), "warn");

        config.log_level = "verbose".to_string();
        assert_eq!(config.effective_log_level(), "info");

        config.debug_mode = true;
        assert_eq!(config.effective_log_level(), "debug");
    }

    #[test]
    fn test_paths_and_directories() {
        let dir = tempdir().unwrap();
        let config = ServerConfig {
            log_path: dir.path().join("logs").join("oasis.log"),
            plugin_resource_path: dir.path().join("resources"),
            plugin_path: dir.path().join("plugins"),
            config_path: dir.path().join("configs"),
            ..ServerConfig::default()
        };

        config.ensure_directories().unwrap();
        assert!(dir.path().join("logs").is_dir());
        assert!(dir.path().join("plugins").is_dir());
        assert_eq!(
            config.plugin_config_path("greeter"),
            dir.path().join("configs").join("greeter.yml")
        );
        assert_eq!(
            config.plugin_registry_path(),
            dir.path().join("configs").join(PLUGIN_REGISTRY_FILE)
        );
        assert_eq!(
            config.plugin_folder("greeter"),
            dir.path().join("resources").join("greeter")
        );
    }
}
