//! Runtime configuration
//!
//! Configuration is TOML, loaded from one or more files. Later files
//! override earlier ones: scalar values replace, nested tables deep-merge.
//! Known sections are deserialized into typed structs; every other section
//! is retained verbatim and handed to plugins by name through
//! [`Config::plugin_section`].

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Effective runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Plugin manager settings.
    pub plugins: PluginsConfig,

    /// Event output sink settings.
    pub output: OutputConfig,

    /// Logging settings.
    pub logging: LoggingConfig,

    /// Exception handling and profiling flags.
    pub debug: DebugConfig,

    /// Raw config sections keyed by plugin name.
    sections: toml::Table,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// The directory to look for third-party plugins.
    pub plugin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Path where to store events. If unset no events will be recorded.
    pub store: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default log level; `RUST_LOG` takes precedence when set.
    pub level: String,
    /// Optional log file. Logs go to stderr when unset.
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    /// Log callback errors with their full error chain.
    pub log_exceptions: bool,
    /// Store callback errors to a file.
    pub store_exceptions: Option<PathBuf>,
    /// Profile the run loop.
    pub profiling: bool,
}

impl Config {
    /// Default config file location under the platform config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("vmlens").join("config.toml"))
    }

    /// Load from the default location, falling back to built-in defaults
    /// when no config file exists.
    pub fn load_default() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&[path]),
            _ => Ok(Self::default()),
        }
    }

    /// Load and merge one or more config files, in order.
    pub fn load(paths: &[impl AsRef<Path>]) -> anyhow::Result<Self> {
        let mut merged = toml::Table::new();
        for path in paths {
            let path = path.as_ref();
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            let table: toml::Table = raw
                .parse()
                .with_context(|| format!("parsing config file {}", path.display()))?;
            merge_tables(&mut merged, table);
        }
        Self::from_table(merged)
    }

    pub fn from_table(table: toml::Table) -> anyhow::Result<Self> {
        let plugins = section(&table, "plugins")?.unwrap_or_default();
        let output = section(&table, "output")?.unwrap_or_default();
        let logging = section(&table, "logging")?.unwrap_or_default();
        let debug = section(&table, "debug")?.unwrap_or_default();
        Ok(Self {
            plugins,
            output,
            logging,
            debug,
            sections: table,
        })
    }

    /// Deserialize the raw section named after a plugin, if present.
    pub fn plugin_section<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        section(&self.sections, name)
    }
}

fn section<T: DeserializeOwned>(table: &toml::Table, name: &str) -> anyhow::Result<Option<T>> {
    match table.get(name) {
        Some(value) => {
            let parsed = value
                .clone()
                .try_into()
                .with_context(|| format!("parsing config section [{name}]"))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

/// Merge `overlay` into `base`: tables merge recursively, every other
/// value replaces.
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, overlay_value) in overlay {
        match (base.remove(&key), overlay_value) {
            (Some(toml::Value::Table(mut base_table)), toml::Value::Table(overlay_table)) => {
                merge_tables(&mut base_table, overlay_table);
                base.insert(key, toml::Value::Table(base_table));
            }
            (_, overlay_value) => {
                base.insert(key, overlay_value);
            }
        }
    }
}
