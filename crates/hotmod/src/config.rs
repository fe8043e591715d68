//! Host configuration
//!
//! Load and watch options, deserialized from a config file layered with
//! `HOTMOD__*` environment variables:
//!
//! ```toml
//! [load]
//! shadow_copy = "always"
//!
//! [watch]
//! poll_interval_ms = 250
//! ```
//!
//! `HOTMOD__LOAD__SHADOW_COPY=never` overrides the file.

use std::path::Path;
use std::time::Duration;

use config::{Config as Cfg, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Result type for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// When to load a private temporary copy instead of the module file itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowCopy {
    /// Copy only where the loader locks the file against rewriting (Windows)
    #[default]
    Auto,
    /// Always load a copy
    Always,
    /// Always load the file in place
    Never,
}

impl ShadowCopy {
    /// Resolve against the current platform
    pub fn enabled(self) -> bool {
        match self {
            ShadowCopy::Auto => cfg!(windows),
            ShadowCopy::Always => true,
            ShadowCopy::Never => false,
        }
    }
}

/// Options applied when opening a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    pub shadow_copy: ShadowCopy,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set shadow copy mode
    pub fn with_shadow_copy(mut self, shadow_copy: ShadowCopy) -> Self {
        self.shadow_copy = shadow_copy;
        self
    }
}

/// Options for the directory-watch backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    /// Poll the filesystem at this interval instead of using native notifications
    pub poll_interval_ms: Option<u64>,
}

impl WatchOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the polling backend
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    /// Polling interval, if the polling backend is selected
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_ms.map(Duration::from_millis)
    }
}

/// Complete host configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotmodConfig {
    pub load: LoadOptions,
    pub watch: WatchOptions,
}

impl HotmodConfig {
    /// Load from a file, then apply `HOTMOD__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = detect_format(path)?;
        let content = std::fs::read_to_string(path)?;
        build(Some((&content, format)))
    }

    /// Parse from a string in the given format, then apply environment overrides.
    pub fn from_str_with_format(content: &str, format: FileFormat) -> ConfigResult<Self> {
        build(Some((content, format)))
    }

    /// Defaults with environment overrides only
    pub fn from_env() -> ConfigResult<Self> {
        build(None)
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &Path) -> ConfigResult<FileFormat> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

fn build<T>(source: Option<(&str, FileFormat)>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let mut builder = Cfg::builder();
    if let Some((content, format)) = source {
        builder = builder.add_source(File::from_str(content, format));
    }

    builder
        .add_source(
            Environment::with_prefix("HOTMOD")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|cfg| cfg.try_deserialize())
        .map_err(|e| ConfigError::Parse(e.to_string()))
}
