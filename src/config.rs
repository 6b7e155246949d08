//! Configuration file handling for cleanview.
//!
//! Loads configuration from `~/.config/cleanview/config.toml` or a custom
//! path. Every setting is optional; precedence is CLI > config file >
//! built-in defaults, resolved by the caller.

use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Configuration file structure for cleanview.
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApiConfig {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub poll_interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct GenerationConfig {
    /// Extra instruction text appended to the built-in cleaning prompt.
    pub prompt: Option<String>,
    pub aspect_ratio: Option<String>,
    pub resolution: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct OutputConfig {
    pub filename: Option<String>,
}

impl Config {
    /// Load configuration from the default path.
    /// Returns default config if the file doesn't exist.
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load configuration from an explicitly given path.
    /// Unlike `load`, the file must exist.
    pub fn load_from_explicit(path: PathBuf) -> Result<Self, ConfigError> {
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::IoError {
            path: path.to_path_buf(),
            source: e,
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        Ok(config)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug)]
pub enum ConfigError {
    IoError {
        path: PathBuf,
        source: std::io::Error,
    },
    ParseError {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError { path, source } => {
                write!(
                    f,
                    "Failed to read config file '{}': {}",
                    path.display(),
                    source
                )
            }
            ConfigError::ParseError { path, source } => {
                write!(
                    f,
                    "Failed to parse config file '{}': {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::IoError { source, .. } => Some(source),
            ConfigError::ParseError { source, .. } => Some(source),
        }
    }
}

/// Get the default config file path.
pub fn default_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("cleanview")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.api.model.is_none());
        assert!(config.generation.aspect_ratio.is_none());
        assert!(config.output.filename.is_none());
    }

    #[test]
    fn test_full_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [api]
            model = "veo-3.1-fast-generate-preview"
            base_url = "https://example.com/v1beta"
            poll_interval_secs = 4
            timeout_secs = 300

            [generation]
            prompt = "Keep the channel logo."
            aspect_ratio = "9:16"
            resolution = "1080p"

            [output]
            filename = "cleaned.mp4"
            "#,
        )
        .unwrap();

        assert_eq!(config.api.poll_interval_secs, Some(4));
        assert_eq!(config.api.timeout_secs, Some(300));
        assert_eq!(config.generation.aspect_ratio.as_deref(), Some("9:16"));
        assert_eq!(config.generation.resolution.as_deref(), Some("1080p"));
        assert_eq!(config.output.filename.as_deref(), Some("cleaned.mp4"));
    }

    #[test]
    fn test_partial_config_parses() {
        let config: Config = toml::from_str(
            r#"
            [generation]
            resolution = "720p"
            "#,
        )
        .unwrap();
        assert_eq!(config.generation.resolution.as_deref(), Some("720p"));
        assert!(config.api.model.is_none());
    }

    #[test]
    fn test_invalid_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "this is not toml [").unwrap();

        let result = Config::load_from_explicit(path);
        assert!(matches!(result, Err(ConfigError::ParseError { .. })));
    }

    #[test]
    fn test_explicit_missing_file_is_io_error() {
        let result = Config::load_from_explicit(PathBuf::from("/nonexistent/cleanview.toml"));
        assert!(matches!(result, Err(ConfigError::IoError { .. })));
    }

    #[test]
    fn test_default_path_ends_with_config_toml() {
        let path = default_path();
        assert!(path.ends_with("cleanview/config.toml"));
    }
}
