//! Configuration Module - Engine defaults from config.toml
//!
//! Supports:
//! - Carve output, size floor, image decoding and per-format size bounds
//! - Recovery strategies, dedup window, walk depth and trash patterns
//! - String extraction run length and preview size
//! - ETA refresh interval (humantime string, e.g. "2s")
//!
//! Command-line flags override anything set here.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::carve::{self, CarveOptions};
use crate::core::Strategy;
use crate::dedup::DEFAULT_QUICK_WINDOW;
use crate::recover::strategies::{DEFAULT_MAX_DEPTH, DEFAULT_RECYCLE_PATTERNS};
use crate::recover::{self, RecoveryOptions};
use crate::strings::{self, StringsOptions};

/// carvex configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,
    pub carve: CarveConfig,
    pub recovery: RecoveryConfig,
    pub strings: StringsConfig,
    pub progress: ProgressConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Debug-level logging
    pub verbose: bool,
    /// JSON log lines instead of the compact format
    pub log_json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CarveConfig {
    /// Emptied at the start of every carve
    pub output_dir: PathBuf,
    pub min_size: u64,
    /// Fully decode JPEG/PNG/GIF candidates before accepting them
    pub decode_images: bool,
    /// Formats carved when none are named on the command line (empty = all)
    pub default_formats: Vec<String>,
    /// Per-format size bound replacing the built-in one
    pub max_size_override: HashMap<String, u64>,
}

impl Default for CarveConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("carved"),
            min_size: carve::DEFAULT_MIN_SIZE,
            decode_images: false,
            default_formats: Vec::new(),
            max_size_override: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Emptied at the start of every recovery
    pub output_dir: PathBuf,
    pub min_size: u64,
    /// Bytes read from each end of a candidate for the quick dedup key
    pub quick_window: usize,
    pub max_depth: usize,
    /// Trash directory patterns, case-insensitive regex
    pub recycle_patterns: Vec<String>,
    pub strategies: Vec<Strategy>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("recovered"),
            min_size: recover::DEFAULT_MIN_SIZE,
            quick_window: DEFAULT_QUICK_WINDOW,
            max_depth: DEFAULT_MAX_DEPTH,
            recycle_patterns: DEFAULT_RECYCLE_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
            strategies: Strategy::ALL.to_vec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StringsConfig {
    /// Shortest printable run reported
    pub min_len: usize,
    /// Strings kept for the preview (all are counted)
    pub preview_limit: usize,
}

impl Default for StringsConfig {
    fn default() -> Self {
        Self {
            min_len: strings::DEFAULT_MIN_LEN,
            preview_limit: strings::DEFAULT_PREVIEW_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum interval between ETA recomputations
    pub eta_refresh: String,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            eta_refresh: "2s".to_string(),
        }
    }
}

impl ProgressConfig {
    pub fn eta_refresh(&self) -> Result<Duration> {
        humantime::parse_duration(&self.eta_refresh)
            .with_context(|| format!("Invalid eta_refresh: {:?}", self.eta_refresh))
    }
}

impl Config {
    /// Load config from default path or return defaults
    pub fn load() -> Self {
        let path = Self::default_path();
        if !path.exists() {
            return Self::default();
        }
        match Self::load_from(&path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Ignoring unreadable config");
                Self::default()
            }
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;

        Ok(config)
    }

    /// Save config to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("org", "carvex", "carvex")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".carvex")
                    .join("config.toml")
            })
    }

    pub fn carve_options(&self) -> Result<CarveOptions> {
        Ok(CarveOptions {
            output_dir: self.carve.output_dir.clone(),
            min_size: self.carve.min_size,
            decode_images: self.carve.decode_images,
            eta_refresh: self.progress.eta_refresh()?,
            quick_window: self.recovery.quick_window,
            max_size_override: self.carve.max_size_override.clone(),
        })
    }

    pub fn recovery_options(&self) -> Result<RecoveryOptions> {
        Ok(RecoveryOptions {
            output_dir: self.recovery.output_dir.clone(),
            min_size: self.recovery.min_size,
            quick_window: self.recovery.quick_window,
            max_depth: self.recovery.max_depth,
            recycle_patterns: self.recovery.recycle_patterns.clone(),
            strategies: self.recovery.strategies.clone(),
            eta_refresh: self.progress.eta_refresh()?,
        })
    }

    pub fn strings_options(&self) -> Result<StringsOptions> {
        Ok(StringsOptions {
            min_len: self.strings.min_len,
            preview_limit: self.strings.preview_limit,
            eta_refresh: self.progress.eta_refresh()?,
        })
    }
}

/// Generate a sample config file with comments
pub fn generate_sample_config() -> String {
    r#"# carvex configuration
# Location: ~/.config/carvex/config.toml (or %APPDATA%\carvex\config\config.toml on Windows)

[general]
# Debug-level logging
verbose = false

# Emit log lines as JSON
log_json = false

[carve]
# WARNING: emptied at the start of every carve
output_dir = "carved"

# Global minimum file size in bytes (per-format floors also apply)
min_size = 128

# Decode JPEG/PNG/GIF candidates before accepting them (slower, fewer false positives)
decode_images = false

# Formats to carve when none are given on the command line (empty = all)
# Example: ["JPEG", "PNG", "PDF"]
default_formats = []

# Replace a format's built-in maximum size (bytes)
[carve.max_size_override]
# MP4 = 8589934592

[recovery]
# WARNING: emptied at the start of every recovery
output_dir = "recovered"

# Candidates at or below this many bytes are rejected
min_size = 128

# Bytes read from each end of a candidate for the quick duplicate check
quick_window = 4096

# Directory depth limit
max_depth = 64

# Trash directory names (regex, case-insensitive, whole path component)
recycle_patterns = ['\$RECYCLE\.BIN', 'RECYCLER', 'RECYCLED', '\.Trash(-\d+)?', '\.Trashes', 'Trash']

# Strategies to run, in order
strategies = ["directory_walk", "inode_scan", "file_slack", "recycle_bin"]

[strings]
# Shortest printable ASCII run reported
min_len = 4

# Strings kept in the preview; every string is still counted
preview_limit = 200

[progress]
# Minimum interval between ETA updates
eta_refresh = "2s"
"#
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.carve.min_size, 128);
        assert_eq!(config.recovery.quick_window, 4096);
        assert_eq!(config.recovery.strategies.len(), 4);
        assert_eq!(config.strings_options().unwrap().min_len, 4);
        assert_eq!(
            config.progress.eta_refresh().unwrap(),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.carve.max_size_override.insert("JPEG".into(), 1 << 20);
        config.recovery.strategies = vec![Strategy::InodeScan];
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_parse_sample_config() {
        let sample = generate_sample_config();
        let config: Config = toml::from_str(&sample).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [recovery]
            strategies = ["file_slack"]

            [progress]
            eta_refresh = "500ms"
            "#,
        )
        .unwrap();
        assert_eq!(config.recovery.strategies, vec![Strategy::FileSlack]);
        assert_eq!(config.recovery.max_depth, 64);

        let options = config.recovery_options().unwrap();
        assert_eq!(options.eta_refresh, Duration::from_millis(500));
        assert_eq!(options.output_dir, PathBuf::from("recovered"));
    }

    #[test]
    fn test_bad_duration_is_an_error() {
        let mut config = Config::default();
        config.progress.eta_refresh = "soon".into();
        assert!(config.carve_options().is_err());
    }
}
