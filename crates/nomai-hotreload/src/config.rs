//! Hot-reload configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::HotReloadError;

/// Configuration for the hot-reload pipeline.
///
/// Every field has a default, so a JSON config only needs the keys it wants
/// to override:
///
/// ```
/// use nomai_hotreload::HotReloadConfig;
///
/// let config = HotReloadConfig::from_json_str(r#"{ "debounce_ms": 300 }"#).unwrap();
/// assert_eq!(config.debounce_ms, 300);
/// assert_eq!(config.extension, "wat");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Directory holding one `<Name>.<extension>` file per component.
    pub component_dir: PathBuf,

    /// Directory of auxiliary modules linked into every component. Every
    /// matching file except the component being compiled is included.
    pub aux_dir: Option<PathBuf>,

    /// Source file extension, without the dot. Default: `wat`.
    pub extension: String,

    /// Quiet period after the last change notification before recompiling.
    /// Default: 150 ms.
    pub debounce_ms: u64,

    /// Fuel granted to each component hook call. Default: 1,000,000.
    pub fuel_per_call: u64,

    /// Linear memory cap per component instance. Default: 16 MiB.
    pub memory_limit_bytes: usize,

    /// Treat compiler warnings as errors.
    pub warnings_as_errors: bool,

    /// Whether superseded contexts may be released. When `false` they are
    /// retained until shutdown and memory grows with every swap.
    pub unload_supported: bool,
}

impl Default for HotReloadConfig {
    fn default() -> Self {
        Self {
            component_dir: PathBuf::from("components"),
            aux_dir: None,
            extension: "wat".to_owned(),
            debounce_ms: 150,
            fuel_per_call: 1_000_000,
            memory_limit_bytes: 16 * 1024 * 1024, // 16 MiB
            warnings_as_errors: false,
            unload_supported: true,
        }
    }
}

impl HotReloadConfig {
    /// Builder-style override of [`component_dir`](Self::component_dir).
    pub fn with_component_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.component_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Builder-style override of [`aux_dir`](Self::aux_dir).
    pub fn with_aux_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.aux_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The debounce window as a [`Duration`].
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Parse a JSON config and validate it.
    pub fn from_json_str(json: &str) -> Result<Self, HotReloadError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| HotReloadError::Config(format!("malformed JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HotReloadError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| HotReloadError::Source {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), HotReloadError> {
        if self.extension.is_empty() || self.extension.starts_with('.') {
            return Err(HotReloadError::Config(format!(
                "extension must be non-empty and given without a leading dot, got {:?}",
                self.extension
            )));
        }
        if self.fuel_per_call == 0 {
            return Err(HotReloadError::Config(
                "fuel_per_call must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = HotReloadConfig::default();
        assert_eq!(config.debounce(), Duration::from_millis(150));
        assert_eq!(config.memory_limit_bytes, 16 * 1024 * 1024);
        assert!(config.unload_supported);
        assert!(config.aux_dir.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config = HotReloadConfig::from_json_str(
            r#"{ "component_dir": "scripts", "aux_dir": "scripts/shared", "warnings_as_errors": true }"#,
        )
        .unwrap();
        assert_eq!(config.component_dir, PathBuf::from("scripts"));
        assert_eq!(config.aux_dir, Some(PathBuf::from("scripts/shared")));
        assert!(config.warnings_as_errors);
        assert_eq!(config.fuel_per_call, 1_000_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = HotReloadConfig::from_json_str(r#"{ "extension": ".wat" }"#).unwrap_err();
        assert!(matches!(err, HotReloadError::Config(_)), "got {err:?}");

        let err = HotReloadConfig::from_json_str(r#"{ "fuel_per_call": 0 }"#).unwrap_err();
        assert!(matches!(err, HotReloadError::Config(_)), "got {err:?}");

        let err = HotReloadConfig::from_json_str("{ not json").unwrap_err();
        assert!(err.to_string().contains("malformed JSON"));
    }
}
