//! Configuration loader - YAML overlay settings + .env environment

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::normalize::Scale;
use crate::scene::DEFAULT_BASE_COLOR;
use crate::spots::DEFAULT_SPOT_BORDER;

/// Overlay settings loaded from overlay.yaml. Every field is optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub color_map: String,
    pub scale: Scale,
    pub hotspot_quantile: f64,
    pub auto_min_max: bool,
    /// Only used with auto_min_max off
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub spot_border: f32,
    pub global_spot_opacity: f32,
    pub global_spot_scale: f32,
    pub data_dependent_opacity: bool,
    pub base_color: [f32; 3],
    /// Measure to select by name
    pub measure: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            color_map: "VIRIDIS".to_string(),
            scale: Scale::Linear,
            hotspot_quantile: 1.0,
            auto_min_max: true,
            min_value: None,
            max_value: None,
            spot_border: DEFAULT_SPOT_BORDER,
            global_spot_opacity: 1.0,
            global_spot_scale: 1.0,
            data_dependent_opacity: false,
            base_color: DEFAULT_BASE_COLOR,
            measure: None,
        }
    }
}

impl Settings {
    pub fn from_yaml(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings = serde_yaml::from_str(content)?;
        Ok(settings)
    }

    /// Load settings from a YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid settings {}", path.display()))
    }
}

/// Environment loaded from .env and the process environment
#[derive(Debug, Clone, PartialEq)]
pub struct Env {
    pub log_dir: PathBuf,
    pub settings_path: PathBuf,
}

impl Env {
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F: Fn(&str) -> Option<String>>(lookup: F) -> Self {
        Env {
            log_dir: lookup("SPOT_OVERLAY_LOG_DIR")
                .unwrap_or_else(|| "logs".to_string())
                .into(),
            settings_path: lookup("SPOT_OVERLAY_SETTINGS")
                .unwrap_or_else(|| "overlay.yaml".to_string())
                .into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let settings = Settings::from_yaml("color_map: JET\nscale: log\nspot_border: 0.2\n").unwrap();
        assert_eq!(settings.color_map, "JET");
        assert_eq!(settings.scale, Scale::Log);
        assert_eq!(settings.spot_border, 0.2);
        assert_eq!(settings.hotspot_quantile, 1.0);
        assert!(settings.auto_min_max);
        assert_eq!(settings.base_color, DEFAULT_BASE_COLOR);
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(Settings::from_yaml("").unwrap(), Settings::default());
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(Settings::from_yaml("scale: cubic\n").is_err());
        assert!(Settings::from_yaml("hotspot_quantile: [1, 2]\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "measure: Gene A\nauto_min_max: false\nmax_value: 12.5").unwrap();

        let settings = Settings::load(file.path()).unwrap();
        assert_eq!(settings.measure.as_deref(), Some("Gene A"));
        assert!(!settings.auto_min_max);
        assert_eq!(settings.max_value, Some(12.5));
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Settings::load(dir.path().join("absent.yaml")).is_err());
    }

    #[test]
    fn test_env_defaults_and_overrides() {
        let env = Env::from_lookup(|_| None);
        assert_eq!(env.log_dir, PathBuf::from("logs"));
        assert_eq!(env.settings_path, PathBuf::from("overlay.yaml"));

        let env = Env::from_lookup(|key| {
            (key == "SPOT_OVERLAY_LOG_DIR").then(|| "/tmp/overlay-logs".to_string())
        });
        assert_eq!(env.log_dir, PathBuf::from("/tmp/overlay-logs"));
        assert_eq!(env.settings_path, PathBuf::from("overlay.yaml"));
    }
}
