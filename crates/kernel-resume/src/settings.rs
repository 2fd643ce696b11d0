//! Settings persistence.
//!
//! Settings are stored in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/kernel-resume/settings.json
//! - Linux: ~/.config/kernel-resume/settings.json
//! - Windows: C:\Users\<User>\AppData\Roaming\kernel-resume\settings.json

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment override that forces the direct transport off (used by test
/// runs that must exercise the server-backed path).
pub const NON_RAW_NATIVE_TEST_ENV: &str = "KERNEL_RESUME_NON_RAW_NATIVE_TEST";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Never use the direct in-process transport for local kernels
    #[serde(default)]
    pub disable_raw_transport: bool,

    /// Where execution records are kept (defaults to the data directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memento_path: Option<PathBuf>,
}

impl Settings {
    /// The memento file to use: the configured one, or the default location.
    pub fn memento_path(&self) -> PathBuf {
        self.memento_path.clone().unwrap_or_else(default_memento_path)
    }
}

/// Get the path to the settings file
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-resume")
        .join("settings.json")
}

pub fn default_memento_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("kernel-resume")
        .join("memento.json")
}

/// Load settings from disk, returning defaults if the file doesn't exist
pub fn load_settings() -> Settings {
    load_settings_from(&settings_path())
}

/// Load settings from `path`; a missing or invalid file yields defaults.
pub fn load_settings_from(path: &Path) -> Settings {
    if path.exists() {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default()
    } else {
        Settings::default()
    }
}

/// Save settings to `path`
pub fn save_settings_to(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(settings)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert!(!settings.disable_raw_transport);
        assert!(settings.memento_path.is_none());
        assert!(settings.memento_path().ends_with("kernel-resume/memento.json"));
    }

    #[test]
    fn test_deserialize_missing_fields() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());

        let settings: Settings =
            serde_json::from_str(r#"{"disable_raw_transport": true}"#).unwrap();
        assert!(settings.disable_raw_transport);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let settings = Settings {
            disable_raw_transport: true,
            memento_path: Some(dir.path().join("records.json")),
        };

        save_settings_to(&path, &settings).unwrap();
        let loaded = load_settings_from(&path);
        assert_eq!(loaded, settings);
        assert_eq!(loaded.memento_path(), dir.path().join("records.json"));
    }

    #[test]
    fn test_invalid_file_yields_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();

        assert_eq!(load_settings_from(&path), Settings::default());
        assert_eq!(
            load_settings_from(&dir.path().join("missing.json")),
            Settings::default()
        );
    }

    #[test]
    fn test_settings_path_is_valid() {
        let path = settings_path();
        assert!(path.ends_with("kernel-resume/settings.json"));
    }
}
