//! Startup configuration, persisted as a single TOML document.
//!
//! Saves are atomic: the document is written to a sibling temp file and
//! renamed over the old one, so a crash mid-save never corrupts it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub team_number: u16,
    pub use_usb: bool,
    pub dashboard_command: Option<String>,
    pub game_data: String,
    pub practice_timing: PracticeTiming,
    pub practice_audio: bool,
    /// Device UUID -> reserved slot.
    pub joystick_locks: HashMap<String, u8>,
    pub window: WindowConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PracticeTiming {
    pub countdown_secs: u32,
    pub auto_secs: u32,
    pub delay_secs: u32,
    pub teleop_secs: u32,
}

/// Window geometry, stored for the UI shell; the engine never reads it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub x: Option<i32>,
    pub y: Option<i32>,
    pub width: u32,
    pub height: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            team_number: 0,
            use_usb: false,
            dashboard_command: None,
            game_data: String::new(),
            practice_timing: PracticeTiming::default(),
            practice_audio: true,
            joystick_locks: HashMap::new(),
            window: WindowConfig::default(),
        }
    }
}

impl Default for PracticeTiming {
    fn default() -> Self {
        Self {
            countdown_secs: 3,
            auto_secs: 15,
            delay_secs: 1,
            teleop_secs: 135,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            x: None,
            y: None,
            width: 1000,
            height: 400,
        }
    }
}

impl Config {
    pub fn config_dir() -> PathBuf {
        let mut dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        dir.push("open-station");
        dir
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    pub fn load() -> Self {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    debug!("Loaded configuration from {}", path.display());
                    config
                }
                Err(e) => {
                    warn!("Malformed configuration at {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                debug!("No configuration at {}, using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self) -> io::Result<()> {
        self.save_to(&Self::config_path())
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self).map_err(io::Error::other)?;

        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.team_number, 0);
        assert!(!config.use_usb);
        assert!(config.practice_audio);
        assert_eq!(config.practice_timing.countdown_secs, 3);
        assert_eq!(config.practice_timing.auto_secs, 15);
        assert_eq!(config.practice_timing.delay_secs, 1);
        assert_eq!(config.practice_timing.teleop_secs, 135);
        assert_eq!(config.window.width, 1000);
    }

    #[test]
    fn round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config {
            team_number: 1234,
            use_usb: true,
            game_data: "LRL".to_string(),
            ..Default::default()
        };
        config.joystick_locks.insert("uuid-123".to_string(), 3);

        config.save_to(&path).unwrap();
        let loaded = Config::load_from(&path);

        assert_eq!(loaded.team_number, 1234);
        assert!(loaded.use_usb);
        assert_eq!(loaded.game_data, "LRL");
        assert_eq!(loaded.joystick_locks.get("uuid-123"), Some(&3));
    }

    #[test]
    fn save_replaces_without_leaving_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        Config::default().save_to(&path).unwrap();
        Config {
            team_number: 9,
            ..Default::default()
        }
        .save_to(&path)
        .unwrap();

        assert_eq!(Config::load_from(&path).team_number, 9);
        assert!(!path.with_extension("toml.tmp").exists());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = Config::load_from(Path::new("/nonexistent/open-station/config.toml"));
        assert_eq!(config.team_number, 0);
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "not toml {{{{").unwrap();
        assert_eq!(Config::load_from(&path).team_number, 0);
    }

    #[test]
    fn partial_document_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "team_number = 254\n").unwrap();
        let config = Config::load_from(&path);
        assert_eq!(config.team_number, 254);
        assert_eq!(config.practice_timing.teleop_secs, 135);
    }
}
