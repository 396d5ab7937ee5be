//! Application configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Global nvcap configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NvcapConfig {
    /// Display to open. `None` selects the primary display.
    pub display: Option<String>,

    /// Session parameters used until the first capture overrides them.
    pub session: SessionDefaults,

    /// Raw elementary-stream dump.
    pub dump: DumpConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

/// Default session parameters applied when a context is opened.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionDefaults {
    /// Target frame rate numerator.
    pub fps_n: u32,

    /// Target frame rate denominator.
    pub fps_d: u32,

    /// Average and peak bitrate in bits per second.
    pub bitrate: u32,

    /// GOP length used before the first build derives one from the frame rate.
    pub gop_length: u32,

    /// Whether the pointer was requested. The capture session never
    /// overlays it; the flag only takes part in change detection.
    pub show_pointer: bool,
}

/// Optional sink that appends every encoded access unit to a file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DumpConfig {
    pub path: Option<PathBuf>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "nvcap_capture_engine=trace,warn").
    pub level: String,

    /// Whether to output structured JSON logs.
    pub json: bool,
}

impl Default for SessionDefaults {
    fn default() -> Self {
        Self {
            fps_n: 30,
            fps_d: 1,
            bitrate: 2_000_000,
            gop_length: 10,
            show_pointer: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl NvcapConfig {
    /// Load config from the standard location, falling back to defaults.
    pub fn load() -> Self {
        let config_path = config_file_path();
        if config_path.exists() {
            match std::fs::read_to_string(&config_path) {
                Ok(content) => match serde_json::from_str(&content) {
                    Ok(config) => return config,
                    Err(e) => {
                        tracing::warn!("Failed to parse config at {:?}: {}", config_path, e);
                    }
                },
                Err(e) => {
                    tracing::warn!("Failed to read config at {:?}: {}", config_path, e);
                }
            }
        }
        Self::default()
    }

    /// Save config to the standard location.
    pub fn save(&self) -> Result<PathBuf, std::io::Error> {
        let config_path = config_file_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        std::fs::write(&config_path, json)?;
        Ok(config_path)
    }
}

/// Standard config file location.
pub fn config_file_path() -> PathBuf {
    let base = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        });
    base.join("nvcap").join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_open_time_session() {
        let defaults = SessionDefaults::default();
        assert_eq!((defaults.fps_n, defaults.fps_d), (30, 1));
        assert_eq!(defaults.bitrate, 2_000_000);
        assert_eq!(defaults.gop_length, 10);
        assert!(!defaults.show_pointer);
    }

    #[test]
    fn partial_json_fills_missing_fields() {
        let config: NvcapConfig =
            serde_json::from_str(r#"{ "session": { "bitrate": 8000000 } }"#).unwrap();
        assert_eq!(config.session.bitrate, 8_000_000);
        assert_eq!(config.session.fps_n, 30);
        assert_eq!(config.logging.level, "info");
        assert!(config.dump.path.is_none());
    }
}
