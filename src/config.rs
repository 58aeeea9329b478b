// =============================================================================
// CONFIGURATION - Load settings from etna.toml
// =============================================================================
//
// Every section is optional; missing keys take their defaults. A missing
// file is not an error.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

use crate::backend::sync::{clamp_frames_in_flight, DEFAULT_FRAMES_IN_FLIGHT};

pub const DEFAULT_CONFIG_PATH: &str = "etna.toml";

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Also used as the Vulkan application name.
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "etna".to_string(),
            width: 800,
            height: 600,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub frames_in_flight: usize,
    /// Tried before the built-in mailbox / fifo-relaxed / fifo order.
    pub present_mode: Option<String>,
    pub clear_color: [f32; 4],
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            present_mode: None,
            clear_color: [0.1, 0.2, 0.3, 1.0],
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Default `env_logger` filter; `RUST_LOG` wins when set.
    pub log_level: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path(DEFAULT_CONFIG_PATH).unwrap_or_else(|e| {
            log::warn!("Failed to load {}: {:#}. Using defaults.", DEFAULT_CONFIG_PATH, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Frames in flight, clamped to what the synchronizer supports.
    pub fn frames_in_flight(&self) -> usize {
        let requested = self.graphics.frames_in_flight;
        let clamped = clamp_frames_in_flight(requested);
        if clamped != requested {
            log::warn!(
                "frames_in_flight = {} out of range, using {}",
                requested,
                clamped
            );
        }
        clamped
    }

    /// Configured present mode override, if any and if recognised.
    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        let name = self.graphics.present_mode.as_deref()?;
        let mode = parse_present_mode(name);
        if mode.is_none() {
            log::warn!("Unknown present mode '{}', using the default order", name);
        }
        mode
    }
}

pub fn parse_present_mode(name: &str) -> Option<vk::PresentModeKHR> {
    match name.to_lowercase().as_str() {
        "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
        "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
        "fifo" => Some(vk::PresentModeKHR::FIFO),
        "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MAX_FRAMES_IN_FLIGHT;
    use rstest::rstest;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::from_toml_str("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.frames_in_flight(), DEFAULT_FRAMES_IN_FLIGHT);
        assert_eq!(config.present_mode(), None);
        assert_eq!(config.debug.log_level, "info");
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::from_toml_str(
            r#"
            [window]
            title = "skinning"

            [graphics]
            present_mode = "FIFO"
            "#,
        )
        .unwrap();
        assert_eq!(config.window.title, "skinning");
        assert_eq!(config.window.width, 800);
        assert_eq!(config.present_mode(), Some(vk::PresentModeKHR::FIFO));
        assert_eq!(config.graphics.clear_color, [0.1, 0.2, 0.3, 1.0]);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(3, 3)]
    #[case(64, MAX_FRAMES_IN_FLIGHT)]
    fn frames_in_flight_is_clamped(#[case] requested: usize, #[case] expected: usize) {
        let config =
            Config::from_toml_str(&format!("[graphics]\nframes_in_flight = {}", requested))
                .unwrap();
        assert_eq!(config.frames_in_flight(), expected);
    }

    #[rstest]
    #[case("mailbox", Some(vk::PresentModeKHR::MAILBOX))]
    #[case("Fifo_Relaxed", Some(vk::PresentModeKHR::FIFO_RELAXED))]
    #[case("immediate", Some(vk::PresentModeKHR::IMMEDIATE))]
    #[case("vsync", None)]
    fn present_mode_names(#[case] name: &str, #[case] expected: Option<vk::PresentModeKHR>) {
        assert_eq!(parse_present_mode(name), expected);
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(Config::from_toml_str("[graphics\nframes_in_flight = ").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("definitely/not/here/etna.toml").unwrap();
        assert_eq!(config.window.title, "etna");
    }
}
