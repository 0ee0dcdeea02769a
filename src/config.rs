// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use std::path::Path;

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;

use crate::backend::queues::DeviceRequirements;
use crate::backend::swapchain::SwapchainPreferences;
use crate::frame::FrameSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "swapframe".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Fence/acquire timeout; absent means wait forever.
    pub fence_timeout_ms: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.1, 0.2, 0.8, 1.0],
            fence_timeout_ms: None,
        }
    }
}

/// Physical device requirements
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DeviceConfig {
    pub extensions: Vec<String>,
    pub sampler_anisotropy: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let defaults = DeviceRequirements::default();
        Self {
            extensions: defaults.extensions,
            sampler_anisotropy: defaults.sampler_anisotropy,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_level: "info".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
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

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    pub fn device_requirements(&self) -> DeviceRequirements {
        DeviceRequirements {
            extensions: self.device.extensions.clone(),
            sampler_anisotropy: self.device.sampler_anisotropy,
            ..Default::default()
        }
    }

    pub fn swapchain_preferences(&self) -> SwapchainPreferences {
        SwapchainPreferences {
            present_mode: self.present_mode(),
            ..Default::default()
        }
    }

    pub fn frame_settings(&self) -> FrameSettings {
        FrameSettings {
            clear_color: self.graphics.clear_color,
            fence_timeout_ns: self
                .graphics
                .fence_timeout_ms
                .map_or(u64::MAX, |ms| ms.saturating_mul(1_000_000)),
            swapchain: self.swapchain_preferences(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.frame_settings().fence_timeout_ns, u64::MAX);
        assert_eq!(
            config.device_requirements().extensions,
            vec!["VK_KHR_swapchain".to_string()]
        );
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            width = 640

            [graphics]
            present_mode = "FIFO"
            fence_timeout_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);

        let settings = config.frame_settings();
        assert_eq!(settings.fence_timeout_ns, 250_000_000);
        assert_eq!(settings.swapchain.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(settings.clear_color, [0.1, 0.2, 0.8, 1.0]);
    }

    #[test]
    fn device_section_maps_to_requirements() {
        let config = Config::parse(
            r#"
            [device]
            extensions = ["VK_KHR_swapchain", "VK_KHR_ray_query"]
            sampler_anisotropy = false
            "#,
        )
        .unwrap();

        let requirements = config.device_requirements();
        assert_eq!(requirements.extensions.len(), 2);
        assert!(!requirements.sampler_anisotropy);
        assert_eq!(requirements.min_api_version, vk::API_VERSION_1_3);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-ish\"").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("does/not/exist/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }
}
