// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// `RendererSettings` is the compact form the rendering subsystem consumes.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound on frames in flight; more slack only adds latency.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

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
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Vitreous Renderer".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode; FIFO is used when the surface lacks it
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    /// Require a transfer family without graphics support
    pub dedicated_transfer_queue: bool,
    pub fence_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.004, 0.00266, 0.0088, 1.0],
            frames_in_flight: 2,
            dedicated_transfer_queue: false,
            fence_timeout_ms: 2000,
            acquire_timeout_ms: 2000,
            vertex_shader: PathBuf::from("shaders/quad.vert.spv"),
            fragment_shader: PathBuf::from("shaders/quad.frag.spv"),
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_level: String,
    pub show_fps: bool,
    pub print_gpu_info: bool,
    pub hot_reload_shaders: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_level: "info".to_string(),
            show_fps: true,
            print_gpu_info: true,
            hot_reload_shaders: false,
        }
    }
}

/// Everything the device, swapchain and frame modules are parameterized by.
#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub app_name: String,
    pub enable_validation: bool,
    pub frames_in_flight: usize,
    pub dedicated_transfer_queue: bool,
    pub preferred_present_mode: vk::PresentModeKHR,
    pub clear_color: [f32; 4],
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
    pub vertex_shader: PathBuf,
    pub fragment_shader: PathBuf,
    pub print_gpu_info: bool,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Config::default().renderer_settings()
    }
}

impl RendererSettings {
    /// Frame slots to create; the field is public, so it is clamped again here
    pub fn slot_count(&self) -> usize {
        self.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT)
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
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
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

    pub fn log_level(&self) -> log::LevelFilter {
        self.debug.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        let frames_in_flight = self.graphics.frames_in_flight.clamp(1, MAX_FRAMES_IN_FLIGHT);
        if frames_in_flight != self.graphics.frames_in_flight {
            log::warn!(
                "frames_in_flight = {} is out of range, using {}",
                self.graphics.frames_in_flight,
                frames_in_flight
            );
        }

        RendererSettings {
            app_name: self.window.title.clone(),
            // Validation only makes sense in debug builds
            enable_validation: cfg!(debug_assertions) && self.debug.validation_layers,
            frames_in_flight,
            dedicated_transfer_queue: self.graphics.dedicated_transfer_queue,
            preferred_present_mode: self.get_present_mode(),
            clear_color: self.graphics.clear_color,
            fence_timeout: Duration::from_millis(self.graphics.fence_timeout_ms.max(1)),
            acquire_timeout: Duration::from_millis(self.graphics.acquire_timeout_ms.max(1)),
            vertex_shader: self.graphics.vertex_shader.clone(),
            fragment_shader: self.graphics.fragment_shader.clone(),
            print_gpu_info: self.debug.print_gpu_info,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.graphics.frames_in_flight, 2);
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn partial_sections_keep_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "fifo"
            fence_timeout_ms = 250

            [debug]
            log_level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.fence_timeout_ms, 250);
        assert_eq!(config.graphics.acquire_timeout_ms, 2000);
        assert_eq!(config.log_level(), log::LevelFilter::Debug);
        assert_eq!(config.window.title, "Vitreous Renderer");
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let config = Config::parse("[graphics]\npresent_mode = \"warp-speed\"\n").unwrap();
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn settings_clamp_frames_in_flight_and_timeouts() {
        let config = Config::parse(
            "[graphics]\nframes_in_flight = 9\nfence_timeout_ms = 0\n",
        )
        .unwrap();
        let settings = config.renderer_settings();
        assert_eq!(settings.frames_in_flight, MAX_FRAMES_IN_FLIGHT);
        assert_eq!(settings.fence_timeout, Duration::from_millis(1));

        let config = Config::parse("[graphics]\nframes_in_flight = 0\n").unwrap();
        assert_eq!(config.renderer_settings().frames_in_flight, 1);
    }

    #[test]
    fn hand_built_settings_still_get_a_valid_slot_count() {
        let settings = RendererSettings {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert_eq!(settings.slot_count(), 1);

        let settings = RendererSettings {
            frames_in_flight: 64,
            ..Default::default()
        };
        assert_eq!(settings.slot_count(), MAX_FRAMES_IN_FLIGHT);
        assert_eq!(RendererSettings::default().slot_count(), 2);
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config = Config::parse(include_str!("../config.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(config.window.title, defaults.window.title);
        assert_eq!(config.graphics.frames_in_flight, defaults.graphics.frames_in_flight);
        assert_eq!(config.graphics.vertex_shader, defaults.graphics.vertex_shader);
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = ").is_err());
    }
}
