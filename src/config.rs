// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::device::DeviceSettings;
use crate::renderer::RendererSettings;
use crate::swapchain::SwapchainSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub controls: ControlsConfig,
}

/// Window settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
    pub resizable: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "hf-gpu".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
            resizable: true,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    pub vsync: bool,
    /// Swapchain images to request; surface minimum + 1 when unset.
    pub image_count: Option<u32>,
    pub clear_color: [f32; 4],
    pub fence_pool_size: u32,
    pub fence_timeout_ms: u64,
    pub acquire_timeout_ms: u64,
    pub staging_buffer_size: u64,
    pub descriptor_pool_sets: u32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            vsync: true,
            image_count: None,
            clear_color: [0.1, 0.2, 0.8, 1.0],
            fence_pool_size: 12,
            fence_timeout_ms: 5000,
            acquire_timeout_ms: 1000,
            staging_buffer_size: 16 * 1024 * 1024,
            descriptor_pool_sets: 1000,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    /// Default filter for env_logger; RUST_LOG wins when set.
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

/// Control key bindings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlsConfig {
    pub fullscreen_key: String,
    pub vsync_key: String,
    pub quit_key: String,
}

impl Default for ControlsConfig {
    fn default() -> Self {
        Self {
            fullscreen_key: "F11".to_string(),
            vsync_key: "V".to_string(),
            quit_key: "Escape".to_string(),
        }
    }
}

const NS_PER_MS: u64 = 1_000_000;

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
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Library settings derived from the graphics section
    pub fn renderer_settings(&self) -> RendererSettings {
        let graphics = &self.graphics;
        RendererSettings {
            device: DeviceSettings {
                fence_pool_size: graphics.fence_pool_size.max(1),
                fence_timeout_ns: graphics.fence_timeout_ms.saturating_mul(NS_PER_MS),
                acquire_timeout_ns: graphics.acquire_timeout_ms.saturating_mul(NS_PER_MS),
                descriptor_sets_per_pool: graphics.descriptor_pool_sets.max(1),
                ..DeviceSettings::default()
            },
            swapchain: SwapchainSettings {
                vsync: graphics.vsync,
                image_count: graphics.image_count,
            },
            staging_buffer_size: graphics.staging_buffer_size,
        }
    }
}
