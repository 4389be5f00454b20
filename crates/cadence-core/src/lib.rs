//! Core types for the Cadence frame driver.
//!
//! This crate provides the backend-independent vocabulary used by the engine:
//! - Display, anti-aliasing, shadow, and texture settings
//! - Pixel formats and sample descriptions
//! - Engine configuration and validation
//! - Clock sources and frame statistics

pub mod clock;
pub mod config;
pub mod error;
pub mod format;
pub mod settings;
pub mod stats;

pub use clock::{ClockSource, GameTimer, ManualClock};
pub use config::EngineConfig;
pub use error::{ConfigError, Result};
pub use format::{Format, SampleDesc};
pub use settings::{
    AntiAliasingMode, AntiAliasingSettings, DisplaySettings, SettingsSnapshot, ShadowParams,
    ShadowQuality, ShadowSettings, TextureQuality, TextureSettings, WindowMode,
};
pub use stats::{FrameStats, FrameStatsAccumulator};

/// Engine-wide limits.
pub mod limits {
    /// Largest surface or render target edge accepted by validation.
    pub const MAX_TEXTURE_DIMENSION: u32 = 16384;
    /// Smallest shadow map edge.
    pub const MIN_SHADOW_MAP_RESOLUTION: u32 = 256;
    /// Largest number of presentable buffers.
    pub const MAX_BUFFER_COUNT: u32 = 16;
    /// Largest anisotropic filtering level.
    pub const MAX_FILTERING_LEVEL: u32 = 16;
    /// Operations the engine records into a multisampled frame before any
    /// collaborator draw.
    pub const ENGINE_FRAME_COMMANDS: usize = 10;
    /// Operations a settings rebuild records besides one transition per
    /// presentable buffer.
    pub const ENGINE_REBUILD_COMMANDS: usize = 3;
}
