//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{ConfigError, Result};
use crate::format::Format;
use crate::limits::{ENGINE_FRAME_COMMANDS, ENGINE_REBUILD_COMMANDS, MAX_BUFFER_COUNT};
use crate::settings::SettingsSnapshot;

/// LightSteelBlue.
pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.690_196, 0.768_627, 0.870_588, 1.0];

/// Engine configuration.
///
/// Every field has a default, so a configuration file only needs to name
/// the values it overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of presentable buffers in the swap chain.
    pub buffer_count: u32,
    /// Number of command allocators rotated between frames.
    pub frames_in_flight: u32,
    /// Format of the presentable buffers.
    pub back_buffer_format: Format,
    /// Format of the depth/stencil buffer.
    pub depth_stencil_format: Format,
    /// Upper bound on operations recorded per frame.
    pub max_commands_per_frame: usize,
    /// Colour the back buffer is cleared to each frame.
    pub clear_color: [f32; 4],
    /// Log a warning each time a fence wait exceeds this many milliseconds.
    pub fence_stall_warning_ms: Option<u64>,
    /// Settings applied at initialisation.
    pub settings: SettingsSnapshot,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            frames_in_flight: 1,
            back_buffer_format: Format::Rgba8Unorm,
            depth_stencil_format: Format::D24UnormS8Uint,
            max_commands_per_frame: 256,
            clear_color: DEFAULT_CLEAR_COLOR,
            fence_stall_warning_ms: None,
            settings: SettingsSnapshot::default(),
        }
    }
}

impl EngineConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Set the initial display size.
    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.settings.display.width = width;
        self.settings.display.height = height;
        self
    }

    /// Set the number of presentable buffers.
    pub fn with_buffer_count(mut self, buffer_count: u32) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    /// Set the number of frames the CPU may run ahead of the GPU.
    pub fn with_frames_in_flight(mut self, frames_in_flight: u32) -> Self {
        self.frames_in_flight = frames_in_flight;
        self
    }

    /// Set the back buffer format.
    pub fn with_back_buffer_format(mut self, format: Format) -> Self {
        self.back_buffer_format = format;
        self
    }

    /// Set the depth/stencil format.
    pub fn with_depth_stencil_format(mut self, format: Format) -> Self {
        self.depth_stencil_format = format;
        self
    }

    /// Set the per-frame recording capacity.
    pub fn with_max_commands_per_frame(mut self, max: usize) -> Self {
        self.max_commands_per_frame = max;
        self
    }

    /// Set the clear colour.
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Set the initial settings.
    pub fn with_settings(mut self, settings: SettingsSnapshot) -> Self {
        self.settings = settings;
        self
    }

    /// Enable or disable vsync.
    pub fn with_vsync(mut self, vsync: bool) -> Self {
        self.settings.display.vsync = vsync;
        self
    }

    /// Fence stall warning interval, if configured.
    pub fn fence_stall_warning(&self) -> Option<Duration> {
        self.fence_stall_warning_ms.map(Duration::from_millis)
    }

    /// Smallest recording capacity that fits what the engine records itself.
    ///
    /// Multisampling can be enabled later, so the multisampled frame counts
    /// even when the initial settings are single-sampled.
    pub fn min_commands_per_frame(&self) -> usize {
        (self.buffer_count as usize + ENGINE_REBUILD_COMMANDS).max(ENGINE_FRAME_COMMANDS)
    }

    /// Check every value that can be checked without a device.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_count < 2 || self.buffer_count > MAX_BUFFER_COUNT {
            return Err(ConfigError::BufferCount {
                count: self.buffer_count,
                max: MAX_BUFFER_COUNT,
            });
        }
        if self.frames_in_flight == 0 {
            return Err(ConfigError::FramesInFlight);
        }
        if !self.back_buffer_format.is_presentable() {
            return Err(ConfigError::InvalidFormat {
                format: self.back_buffer_format,
                role: "back buffer",
            });
        }
        if !self.depth_stencil_format.is_depth() {
            return Err(ConfigError::InvalidFormat {
                format: self.depth_stencil_format,
                role: "depth/stencil buffer",
            });
        }
        let min = self.min_commands_per_frame();
        if self.max_commands_per_frame < min {
            return Err(ConfigError::RecordingCapacity {
                capacity: self.max_commands_per_frame,
                min,
            });
        }
        self.settings.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AntiAliasingMode, ShadowQuality};

    #[test]
    fn default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffer_count, 2);
        assert_eq!(config.frames_in_flight, 1);
    }

    #[test]
    fn single_buffer_is_rejected() {
        let config = EngineConfig::new().with_buffer_count(1);
        assert_eq!(
            config.validate(),
            Err(ConfigError::BufferCount {
                count: 1,
                max: MAX_BUFFER_COUNT
            })
        );
    }

    #[test]
    fn depth_format_as_back_buffer_is_rejected() {
        let config = EngineConfig::new().with_back_buffer_format(Format::D32Float);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidFormat {
                format: Format::D32Float,
                ..
            })
        ));
        let config = EngineConfig::new().with_depth_stencil_format(Format::Rgba8Unorm);
        assert!(config.validate().is_err());
    }

    #[test]
    fn recording_capacity_must_fit_engine_commands() {
        let config = EngineConfig::new().with_max_commands_per_frame(8);
        assert_eq!(
            config.validate(),
            Err(ConfigError::RecordingCapacity {
                capacity: 8,
                min: ENGINE_FRAME_COMMANDS
            })
        );
        assert!(EngineConfig::new()
            .with_max_commands_per_frame(ENGINE_FRAME_COMMANDS)
            .validate()
            .is_ok());

        // Every slot is transitioned during a rebuild.
        let config = EngineConfig::new()
            .with_buffer_count(16)
            .with_max_commands_per_frame(16);
        assert_eq!(
            config.validate(),
            Err(ConfigError::RecordingCapacity {
                capacity: 16,
                min: 19
            })
        );
        assert!(config.with_max_commands_per_frame(19).validate().is_ok());
    }

    #[test]
    fn parse_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            buffer_count = 3
            fence_stall_warning_ms = 500

            [settings.display]
            width = 1920
            height = 1080

            [settings.anti_aliasing]
            mode = "msaa"
            sample_count = 8

            [settings.shadows]
            quality = "ultra"
            "#,
        )
        .unwrap();

        assert_eq!(config.buffer_count, 3);
        assert_eq!(config.frames_in_flight, 1);
        assert_eq!(config.settings.display.width, 1920);
        assert_eq!(config.settings.display.refresh_rate, 60);
        assert_eq!(config.settings.anti_aliasing.mode, AntiAliasingMode::Msaa);
        assert_eq!(config.settings.anti_aliasing.sample_count, 8);
        assert_eq!(config.settings.shadows.quality, ShadowQuality::Ultra);
        assert_eq!(config.settings.shadows.map_resolution, 2048);
        assert_eq!(config.fence_stall_warning(), Some(Duration::from_millis(500)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_error_is_reported() {
        let err = EngineConfig::from_toml_str("buffer_count = \"two\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
