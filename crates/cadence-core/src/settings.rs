//! Display and quality settings.
//!
//! Each settings group is a plain value type. The engine keeps the last
//! applied groups in a [`SettingsSnapshot`] and compares incoming requests
//! against it field by field.

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::format::is_valid_sample_count;
use crate::limits::{MAX_FILTERING_LEVEL, MAX_TEXTURE_DIMENSION, MIN_SHADOW_MAP_RESOLUTION};

/// How the output surface occupies the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    #[default]
    Windowed,
    Fullscreen,
    Borderless,
}

/// Output dimensions and presentation behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplaySettings {
    pub width: u32,
    pub height: u32,
    pub refresh_rate: u32,
    pub mode: WindowMode,
    pub vsync: bool,
}

impl Default for DisplaySettings {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_rate: 60,
            mode: WindowMode::Windowed,
            vsync: false,
        }
    }
}

impl DisplaySettings {
    /// Create display settings for the given size, keeping other defaults.
    pub fn with_size(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            ..Default::default()
        }
    }

    /// Number of vertical blanks to wait for on present.
    pub const fn sync_interval(&self) -> u32 {
        if self.vsync {
            1
        } else {
            0
        }
    }

    /// Check dimensions and refresh rate.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0
            || self.height == 0
            || self.width > MAX_TEXTURE_DIMENSION
            || self.height > MAX_TEXTURE_DIMENSION
        {
            return Err(ConfigError::InvalidDimensions {
                width: self.width,
                height: self.height,
            });
        }
        if self.refresh_rate == 0 {
            return Err(ConfigError::RefreshRate(self.refresh_rate));
        }
        Ok(())
    }
}

/// Anti-aliasing technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AntiAliasingMode {
    #[default]
    None,
    Msaa,
    Fxaa,
    Taa,
}

/// Anti-aliasing request.
///
/// `sample_count` only matters in [`AntiAliasingMode::Msaa`]; the quality
/// level is never requested, it is probed from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AntiAliasingSettings {
    pub mode: AntiAliasingMode,
    pub sample_count: u32,
}

impl Default for AntiAliasingSettings {
    fn default() -> Self {
        Self {
            mode: AntiAliasingMode::None,
            sample_count: 4,
        }
    }
}

impl AntiAliasingSettings {
    /// Multisampling with the given sample count.
    pub const fn msaa(sample_count: u32) -> Self {
        Self {
            mode: AntiAliasingMode::Msaa,
            sample_count,
        }
    }

    /// Sample count the caller is asking for, before probing.
    pub const fn requested_samples(&self) -> u32 {
        match self.mode {
            AntiAliasingMode::Msaa => self.sample_count,
            _ => 1,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == AntiAliasingMode::Msaa && !is_valid_sample_count(self.sample_count) {
            return Err(ConfigError::SampleCount(self.sample_count));
        }
        Ok(())
    }
}

/// Discrete shadow quality tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShadowQuality {
    Low,
    #[default]
    Medium,
    High,
    Ultra,
}

/// Shadow filtering parameters derived from a quality tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowParams {
    /// Depth bias applied when sampling the shadow map.
    pub bias: f32,
    /// Number of filter taps.
    pub sample_count: u32,
}

impl ShadowQuality {
    /// All tiers, lowest first.
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Ultra];

    /// Bias decreases and tap count increases with each tier.
    pub const fn params(self) -> ShadowParams {
        match self {
            Self::Low => ShadowParams {
                bias: 0.005,
                sample_count: 4,
            },
            Self::Medium => ShadowParams {
                bias: 0.003,
                sample_count: 8,
            },
            Self::High => ShadowParams {
                bias: 0.001,
                sample_count: 16,
            },
            Self::Ultra => ShadowParams {
                bias: 0.0005,
                sample_count: 32,
            },
        }
    }
}

/// Shadow map request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShadowSettings {
    pub quality: ShadowQuality,
    pub map_resolution: u32,
    pub soft_shadows: bool,
}

impl Default for ShadowSettings {
    fn default() -> Self {
        Self {
            quality: ShadowQuality::Medium,
            map_resolution: 2048,
            soft_shadows: false,
        }
    }
}

impl ShadowSettings {
    pub fn validate(&self) -> Result<()> {
        if self.map_resolution < MIN_SHADOW_MAP_RESOLUTION
            || self.map_resolution > MAX_TEXTURE_DIMENSION
        {
            return Err(ConfigError::ShadowResolution(self.map_resolution));
        }
        Ok(())
    }
}

/// Texture resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextureQuality {
    Low,
    Medium,
    #[default]
    High,
    Ultra,
}

impl TextureQuality {
    /// Scale applied to source texture resolution.
    pub const fn resolution_scale(self) -> f32 {
        match self {
            Self::Low => 0.5,
            Self::Medium => 0.75,
            Self::High => 1.0,
            Self::Ultra => 1.5,
        }
    }
}

/// Texture sampling request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureSettings {
    /// Anisotropy level; values above 4 select anisotropic filtering.
    pub filtering_level: u32,
    pub quality: TextureQuality,
    pub mipmapping: bool,
}

impl Default for TextureSettings {
    fn default() -> Self {
        Self {
            filtering_level: 4,
            quality: TextureQuality::High,
            mipmapping: true,
        }
    }
}

impl TextureSettings {
    pub fn validate(&self) -> Result<()> {
        if self.filtering_level == 0 || self.filtering_level > MAX_FILTERING_LEVEL {
            return Err(ConfigError::FilteringLevel(self.filtering_level));
        }
        Ok(())
    }
}

/// Last-applied value of every settings group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsSnapshot {
    pub display: DisplaySettings,
    pub anti_aliasing: AntiAliasingSettings,
    pub shadows: ShadowSettings,
    pub textures: TextureSettings,
}

impl SettingsSnapshot {
    /// Validate every group.
    pub fn validate(&self) -> Result<()> {
        self.display.validate()?;
        self.anti_aliasing.validate()?;
        self.shadows.validate()?;
        self.textures.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn shadow_tiers_improve_monotonically() {
        let params: Vec<_> = ShadowQuality::ALL.iter().map(|q| q.params()).collect();
        for pair in params.windows(2) {
            assert!(pair[1].bias < pair[0].bias);
            assert!(pair[1].sample_count > pair[0].sample_count);
        }
        assert_relative_eq!(ShadowQuality::Low.params().bias, 0.005);
        assert_eq!(ShadowQuality::Low.params().sample_count, 4);
        assert_relative_eq!(ShadowQuality::Ultra.params().bias, 0.0005);
        assert_eq!(ShadowQuality::Ultra.params().sample_count, 32);
    }

    #[test]
    fn display_validation() {
        assert!(DisplaySettings::with_size(1920, 1080).validate().is_ok());
        assert_eq!(
            DisplaySettings::with_size(0, 1080).validate(),
            Err(ConfigError::InvalidDimensions {
                width: 0,
                height: 1080
            })
        );
        let display = DisplaySettings {
            refresh_rate: 0,
            ..Default::default()
        };
        assert_eq!(display.validate(), Err(ConfigError::RefreshRate(0)));
    }

    #[test]
    fn msaa_sample_count_validation() {
        assert!(AntiAliasingSettings::msaa(4).validate().is_ok());
        assert_eq!(
            AntiAliasingSettings::msaa(3).validate(),
            Err(ConfigError::SampleCount(3))
        );
        // Sample count is ignored outside MSAA.
        let fxaa = AntiAliasingSettings {
            mode: AntiAliasingMode::Fxaa,
            sample_count: 3,
        };
        assert!(fxaa.validate().is_ok());
        assert_eq!(fxaa.requested_samples(), 1);
    }

    #[test]
    fn sync_interval_follows_vsync() {
        let mut display = DisplaySettings::default();
        assert_eq!(display.sync_interval(), 0);
        display.vsync = true;
        assert_eq!(display.sync_interval(), 1);
    }

    #[test]
    fn texture_quality_scale() {
        assert_relative_eq!(TextureQuality::Low.resolution_scale(), 0.5);
        assert_relative_eq!(TextureQuality::Ultra.resolution_scale(), 1.5);
        assert!(TextureSettings {
            filtering_level: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }
}
