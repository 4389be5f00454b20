//! Configuration error types.

use thiserror::Error;

use crate::format::Format;

/// Errors raised while validating settings or configuration.
///
/// These are always reported before any GPU object is touched.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Surface or target dimensions out of range.
    #[error("Invalid dimensions: {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },

    /// Fewer than two presentable buffers requested.
    #[error("Buffer count must be between 2 and {max}, got {count}")]
    BufferCount { count: u32, max: u32 },

    /// Number of frames in flight is zero.
    #[error("Frames in flight must be at least 1")]
    FramesInFlight,

    /// A format was used for a role it cannot fill.
    #[error("Format {format:?} cannot be used as {role}")]
    InvalidFormat { format: Format, role: &'static str },

    /// Sample count is not a power of two in 1..=16.
    #[error("Unsupported sample count: {0}")]
    SampleCount(u32),

    /// Shadow map resolution out of range.
    #[error("Invalid shadow map resolution: {0}")]
    ShadowResolution(u32),

    /// Anisotropic filtering level out of range.
    #[error("Invalid filtering level: {0}")]
    FilteringLevel(u32),

    /// Refresh rate of zero.
    #[error("Invalid refresh rate: {0}")]
    RefreshRate(u32),

    /// Command recording capacity too small for the engine's own commands.
    #[error("Recording capacity must be at least {min}, got {capacity}")]
    RecordingCapacity { capacity: usize, min: usize },

    /// Configuration file could not be parsed.
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Result type alias using [`ConfigError`].
pub type Result<T> = std::result::Result<T, ConfigError>;
