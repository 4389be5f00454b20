//! GPU error types.

use cadence_core::ConfigError;
use thiserror::Error;

use crate::sync::FenceValue;

/// Errors raised by the frame engine and its backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GpuError {
    /// Settings or configuration rejected before any GPU call.
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    /// A GPU object creation or submission call failed.
    #[error("Device error: {0}")]
    Device(String),

    /// The adapter was removed or reset.
    #[error("GPU device lost")]
    DeviceLost,

    /// The command allocator is still referenced by unretired work.
    #[error("Command allocator still in use until fence value {guard}")]
    AllocatorInUse { guard: FenceValue },

    /// The per-frame recording capacity was exceeded.
    #[error("Command recording full ({capacity} commands)")]
    RecordingFull { capacity: usize },

    /// The output surface no longer matches the swap chain.
    #[error("Surface out of date")]
    SurfaceOutOfDate,

    /// A previous failure left the engine unusable.
    #[error("Engine is in the failed state and must be reinitialized")]
    EngineFailed,

    /// Operation called in the wrong state.
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl GpuError {
    /// Create a device error from anything displayable.
    pub fn device(message: impl std::fmt::Display) -> Self {
        Self::Device(message.to_string())
    }

    /// Create an invalid-state error.
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    /// Whether the error ends the engine instance.
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::DeviceLost | Self::EngineFailed)
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, GpuError>;
