//! Vulkan backend error types.

use ash::vk;
use cadence_gpu::GpuError;
use thiserror::Error;

/// Errors raised while talking to the Vulkan driver.
#[derive(Error, Debug)]
pub enum VulkanError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// The Vulkan loader could not be opened.
    #[error("Failed to load Vulkan: {0}")]
    Loading(String),

    /// No suitable GPU found.
    #[error("No suitable GPU found")]
    NoSuitableDevice,

    /// Memory allocation failed.
    #[error("Memory allocation failed: {0}")]
    AllocationFailed(String),

    /// Surface creation failed.
    #[error("Surface creation failed: {0}")]
    SurfaceCreation(String),

    /// A handle passed in does not name a live object.
    #[error("Unknown {kind} handle {handle}")]
    UnknownHandle { kind: &'static str, handle: String },

    /// The format has no Vulkan equivalent for the requested use.
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A call the engine made in the wrong order.
    #[error("{0}")]
    InvalidUse(String),
}

impl VulkanError {
    pub(crate) fn unknown(kind: &'static str, handle: impl std::fmt::Display) -> Self {
        Self::UnknownHandle {
            kind,
            handle: handle.to_string(),
        }
    }
}

/// Result type for backend-internal operations.
pub type Result<T> = std::result::Result<T, VulkanError>;

impl From<VulkanError> for GpuError {
    fn from(err: VulkanError) -> Self {
        match err {
            VulkanError::Vulkan(vk::Result::ERROR_DEVICE_LOST) => Self::DeviceLost,
            VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR) => Self::SurfaceOutOfDate,
            VulkanError::InvalidUse(message) => Self::InvalidState(message),
            other => Self::device(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for VulkanError {
    fn from(err: gpu_allocator::AllocationError) -> Self {
        Self::AllocationFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_maps_to_fatal_error() {
        let err = GpuError::from(VulkanError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(err, GpuError::DeviceLost);
        assert!(err.is_fatal());
    }

    #[test]
    fn out_of_date_maps_to_surface_error() {
        let err = GpuError::from(VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DATE_KHR));
        assert_eq!(err, GpuError::SurfaceOutOfDate);
    }

    #[test]
    fn other_results_become_device_errors() {
        let err = GpuError::from(VulkanError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        assert!(matches!(err, GpuError::Device(message) if message.contains("Vulkan error")));
        assert!(!GpuError::from(VulkanError::NoSuitableDevice).is_fatal());
        assert!(matches!(
            GpuError::from(VulkanError::InvalidUse("present before acquire".into())),
            GpuError::InvalidState(_)
        ));
    }
}
