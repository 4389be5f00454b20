//! Vulkan 1.3 backend for the Cadence frame driver.
//!
//! [`VulkanDevice`] implements [`cadence_gpu::GpuDevice`]: timeline
//! semaphores back fences, command pools back allocators, and image memory
//! comes from `gpu-allocator`. Clears and draws use dynamic rendering.

pub mod context;
pub mod convert;
pub mod device;
mod encode;
pub mod error;
pub mod instance;
pub mod memory;
pub mod swapchain;

pub use context::VulkanContext;
pub use device::{VulkanDevice, VulkanDeviceBuilder};
pub use error::{Result, VulkanError};
pub use swapchain::VulkanOutput;

// Re-export ash for pipeline-owning collaborators
pub use ash;
