//! Frame synchronization and resource lifecycle for the Cadence frame driver.
//!
//! This crate provides:
//! - The [`GpuDevice`] backend seam and its handle types
//! - Fence-based CPU/GPU synchronization
//! - Bounded command recording over a ring of allocators
//! - Presentable buffer rotation
//! - Settings-dependent resources and the settings change state machine
//! - [`FrameEngine`], which drives all of the above
//! - [`HeadlessDevice`], a simulated GPU for tests and tools

pub mod command;
pub mod coordinator;
pub mod device;
pub mod engine;
pub mod error;
pub mod headless;
pub mod resources;
pub mod swapchain;
pub mod sync;

pub use command::{CommandChannel, CommandRecording};
pub use coordinator::{
    CoordinatorState, PlanContext, RebuildPlan, SettingsCoordinator, SettingsDelta,
};
pub use device::{
    AdapterInfo, AddressMode, ClearValue, CommandAllocatorId, CommandListId, FenceId, Filter,
    GpuCommand, GpuDevice, ResourceState, SamplerDesc, SamplerId, ScissorRect, SwapchainDesc,
    SwapchainId, TextureDesc, TextureId, TextureUsage, ViewId, ViewKind, Viewport,
};
pub use engine::{FrameEngine, FrameRecorder, FrameTargets};
pub use error::{GpuError, Result};
pub use headless::{DeviceEvent, HeadlessDevice, HeadlessDeviceBuilder};
pub use resources::{
    probe_sample_desc, DepthBuffer, DependentResource, DependentResourceSet, MultisampleTarget,
    ResourceSpec, SamplerState, ShadowMap,
};
pub use swapchain::{BufferSlot, PresentationSurface};
pub use sync::{FenceSynchronizer, FenceValue};
