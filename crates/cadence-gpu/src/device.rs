//! The device seam.
//!
//! [`GpuDevice`] is the one trait every backend implements. The engine never
//! sees backend objects, only the `Copy` handles defined here, and it records
//! work as plain [`GpuCommand`] values that the backend encodes into its own
//! command buffers.

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use cadence_core::{Format, SampleDesc, WindowMode};

use crate::error::Result;

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl $name {
            /// Raw handle value.
            pub const fn raw(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}#{}", stringify!($name), self.0)
            }
        }
    };
}

handle!(
    /// GPU-signalable fence.
    FenceId
);
handle!(
    /// Memory backing a command list while it is recorded and executed.
    CommandAllocatorId
);
handle!(
    /// Reusable command recorder.
    CommandListId
);
handle!(
    /// Image resource.
    TextureId
);
handle!(
    /// Descriptor identifying a texture for binding.
    ViewId
);
handle!(
    /// Texture sampler descriptor.
    SamplerId
);
handle!(
    /// Rotating set of presentable buffers bound to an output.
    SwapchainId
);

/// How a texture is being used by the GPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceState {
    /// Freshly created, contents undefined.
    Common,
    /// Owned by the display pipeline.
    Present,
    RenderTarget,
    DepthWrite,
    DepthRead,
    ShaderResource,
    ResolveSource,
    ResolveDest,
}

bitflags! {
    /// Ways a texture may be bound.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TextureUsage: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        const SHADER_RESOURCE = 1 << 2;
    }
}

/// Optimised clear value baked into a texture at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u8 },
}

/// Texture creation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub samples: SampleDesc,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
    pub clear_value: Option<ClearValue>,
}

/// What a view binds its texture as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    RenderTarget,
    DepthStencil,
    ShaderResource,
}

/// Texture filtering mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Linear,
    Anisotropic,
}

/// Texture coordinate addressing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    Wrap,
    Clamp,
}

/// Sampler creation parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub filter: Filter,
    pub address_mode: AddressMode,
    pub max_anisotropy: u32,
    pub min_lod: f32,
    pub max_lod: f32,
    pub mip_lod_bias: f32,
}

/// Swap chain creation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub buffer_count: u32,
    pub refresh_rate: u32,
    pub mode: WindowMode,
    pub vsync: bool,
}

/// Rasterizer viewport.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    /// Full-surface viewport with the standard 0..1 depth range.
    #[allow(clippy::cast_precision_loss)]
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

/// Scissor rectangle in pixels, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: u32,
    pub top: u32,
    pub right: u32,
    pub bottom: u32,
}

impl ScissorRect {
    pub const fn full(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: width,
            bottom: height,
        }
    }
}

/// One recorded GPU operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GpuCommand {
    Transition {
        texture: TextureId,
        before: ResourceState,
        after: ResourceState,
    },
    ClearRenderTarget {
        view: ViewId,
        color: [f32; 4],
    },
    ClearDepthStencil {
        view: ViewId,
        depth: f32,
        stencil: u8,
    },
    SetRenderTargets {
        color: Option<ViewId>,
        depth: Option<ViewId>,
    },
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    Resolve {
        source: TextureId,
        destination: TextureId,
        format: Format,
    },
}

impl GpuCommand {
    /// Textures this command touches directly.
    pub fn textures(&self) -> impl Iterator<Item = TextureId> {
        let pair = match *self {
            Self::Transition { texture, .. } => [Some(texture), None],
            Self::Resolve {
                source,
                destination,
                ..
            } => [Some(source), Some(destination)],
            _ => [None, None],
        };
        pair.into_iter().flatten()
    }

    /// Views this command touches directly.
    pub fn views(&self) -> impl Iterator<Item = ViewId> {
        let pair = match *self {
            Self::ClearRenderTarget { view, .. } | Self::ClearDepthStencil { view, .. } => {
                [Some(view), None]
            }
            Self::SetRenderTargets { color, depth } => [color, depth],
            _ => [None, None],
        };
        pair.into_iter().flatten()
    }
}

/// Adapter description and behaviour flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterInfo {
    pub name: String,
    pub backend: &'static str,
    /// Whether toggling vsync needs the swap chain rebuilt rather than only
    /// a different present interval.
    pub vsync_requires_swapchain_rebuild: bool,
}

/// A graphics device.
///
/// Implementations are shared read-only between all engine components, so
/// every method takes `&self`. Destroy calls never fail; callers guarantee
/// the object is no longer referenced by unretired GPU work.
pub trait GpuDevice: Send + Sync + 'static {
    /// Platform output a swap chain is created for.
    type Output;

    fn info(&self) -> AdapterInfo;

    /// Number of quality levels supported for `sample_count` samples of
    /// `format`. Zero means unsupported.
    fn msaa_quality_levels(&self, format: Format, sample_count: u32) -> Result<u32>;

    /// Fails with `DeviceLost` once the adapter has been removed.
    fn status(&self) -> Result<()>;

    fn create_fence(&self, initial_value: u64) -> Result<FenceId>;
    fn destroy_fence(&self, fence: FenceId);
    fn fence_completed_value(&self, fence: FenceId) -> Result<u64>;
    /// Block until the fence reaches `value` or `timeout` elapses.
    ///
    /// Returns whether the value was reached.
    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<bool>;
    /// Enqueue a signal that sets the fence to `value` after all prior work.
    fn queue_signal(&self, fence: FenceId, value: u64) -> Result<()>;

    fn create_command_allocator(&self) -> Result<CommandAllocatorId>;
    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()>;
    fn destroy_command_allocator(&self, allocator: CommandAllocatorId);
    fn create_command_list(&self) -> Result<CommandListId>;
    fn destroy_command_list(&self, list: CommandListId);
    /// Encode a closed recording into `list` using memory from `allocator`.
    fn encode_command_list(
        &self,
        list: CommandListId,
        allocator: CommandAllocatorId,
        commands: &[GpuCommand],
    ) -> Result<()>;
    /// Enqueue an encoded list for execution.
    fn execute_command_list(&self, list: CommandListId) -> Result<()>;

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId>;
    fn destroy_texture(&self, texture: TextureId);
    fn create_view(&self, texture: TextureId, kind: ViewKind) -> Result<ViewId>;
    fn destroy_view(&self, view: ViewId);
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId>;
    fn destroy_sampler(&self, sampler: SamplerId);

    fn create_swapchain(&self, output: &Self::Output, desc: &SwapchainDesc)
        -> Result<SwapchainId>;
    /// Reallocate every buffer. All views of the old buffers must be gone.
    fn resize_swapchain(&self, swapchain: SwapchainId, desc: &SwapchainDesc) -> Result<()>;
    fn destroy_swapchain(&self, swapchain: SwapchainId);
    /// Texture backing buffer `index`. Owned by the swap chain.
    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId>;
    /// Announce that the next recorded frame renders to buffer `index`.
    fn acquire_swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<()>;
    /// Hand the acquired buffer to the display.
    fn present(&self, swapchain: SwapchainId, sync_interval: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_references() {
        let resolve = GpuCommand::Resolve {
            source: TextureId(1),
            destination: TextureId(2),
            format: Format::Rgba8Unorm,
        };
        assert_eq!(
            resolve.textures().collect::<Vec<_>>(),
            vec![TextureId(1), TextureId(2)]
        );
        assert_eq!(resolve.views().count(), 0);

        let bind = GpuCommand::SetRenderTargets {
            color: Some(ViewId(3)),
            depth: None,
        };
        assert_eq!(bind.views().collect::<Vec<_>>(), vec![ViewId(3)]);
    }

    #[test]
    fn full_viewport_and_scissor() {
        let viewport = Viewport::full(1920, 1080);
        assert!((viewport.width - 1920.0).abs() < f32::EPSILON);
        assert!((viewport.max_depth - 1.0).abs() < f32::EPSILON);
        assert_eq!(ScissorRect::full(1920, 1080).right, 1920);
    }
}
