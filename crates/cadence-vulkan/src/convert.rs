//! Translation from backend-neutral descriptions to Vulkan values.

use ash::vk;
use cadence_core::Format;
use cadence_gpu::{AddressMode, Filter, ResourceState, SamplerDesc, TextureUsage, ViewKind};

/// Vulkan format for `format`.
pub const fn vk_format(format: Format) -> vk::Format {
    match format {
        Format::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        Format::Rgba8UnormSrgb => vk::Format::R8G8B8A8_SRGB,
        Format::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        Format::Bgra8UnormSrgb => vk::Format::B8G8R8A8_SRGB,
        Format::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        Format::Rgb10a2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        Format::D16Unorm => vk::Format::D16_UNORM,
        Format::D24UnormS8Uint => vk::Format::D24_UNORM_S8_UINT,
        Format::D32Float => vk::Format::D32_SFLOAT,
        Format::D32FloatS8Uint => vk::Format::D32_SFLOAT_S8_UINT,
    }
}

/// Aspect bits a view of `kind` over `format` covers.
pub const fn aspect_mask(format: Format, kind: ViewKind) -> vk::ImageAspectFlags {
    if !format.is_depth() {
        return vk::ImageAspectFlags::COLOR;
    }
    match kind {
        ViewKind::DepthStencil if format.has_stencil() => vk::ImageAspectFlags::from_raw(
            vk::ImageAspectFlags::DEPTH.as_raw() | vk::ImageAspectFlags::STENCIL.as_raw(),
        ),
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// Aspect bits a barrier on `format` must name.
pub const fn full_aspect_mask(format: Format) -> vk::ImageAspectFlags {
    aspect_mask(format, ViewKind::DepthStencil)
}

/// Sample count bit for `count`, if Vulkan has one.
pub const fn sample_count_flags(count: u32) -> Option<vk::SampleCountFlags> {
    match count {
        1 => Some(vk::SampleCountFlags::TYPE_1),
        2 => Some(vk::SampleCountFlags::TYPE_2),
        4 => Some(vk::SampleCountFlags::TYPE_4),
        8 => Some(vk::SampleCountFlags::TYPE_8),
        16 => Some(vk::SampleCountFlags::TYPE_16),
        32 => Some(vk::SampleCountFlags::TYPE_32),
        64 => Some(vk::SampleCountFlags::TYPE_64),
        _ => None,
    }
}

/// Image usage bits for a texture bound as `usage`.
///
/// Colour targets can always take part in a resolve.
pub fn image_usage(usage: TextureUsage) -> vk::ImageUsageFlags {
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::RENDER_TARGET) {
        flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_SRC
            | vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::DEPTH_STENCIL) {
        flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
    }
    if usage.contains(TextureUsage::SHADER_RESOURCE) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    flags
}

/// Layout, pipeline stages, and access mask for one side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateScope {
    pub layout: vk::ImageLayout,
    pub stages: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

/// Scope of `state` when leaving it.
///
/// `Common` is only ever the state of a freshly created texture, so its
/// contents are undefined.
pub fn source_scope(state: ResourceState) -> StateScope {
    match state {
        ResourceState::Common => StateScope {
            layout: vk::ImageLayout::UNDEFINED,
            stages: vk::PipelineStageFlags2::NONE,
            access: vk::AccessFlags2::NONE,
        },
        // Chains with the acquire semaphore wait
        ResourceState::Present => StateScope {
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
            stages: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::NONE,
        },
        other => scope(other),
    }
}

/// Scope of `state` when entering it.
pub fn destination_scope(state: ResourceState) -> StateScope {
    match state {
        ResourceState::Common => StateScope {
            layout: vk::ImageLayout::GENERAL,
            stages: vk::PipelineStageFlags2::ALL_COMMANDS,
            access: vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE,
        },
        ResourceState::Present => StateScope {
            layout: vk::ImageLayout::PRESENT_SRC_KHR,
            stages: vk::PipelineStageFlags2::NONE,
            access: vk::AccessFlags2::NONE,
        },
        other => scope(other),
    }
}

fn scope(state: ResourceState) -> StateScope {
    let fragment_tests = vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
    match state {
        ResourceState::RenderTarget => StateScope {
            layout: vk::ImageLayout::ATTACHMENT_OPTIMAL,
            stages: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            access: vk::AccessFlags2::COLOR_ATTACHMENT_READ
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
        },
        ResourceState::DepthWrite => StateScope {
            layout: vk::ImageLayout::ATTACHMENT_OPTIMAL,
            stages: fragment_tests,
            access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
        },
        ResourceState::DepthRead => StateScope {
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
            stages: fragment_tests | vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::SHADER_SAMPLED_READ,
        },
        ResourceState::ShaderResource => StateScope {
            layout: vk::ImageLayout::READ_ONLY_OPTIMAL,
            stages: vk::PipelineStageFlags2::FRAGMENT_SHADER,
            access: vk::AccessFlags2::SHADER_SAMPLED_READ,
        },
        ResourceState::ResolveSource => StateScope {
            layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            stages: vk::PipelineStageFlags2::ALL_TRANSFER,
            access: vk::AccessFlags2::TRANSFER_READ,
        },
        ResourceState::ResolveDest => StateScope {
            layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            stages: vk::PipelineStageFlags2::ALL_TRANSFER,
            access: vk::AccessFlags2::TRANSFER_WRITE,
        },
        ResourceState::Common | ResourceState::Present => destination_scope(state),
    }
}

/// Sampler create info for `desc`.
///
/// Anisotropy is dropped when the device lacks the feature and clamped to
/// the device limit otherwise.
#[allow(clippy::cast_precision_loss)]
pub fn sampler_create_info(
    desc: &SamplerDesc,
    anisotropy_supported: bool,
    max_supported_anisotropy: f32,
) -> vk::SamplerCreateInfo<'static> {
    let address_mode = match desc.address_mode {
        AddressMode::Wrap => vk::SamplerAddressMode::REPEAT,
        AddressMode::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
    };
    let anisotropic = desc.filter == Filter::Anisotropic && anisotropy_supported;

    vk::SamplerCreateInfo::default()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .address_mode_u(address_mode)
        .address_mode_v(address_mode)
        .address_mode_w(address_mode)
        .anisotropy_enable(anisotropic)
        .max_anisotropy(if anisotropic {
            (desc.max_anisotropy as f32).min(max_supported_anisotropy)
        } else {
            1.0
        })
        .min_lod(desc.min_lod)
        .max_lod(desc.max_lod.min(vk::LOD_CLAMP_NONE))
        .mip_lod_bias(desc.mip_lod_bias)
        .border_color(vk::BorderColor::FLOAT_OPAQUE_BLACK)
}

/// Map a surface format back to the engine format, if it is one we use.
pub fn format_from_vk(format: vk::Format) -> Option<Format> {
    [
        Format::Rgba8Unorm,
        Format::Rgba8UnormSrgb,
        Format::Bgra8Unorm,
        Format::Bgra8UnormSrgb,
        Format::Rgba16Float,
        Format::Rgb10a2Unorm,
    ]
    .into_iter()
    .find(|candidate| vk_format(*candidate) == format)
}
