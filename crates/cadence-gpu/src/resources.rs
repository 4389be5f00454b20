//! Settings-dependent GPU resources.
//!
//! Each resource is sized and formatted from the current settings and is
//! replaced wholesale, never patched, when those settings change. Replacing
//! or releasing a resource requires a drained fence.

use std::sync::Arc;

use cadence_core::{
    Format, SampleDesc, ShadowParams, ShadowQuality, ShadowSettings, TextureQuality,
    TextureSettings,
};
use tracing::{debug, warn};

use crate::command::CommandChannel;
use crate::device::{
    AddressMode, ClearValue, Filter, GpuDevice, ResourceState, SamplerDesc, SamplerId,
    TextureDesc, TextureId, TextureUsage, ViewId, ViewKind,
};
use crate::error::{GpuError, Result};
use crate::sync::FenceSynchronizer;

/// Shadow maps are always single-channel 32-bit depth.
pub const SHADOW_MAP_FORMAT: Format = Format::D32Float;

/// Filtering levels above this select anisotropic filtering.
pub const ANISOTROPY_THRESHOLD: u32 = 4;

/// Everything needed to create a dependent resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub label: &'static str,
    pub width: u32,
    pub height: u32,
    pub format: Format,
    pub samples: SampleDesc,
    pub usage: TextureUsage,
    pub initial_state: ResourceState,
    pub clear_value: ClearValue,
    pub view_kind: ViewKind,
}

impl ResourceSpec {
    fn texture_desc(&self) -> TextureDesc {
        TextureDesc {
            label: self.label.to_string(),
            width: self.width,
            height: self.height,
            format: self.format,
            samples: self.samples,
            usage: self.usage,
            initial_state: self.initial_state,
            clear_value: Some(self.clear_value),
        }
    }
}

fn require_drained<D: GpuDevice>(fence: &FenceSynchronizer<D>, what: &str) -> Result<()> {
    if fence.is_drained()? {
        Ok(())
    } else {
        Err(GpuError::invalid_state(format!(
            "{what} replaced while GPU work is in flight"
        )))
    }
}

struct Allocated {
    texture: TextureId,
    view: ViewId,
    spec: ResourceSpec,
}

/// A texture and its view, exclusively owned and rebuilt as a unit.
pub struct DependentResource<D: GpuDevice> {
    device: Arc<D>,
    current: Option<Allocated>,
    generation: u64,
}

impl<D: GpuDevice> DependentResource<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            current: None,
            generation: 0,
        }
    }

    /// Destroy the current texture, if any, and create one matching `spec`.
    pub fn rebuild(&mut self, spec: ResourceSpec, fence: &FenceSynchronizer<D>) -> Result<()> {
        require_drained(fence, spec.label)?;
        self.destroy();

        let texture = self.device.create_texture(&spec.texture_desc())?;
        let view = match self.device.create_view(texture, spec.view_kind) {
            Ok(view) => view,
            Err(e) => {
                self.device.destroy_texture(texture);
                return Err(e);
            }
        };
        self.generation += 1;
        debug!(
            label = spec.label,
            width = spec.width,
            height = spec.height,
            format = ?spec.format,
            samples = spec.samples.count,
            quality = spec.samples.quality,
            generation = self.generation,
            "Rebuilt dependent resource"
        );
        self.current = Some(Allocated {
            texture,
            view,
            spec,
        });
        Ok(())
    }

    /// Destroy the resource without replacing it.
    pub fn release(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        if let Some(current) = &self.current {
            require_drained(fence, current.spec.label)?;
        }
        self.destroy();
        Ok(())
    }

    /// View for binding. Fails before the first successful rebuild.
    pub fn view(&self) -> Result<ViewId> {
        self.current
            .as_ref()
            .map(|c| c.view)
            .ok_or_else(|| GpuError::invalid_state("dependent resource not built"))
    }

    pub fn texture(&self) -> Option<TextureId> {
        self.current.as_ref().map(|c| c.texture)
    }

    pub fn spec(&self) -> Option<&ResourceSpec> {
        self.current.as_ref().map(|c| &c.spec)
    }

    /// Number of successful rebuilds.
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    pub const fn is_allocated(&self) -> bool {
        self.current.is_some()
    }

    fn destroy(&mut self) {
        if let Some(current) = self.current.take() {
            self.device.destroy_view(current.view);
            self.device.destroy_texture(current.texture);
        }
    }
}

impl<D: GpuDevice> Drop for DependentResource<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Depth/stencil buffer matching the display size and sample description.
pub struct DepthBuffer<D: GpuDevice> {
    resource: DependentResource<D>,
}

impl<D: GpuDevice> DepthBuffer<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            resource: DependentResource::new(device),
        }
    }

    pub const fn spec(width: u32, height: u32, format: Format, samples: SampleDesc) -> ResourceSpec {
        ResourceSpec {
            label: "depth buffer",
            width,
            height,
            format,
            samples,
            usage: TextureUsage::DEPTH_STENCIL,
            initial_state: ResourceState::Common,
            clear_value: ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
            view_kind: ViewKind::DepthStencil,
        }
    }

    /// Recreate the buffer and record its transition into depth-write state.
    ///
    /// `channel` must have an open recording that is submitted before the
    /// buffer is first bound.
    pub fn rebuild(
        &mut self,
        spec: ResourceSpec,
        fence: &FenceSynchronizer<D>,
        channel: &mut CommandChannel<D>,
    ) -> Result<()> {
        if !channel.is_recording() {
            return Err(GpuError::invalid_state(
                "depth buffer rebuilt without an open recording",
            ));
        }
        self.resource.rebuild(spec, fence)?;
        if let Some(texture) = self.resource.texture() {
            channel.transition(texture, ResourceState::Common, ResourceState::DepthWrite)?;
        }
        Ok(())
    }

    pub fn release(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        self.resource.release(fence)
    }

    pub const fn resource(&self) -> &DependentResource<D> {
        &self.resource
    }

    pub fn view(&self) -> Result<ViewId> {
        self.resource.view()
    }
}

/// Multisampled colour target, present only while MSAA is effective.
pub struct MultisampleTarget<D: GpuDevice> {
    resource: DependentResource<D>,
}

impl<D: GpuDevice> MultisampleTarget<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            resource: DependentResource::new(device),
        }
    }

    pub const fn spec(
        width: u32,
        height: u32,
        format: Format,
        samples: SampleDesc,
        clear_color: [f32; 4],
    ) -> ResourceSpec {
        ResourceSpec {
            label: "multisample target",
            width,
            height,
            format,
            samples,
            usage: TextureUsage::RENDER_TARGET,
            initial_state: ResourceState::RenderTarget,
            clear_value: ClearValue::Color(clear_color),
            view_kind: ViewKind::RenderTarget,
        }
    }

    /// Rebuild for a multisampled description, or release for a single one.
    pub fn rebuild(&mut self, spec: ResourceSpec, fence: &FenceSynchronizer<D>) -> Result<()> {
        if spec.samples.is_multisampled() {
            self.resource.rebuild(spec, fence)
        } else {
            self.resource.release(fence)
        }
    }

    pub fn release(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        self.resource.release(fence)
    }

    pub const fn resource(&self) -> &DependentResource<D> {
        &self.resource
    }

    pub fn view(&self) -> Result<ViewId> {
        self.resource.view()
    }

    pub const fn is_enabled(&self) -> bool {
        self.resource.is_allocated()
    }
}

/// Square depth map rendered from the light.
pub struct ShadowMap<D: GpuDevice> {
    resource: DependentResource<D>,
    quality: ShadowQuality,
    soft_shadows: bool,
}

impl<D: GpuDevice> ShadowMap<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            resource: DependentResource::new(device),
            quality: ShadowQuality::default(),
            soft_shadows: false,
        }
    }

    pub const fn spec(resolution: u32) -> ResourceSpec {
        ResourceSpec {
            label: "shadow map",
            width: resolution,
            height: resolution,
            format: SHADOW_MAP_FORMAT,
            samples: SampleDesc::SINGLE,
            usage: TextureUsage::DEPTH_STENCIL.union(TextureUsage::SHADER_RESOURCE),
            initial_state: ResourceState::DepthWrite,
            clear_value: ClearValue::DepthStencil {
                depth: 1.0,
                stencil: 0,
            },
            view_kind: ViewKind::DepthStencil,
        }
    }

    /// Recreate the map for new quality or resolution.
    pub fn rebuild(&mut self, settings: &ShadowSettings, fence: &FenceSynchronizer<D>) -> Result<()> {
        self.resource
            .rebuild(Self::spec(settings.map_resolution), fence)?;
        self.quality = settings.quality;
        self.soft_shadows = settings.soft_shadows;
        Ok(())
    }

    /// Apply settings that do not affect the texture.
    pub fn set_soft_shadows(&mut self, soft_shadows: bool) {
        self.soft_shadows = soft_shadows;
    }

    pub fn release(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        self.resource.release(fence)
    }

    pub const fn params(&self) -> ShadowParams {
        self.quality.params()
    }

    pub const fn quality(&self) -> ShadowQuality {
        self.quality
    }

    pub const fn soft_shadows(&self) -> bool {
        self.soft_shadows
    }

    pub const fn resource(&self) -> &DependentResource<D> {
        &self.resource
    }

    pub fn view(&self) -> Result<ViewId> {
        self.resource.view()
    }
}

/// Texture sampler derived from texture settings.
pub struct SamplerState<D: GpuDevice> {
    device: Arc<D>,
    sampler: Option<SamplerId>,
    desc: Option<SamplerDesc>,
    texture_quality: TextureQuality,
    mipmapping: bool,
    generation: u64,
}

impl<D: GpuDevice> SamplerState<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            sampler: None,
            desc: None,
            texture_quality: TextureQuality::default(),
            mipmapping: true,
            generation: 0,
        }
    }

    /// Sampler description for a filtering level.
    pub const fn desc_for(settings: &TextureSettings) -> SamplerDesc {
        let filter = if settings.filtering_level > ANISOTROPY_THRESHOLD {
            Filter::Anisotropic
        } else {
            Filter::Linear
        };
        SamplerDesc {
            filter,
            address_mode: AddressMode::Wrap,
            max_anisotropy: settings.filtering_level,
            min_lod: 0.0,
            max_lod: f32::MAX,
            mip_lod_bias: 0.0,
        }
    }

    pub fn rebuild(&mut self, settings: &TextureSettings, fence: &FenceSynchronizer<D>) -> Result<()> {
        require_drained(fence, "sampler")?;
        let desc = Self::desc_for(settings);
        if let Some(sampler) = self.sampler.take() {
            self.device.destroy_sampler(sampler);
        }
        self.sampler = Some(self.device.create_sampler(&desc)?);
        self.desc = Some(desc);
        self.generation += 1;
        self.apply_texture_settings(settings);
        debug!(filter = ?desc.filter, max_anisotropy = desc.max_anisotropy, "Rebuilt sampler");
        Ok(())
    }

    /// Record settings that need no GPU object change.
    pub fn apply_texture_settings(&mut self, settings: &TextureSettings) {
        self.texture_quality = settings.quality;
        self.mipmapping = settings.mipmapping;
    }

    pub fn sampler(&self) -> Result<SamplerId> {
        self.sampler
            .ok_or_else(|| GpuError::invalid_state("sampler not built"))
    }

    pub const fn desc(&self) -> Option<SamplerDesc> {
        self.desc
    }

    /// Scale applied to source texture resolution at load time.
    pub const fn resolution_scale(&self) -> f32 {
        self.texture_quality.resolution_scale()
    }

    pub const fn mipmapping(&self) -> bool {
        self.mipmapping
    }

    pub const fn generation(&self) -> u64 {
        self.generation
    }

    fn destroy(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            self.device.destroy_sampler(sampler);
        }
        self.desc = None;
    }
}

impl<D: GpuDevice> Drop for SamplerState<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Every settings-dependent resource the engine owns.
pub struct DependentResourceSet<D: GpuDevice> {
    pub depth: DepthBuffer<D>,
    pub multisample: MultisampleTarget<D>,
    pub shadow_map: ShadowMap<D>,
    pub sampler: SamplerState<D>,
}

impl<D: GpuDevice> DependentResourceSet<D> {
    pub fn new(device: &Arc<D>) -> Self {
        Self {
            depth: DepthBuffer::new(Arc::clone(device)),
            multisample: MultisampleTarget::new(Arc::clone(device)),
            shadow_map: ShadowMap::new(Arc::clone(device)),
            sampler: SamplerState::new(Arc::clone(device)),
        }
    }

    /// Destroy everything, most dependent first.
    pub fn release_all(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        self.sampler.destroy();
        self.shadow_map.release(fence)?;
        self.multisample.release(fence)?;
        self.depth.release(fence)
    }
}

/// Sample description the device can actually render for `requested`
/// samples of both formats.
///
/// Quality is zero-indexed: a probe reporting `n` levels yields quality
/// `n - 1`. Unsupported counts fall back to single sampling.
pub fn probe_sample_desc<D: GpuDevice>(
    device: &D,
    color_format: Format,
    depth_format: Format,
    requested: u32,
) -> Result<SampleDesc> {
    if requested <= 1 {
        return Ok(SampleDesc::SINGLE);
    }
    let levels = device
        .msaa_quality_levels(color_format, requested)?
        .min(device.msaa_quality_levels(depth_format, requested)?);
    if levels < 1 {
        warn!(
            requested,
            format = ?color_format,
            "MSAA sample count not supported, multisampling disabled"
        );
        return Ok(SampleDesc::SINGLE);
    }
    Ok(SampleDesc::new(requested, levels - 1))
}
