//! [`GpuDevice`] over Vulkan 1.3.

use crate::context::VulkanContext;
use crate::convert::{
    aspect_mask, destination_scope, full_aspect_mask, image_usage, sample_count_flags,
    sampler_create_info, source_scope, vk_format,
};
use crate::encode::{encode, ImageRef, ResourceLookup, ViewRef};
use crate::error::{Result as VkBackendResult, VulkanError};
use crate::memory::GpuImage;
use crate::swapchain::{Acquired, SwapchainImages, VulkanOutput};
use ash::vk;
use cadence_core::Format;
use cadence_gpu::{
    AdapterInfo, CommandAllocatorId, CommandListId, FenceId, GpuCommand, GpuDevice, GpuError,
    ResourceState, Result, SamplerDesc, SamplerId, SwapchainDesc, SwapchainId, TextureDesc,
    TextureId, ViewId, ViewKind,
};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builder for [`VulkanDevice`].
pub struct VulkanDeviceBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for VulkanDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "Cadence".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl VulkanDeviceBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Create a device able to present to windows on `display`'s display.
    pub fn build(self, display: &impl HasDisplayHandle) -> VkBackendResult<VulkanDevice> {
        let display = display
            .display_handle()
            .map_err(|e| VulkanError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let context = Arc::new(VulkanContext::new(
            display.as_raw(),
            &self.app_name,
            self.enable_validation,
        )?);
        VulkanDevice::from_context(context)
    }
}

enum TextureEntry {
    Owned { image: GpuImage, desc: TextureDesc },
    Swapchain(SwapchainId),
}

struct ViewEntry {
    texture: TextureId,
    /// `None` for swap chain buffers, whose image is only known once acquired.
    view: Option<vk::ImageView>,
}

struct AllocatorEntry {
    pool: vk::CommandPool,
    buffers: HashMap<CommandListId, vk::CommandBuffer>,
}

#[derive(Clone, Copy)]
struct EncodedList {
    buffer: vk::CommandBuffer,
    swapchain: Option<SwapchainId>,
}

struct DeviceState {
    next_id: u64,
    fences: HashMap<FenceId, vk::Semaphore>,
    allocators: HashMap<CommandAllocatorId, AllocatorEntry>,
    lists: HashMap<CommandListId, Option<EncodedList>>,
    textures: HashMap<TextureId, TextureEntry>,
    views: HashMap<ViewId, ViewEntry>,
    samplers: HashMap<SamplerId, vk::Sampler>,
    swapchains: HashMap<SwapchainId, SwapchainImages>,
    setup_pool: vk::CommandPool,
    draw_pipeline: Option<vk::Pipeline>,
}

impl DeviceState {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn slot_textures(&mut self, swapchain: SwapchainId, count: u32) -> Vec<TextureId> {
        (0..count)
            .map(|_| {
                let texture = TextureId(self.allocate_id());
                self.textures
                    .insert(texture, TextureEntry::Swapchain(swapchain));
                texture
            })
            .collect()
    }

    fn forget_slot_textures(&mut self, slots: &[TextureId]) {
        for texture in slots {
            self.textures.remove(texture);
        }
    }
}

impl ResourceLookup for DeviceState {
    fn image(&self, texture: TextureId) -> VkBackendResult<Option<ImageRef>> {
        match self.textures.get(&texture) {
            Some(TextureEntry::Owned { image, desc }) => Ok(Some(ImageRef {
                image: image.image,
                format: desc.format,
                extent: vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
                swapchain: None,
            })),
            Some(TextureEntry::Swapchain(swapchain)) => {
                let images = self
                    .swapchains
                    .get(swapchain)
                    .ok_or_else(|| VulkanError::unknown("swapchain", swapchain))?;
                Ok(images
                    .slot_of(texture)
                    .and_then(|slot| images.acquired_image(slot))
                    .map(|(image, _)| ImageRef {
                        image,
                        format: images.format,
                        extent: images.extent,
                        swapchain: Some(*swapchain),
                    }))
            }
            None => Err(VulkanError::unknown("texture", texture)),
        }
    }

    fn view(&self, view: ViewId) -> VkBackendResult<ViewRef> {
        let entry = self
            .views
            .get(&view)
            .ok_or_else(|| VulkanError::unknown("view", view))?;
        match (entry.view, self.textures.get(&entry.texture)) {
            (Some(handle), Some(TextureEntry::Owned { desc, .. })) => Ok(ViewRef {
                view: handle,
                format: desc.format,
                extent: vk::Extent2D {
                    width: desc.width,
                    height: desc.height,
                },
                swapchain: None,
            }),
            (None, Some(TextureEntry::Swapchain(swapchain))) => {
                let images = self
                    .swapchains
                    .get(swapchain)
                    .ok_or_else(|| VulkanError::unknown("swapchain", swapchain))?;
                let (_, handle) = images
                    .slot_of(entry.texture)
                    .and_then(|slot| images.acquired_image(slot))
                    .ok_or_else(|| {
                        VulkanError::InvalidUse(format!(
                            "{view} targets a swap chain buffer that is not acquired"
                        ))
                    })?;
                Ok(ViewRef {
                    view: handle,
                    format: images.format,
                    extent: images.extent,
                    swapchain: Some(*swapchain),
                })
            }
            _ => Err(VulkanError::unknown("texture", entry.texture)),
        }
    }
}

/// A Vulkan graphics device.
///
/// Fences are timeline semaphores, command allocators are command pools,
/// and every submission goes to a single graphics queue. All queue access
/// happens under the state lock.
pub struct VulkanDevice {
    context: Arc<VulkanContext>,
    state: Mutex<DeviceState>,
    lost: AtomicBool,
}

impl VulkanDevice {
    /// Start building a device.
    pub fn builder() -> VulkanDeviceBuilder {
        VulkanDeviceBuilder::new()
    }

    fn from_context(context: Arc<VulkanContext>) -> VkBackendResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(context.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let setup_pool = unsafe { context.device.create_command_pool(&pool_info, None)? };

        Ok(Self {
            state: Mutex::new(DeviceState {
                next_id: 0,
                fences: HashMap::new(),
                allocators: HashMap::new(),
                lists: HashMap::new(),
                textures: HashMap::new(),
                views: HashMap::new(),
                samplers: HashMap::new(),
                swapchains: HashMap::new(),
                setup_pool,
                draw_pipeline: None,
            }),
            context,
            lost: AtomicBool::new(false),
        })
    }

    /// Create a presentable surface for `window`.
    pub fn create_output<W>(&self, window: &W) -> VkBackendResult<VulkanOutput>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        VulkanOutput::from_window(self.context.clone(), window)
    }

    /// Pipeline bound before recorded draws. Draws are skipped while unset.
    ///
    /// # Safety
    /// The pipeline must be a graphics pipeline created on this device for
    /// dynamic rendering into the engine's target formats, with dynamic
    /// viewport and scissor state, and must outlive every recording that
    /// uses it.
    pub unsafe fn set_draw_pipeline(&self, pipeline: Option<vk::Pipeline>) {
        self.state.lock().draw_pipeline = pipeline;
    }

    /// Shared Vulkan objects, for collaborators that create pipelines.
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// Convert a backend error, remembering device loss.
    fn fail(&self, err: impl Into<VulkanError>) -> GpuError {
        let err = GpuError::from(err.into());
        if err == GpuError::DeviceLost && !self.lost.swap(true, Ordering::SeqCst) {
            tracing::error!("Vulkan device lost");
        }
        err
    }

    fn fence(&self, fence: FenceId) -> Result<vk::Semaphore> {
        self.state
            .lock()
            .fences
            .get(&fence)
            .copied()
            .ok_or_else(|| VulkanError::unknown("fence", fence).into())
    }

    /// Move a new texture out of `Common` with a one-off submission.
    ///
    /// # Safety
    /// Must be called with the state lock held.
    unsafe fn initial_transition(
        &self,
        setup_pool: vk::CommandPool,
        image: vk::Image,
        format: Format,
        state: ResourceState,
    ) -> VkBackendResult<()> {
        let device = &self.context.device;
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(setup_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let cmd = unsafe { device.allocate_command_buffers(&alloc_info)? }[0];

        let src = source_scope(ResourceState::Common);
        let dst = destination_scope(state);
        let barrier = vk::ImageMemoryBarrier2::default()
            .src_stage_mask(src.stages)
            .src_access_mask(src.access)
            .dst_stage_mask(dst.stages)
            .dst_access_mask(dst.access)
            .old_layout(src.layout)
            .new_layout(dst.layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(
                vk::ImageSubresourceRange::default()
                    .aspect_mask(full_aspect_mask(format))
                    .level_count(1)
                    .layer_count(1),
            );
        let barriers = [barrier];

        let result = unsafe {
            device
                .begin_command_buffer(
                    cmd,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .and_then(|()| {
                    device.cmd_pipeline_barrier2(
                        cmd,
                        &vk::DependencyInfo::default().image_memory_barriers(&barriers),
                    );
                    device.end_command_buffer(cmd)
                })
                .and_then(|()| {
                    let buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(cmd)];
                    let submit = vk::SubmitInfo2::default().command_buffer_infos(&buffers);
                    device.queue_submit2(self.context.queue, &[submit], vk::Fence::null())
                })
                .and_then(|()| device.queue_wait_idle(self.context.queue))
        };

        unsafe { device.free_command_buffers(setup_pool, &[cmd]) };
        Ok(result?)
    }

    fn create_swapchain_images(
        &self,
        state: &mut DeviceState,
        swapchain: SwapchainId,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> Result<SwapchainImages> {
        let slots = state.slot_textures(swapchain, desc.buffer_count);
        match unsafe { SwapchainImages::new(&self.context, surface, desc, slots.clone(), old) } {
            Ok(images) => Ok(images),
            Err(err) => {
                state.forget_slot_textures(&slots);
                Err(self.fail(err))
            }
        }
    }
}

impl GpuDevice for VulkanDevice {
    type Output = VulkanOutput;

    fn info(&self) -> AdapterInfo {
        AdapterInfo {
            name: self.context.device_name.clone(),
            backend: "vulkan",
            vsync_requires_swapchain_rebuild: true,
        }
    }

    fn msaa_quality_levels(&self, format: Format, sample_count: u32) -> Result<u32> {
        let Some(flag) = sample_count_flags(sample_count) else {
            return Ok(0);
        };
        let (usage, framebuffer_counts) = if format.is_depth() {
            (
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                self.context.limits.framebuffer_depth_sample_counts,
            )
        } else {
            (
                vk::ImageUsageFlags::COLOR_ATTACHMENT,
                self.context.limits.framebuffer_color_sample_counts,
            )
        };

        let properties = unsafe {
            self.context
                .instance
                .get_physical_device_image_format_properties(
                    self.context.physical_device,
                    vk_format(format),
                    vk::ImageType::TYPE_2D,
                    vk::ImageTiling::OPTIMAL,
                    usage,
                    vk::ImageCreateFlags::empty(),
                )
        };
        match properties {
            // Vulkan has no quality tiers: a supported count has exactly one
            Ok(properties) => Ok(u32::from(
                properties.sample_counts.contains(flag) && framebuffer_counts.contains(flag),
            )),
            Err(vk::Result::ERROR_FORMAT_NOT_SUPPORTED) => Ok(0),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn status(&self) -> Result<()> {
        if self.lost.load(Ordering::SeqCst) {
            Err(GpuError::DeviceLost)
        } else {
            Ok(())
        }
    }

    fn create_fence(&self, initial_value: u64) -> Result<FenceId> {
        self.status()?;
        let mut type_info = vk::SemaphoreTypeCreateInfo::default()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut type_info);
        let semaphore = unsafe { self.context.device.create_semaphore(&create_info, None) }
            .map_err(|e| self.fail(e))?;

        let mut state = self.state.lock();
        let fence = FenceId(state.allocate_id());
        state.fences.insert(fence, semaphore);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: FenceId) {
        if let Some(semaphore) = self.state.lock().fences.remove(&fence) {
            unsafe { self.context.device.destroy_semaphore(semaphore, None) };
        }
    }

    fn fence_completed_value(&self, fence: FenceId) -> Result<u64> {
        self.status()?;
        let semaphore = self.fence(fence)?;
        unsafe { self.context.device.get_semaphore_counter_value(semaphore) }
            .map_err(|e| self.fail(e))
    }

    fn wait_fence(&self, fence: FenceId, value: u64, timeout: Option<Duration>) -> Result<bool> {
        self.status()?;
        let semaphores = [self.fence(fence)?];
        let values = [value];
        let wait_info = vk::SemaphoreWaitInfo::default()
            .semaphores(&semaphores)
            .values(&values);
        let timeout_ns = timeout.map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX));

        // The state lock is not held, so other threads can keep submitting
        match unsafe { self.context.device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(self.fail(err)),
        }
    }

    fn queue_signal(&self, fence: FenceId, value: u64) -> Result<()> {
        self.status()?;
        let state = self.state.lock();
        let semaphore = *state
            .fences
            .get(&fence)
            .ok_or_else(|| GpuError::from(VulkanError::unknown("fence", fence)))?;

        let signals = [vk::SemaphoreSubmitInfo::default()
            .semaphore(semaphore)
            .value(value)
            .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)];
        let submit = vk::SubmitInfo2::default().signal_semaphore_infos(&signals);
        unsafe {
            self.context
                .device
                .queue_submit2(self.context.queue, &[submit], vk::Fence::null())
        }
        .map_err(|e| self.fail(e))
    }

    fn create_command_allocator(&self) -> Result<CommandAllocatorId> {
        self.status()?;
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(self.context.queue_family)
            .flags(vk::CommandPoolCreateFlags::TRANSIENT);
        let pool = unsafe { self.context.device.create_command_pool(&create_info, None) }
            .map_err(|e| self.fail(e))?;

        let mut state = self.state.lock();
        let allocator = CommandAllocatorId(state.allocate_id());
        state.allocators.insert(
            allocator,
            AllocatorEntry {
                pool,
                buffers: HashMap::new(),
            },
        );
        Ok(allocator)
    }

    fn reset_command_allocator(&self, allocator: CommandAllocatorId) -> Result<()> {
        self.status()?;
        let state = self.state.lock();
        let entry = state
            .allocators
            .get(&allocator)
            .ok_or_else(|| GpuError::from(VulkanError::unknown("allocator", allocator)))?;
        unsafe {
            self.context
                .device
                .reset_command_pool(entry.pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(|e| self.fail(e))
    }

    fn destroy_command_allocator(&self, allocator: CommandAllocatorId) {
        let mut state = self.state.lock();
        if let Some(entry) = state.allocators.remove(&allocator) {
            // Frees every buffer allocated from the pool
            unsafe { self.context.device.destroy_command_pool(entry.pool, None) };
            for encoded in state.lists.values_mut() {
                if encoded.is_some_and(|e| entry.buffers.values().any(|b| *b == e.buffer)) {
                    *encoded = None;
                }
            }
        }
    }

    fn create_command_list(&self) -> Result<CommandListId> {
        self.status()?;
        let mut state = self.state.lock();
        let list = CommandListId(state.allocate_id());
        state.lists.insert(list, None);
        Ok(list)
    }

    fn destroy_command_list(&self, list: CommandListId) {
        let mut state = self.state.lock();
        state.lists.remove(&list);
        for entry in state.allocators.values_mut() {
            if let Some(buffer) = entry.buffers.remove(&list) {
                unsafe { self.context.device.free_command_buffers(entry.pool, &[buffer]) };
            }
        }
    }

    fn encode_command_list(
        &self,
        list: CommandListId,
        allocator: CommandAllocatorId,
        commands: &[GpuCommand],
    ) -> Result<()> {
        self.status()?;
        let device = &self.context.device;
        let mut state = self.state.lock();
        if !state.lists.contains_key(&list) {
            return Err(VulkanError::unknown("command list", list).into());
        }
        let pipeline = state.draw_pipeline;

        let entry = state
            .allocators
            .get_mut(&allocator)
            .ok_or_else(|| GpuError::from(VulkanError::unknown("allocator", allocator)))?;
        let buffer = if let Some(buffer) = entry.buffers.get(&list) {
            *buffer
        } else {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(entry.pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);
            let buffer = unsafe { device.allocate_command_buffers(&alloc_info) }
                .map_err(|e| self.fail(e))?[0];
            entry.buffers.insert(list, buffer);
            buffer
        };

        // The allocator reset returned the buffer to the initial state
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(buffer, &begin_info) }.map_err(|e| self.fail(e))?;

        let encoded = unsafe { encode(device, buffer, commands, &*state, pipeline) };
        let ended = unsafe { device.end_command_buffer(buffer) };
        let summary = encoded.map_err(|e| self.fail(e))?;
        ended.map_err(|e| self.fail(e))?;

        if summary.skipped_draws > 0 {
            tracing::trace!("Skipped {} draws with no pipeline bound", summary.skipped_draws);
        }
        state.lists.insert(
            list,
            Some(EncodedList {
                buffer,
                swapchain: summary.swapchain,
            }),
        );
        Ok(())
    }

    fn execute_command_list(&self, list: CommandListId) -> Result<()> {
        self.status()?;
        let mut state = self.state.lock();
        let encoded = state
            .lists
            .get_mut(&list)
            .and_then(Option::take)
            .ok_or_else(|| GpuError::invalid_state(format!("{list} has nothing encoded")))?;

        let mut waits = Vec::new();
        let mut signals = Vec::new();
        let images = match encoded.swapchain {
            Some(swapchain) => state.swapchains.get_mut(&swapchain),
            None => None,
        };
        if let Some(images) = images {
            let render_finished = &images.render_finished;
            if let Some(acquired) = images.acquired.as_mut() {
                if !acquired.consumed {
                    waits.push(
                        vk::SemaphoreSubmitInfo::default()
                            .semaphore(acquired.semaphore)
                            .stage_mask(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT),
                    );
                    acquired.consumed = true;
                }
                if !acquired.rendered {
                    if let Some(&semaphore) = render_finished.get(acquired.image_index as usize) {
                        signals.push(
                            vk::SemaphoreSubmitInfo::default()
                                .semaphore(semaphore)
                                .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS),
                        );
                        acquired.rendered = true;
                    }
                }
            }
        }

        let buffers = [vk::CommandBufferSubmitInfo::default().command_buffer(encoded.buffer)];
        let submit = vk::SubmitInfo2::default()
            .command_buffer_infos(&buffers)
            .wait_semaphore_infos(&waits)
            .signal_semaphore_infos(&signals);
        unsafe {
            self.context
                .device
                .queue_submit2(self.context.queue, &[submit], vk::Fence::null())
        }
        .map_err(|e| self.fail(e))?;
        tracing::trace!("Submitted {}", list);
        Ok(())
    }

    fn create_texture(&self, desc: &TextureDesc) -> Result<TextureId> {
        self.status()?;
        let samples = sample_count_flags(desc.samples.count).ok_or_else(|| {
            GpuError::device(format!("{} samples has no Vulkan equivalent", desc.samples.count))
        })?;
        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format(desc.format))
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_usage(desc.usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let mut state = self.state.lock();
        let image = self
            .context
            .allocator
            .lock()
            .create_image(&create_info, &desc.label)
            .map_err(|e| self.fail(e))?;

        if desc.initial_state != ResourceState::Common {
            let setup_pool = state.setup_pool;
            if let Err(err) = unsafe {
                self.initial_transition(setup_pool, image.image, desc.format, desc.initial_state)
            } {
                if let Err(free_err) = self.context.allocator.lock().free_image(image) {
                    tracing::warn!("Failed to free {}: {}", desc.label, free_err);
                }
                return Err(self.fail(err));
            }
        }

        let texture = TextureId(state.allocate_id());
        state.textures.insert(
            texture,
            TextureEntry::Owned {
                image,
                desc: desc.clone(),
            },
        );
        tracing::trace!("Created {} ({})", texture, desc.label);
        Ok(texture)
    }

    fn destroy_texture(&self, texture: TextureId) {
        let mut state = self.state.lock();
        match state.textures.remove(&texture) {
            Some(TextureEntry::Owned { image, desc }) => {
                if let Err(err) = self.context.allocator.lock().free_image(image) {
                    tracing::warn!("Failed to free {}: {}", desc.label, err);
                }
            }
            // Owned by the swap chain
            Some(entry @ TextureEntry::Swapchain(_)) => {
                state.textures.insert(texture, entry);
            }
            None => {}
        }
    }

    fn create_view(&self, texture: TextureId, kind: ViewKind) -> Result<ViewId> {
        self.status()?;
        let mut state = self.state.lock();
        let handle = match state.textures.get(&texture) {
            Some(TextureEntry::Owned { image, desc }) => {
                let view_info = vk::ImageViewCreateInfo::default()
                    .image(image.image)
                    .view_type(vk::ImageViewType::TYPE_2D)
                    .format(vk_format(desc.format))
                    .components(vk::ComponentMapping::default())
                    .subresource_range(
                        vk::ImageSubresourceRange::default()
                            .aspect_mask(aspect_mask(desc.format, kind))
                            .level_count(1)
                            .layer_count(1),
                    );
                Some(
                    unsafe { self.context.device.create_image_view(&view_info, None) }
                        .map_err(|e| self.fail(e))?,
                )
            }
            Some(TextureEntry::Swapchain(_)) => None,
            None => return Err(VulkanError::unknown("texture", texture).into()),
        };

        let view = ViewId(state.allocate_id());
        state.views.insert(
            view,
            ViewEntry {
                texture,
                view: handle,
            },
        );
        Ok(view)
    }

    fn destroy_view(&self, view: ViewId) {
        if let Some(ViewEntry {
            view: Some(handle), ..
        }) = self.state.lock().views.remove(&view)
        {
            unsafe { self.context.device.destroy_image_view(handle, None) };
        }
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<SamplerId> {
        self.status()?;
        let create_info = sampler_create_info(
            desc,
            self.context.sampler_anisotropy,
            self.context.limits.max_sampler_anisotropy,
        );
        let handle = unsafe { self.context.device.create_sampler(&create_info, None) }
            .map_err(|e| self.fail(e))?;

        let mut state = self.state.lock();
        let sampler = SamplerId(state.allocate_id());
        state.samplers.insert(sampler, handle);
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: SamplerId) {
        if let Some(handle) = self.state.lock().samplers.remove(&sampler) {
            unsafe { self.context.device.destroy_sampler(handle, None) };
        }
    }

    fn create_swapchain(&self, output: &VulkanOutput, desc: &SwapchainDesc) -> Result<SwapchainId> {
        self.status()?;
        let mut state = self.state.lock();
        let swapchain = SwapchainId(state.allocate_id());
        let images = self.create_swapchain_images(
            &mut state,
            swapchain,
            output.surface,
            desc,
            vk::SwapchainKHR::null(),
        )?;
        tracing::info!(
            "Created {} at {}x{} ({} slots over {} images)",
            swapchain,
            images.extent.width,
            images.extent.height,
            desc.buffer_count,
            images.images.len()
        );
        state.swapchains.insert(swapchain, images);
        Ok(swapchain)
    }

    fn resize_swapchain(&self, swapchain: SwapchainId, desc: &SwapchainDesc) -> Result<()> {
        self.status()?;
        let mut state = self.state.lock();
        let mut old = state
            .swapchains
            .remove(&swapchain)
            .ok_or_else(|| GpuError::from(VulkanError::unknown("swapchain", swapchain)))?;

        match self.create_swapchain_images(&mut state, swapchain, old.surface, desc, old.handle) {
            Ok(images) => {
                state.forget_slot_textures(&old.slots);
                unsafe { old.destroy(&self.context) };
                state.swapchains.insert(swapchain, images);
                Ok(())
            }
            Err(err) => {
                state.swapchains.insert(swapchain, old);
                Err(err)
            }
        }
    }

    fn destroy_swapchain(&self, swapchain: SwapchainId) {
        let mut state = self.state.lock();
        if let Some(mut images) = state.swapchains.remove(&swapchain) {
            state.forget_slot_textures(&images.slots);
            unsafe { images.destroy(&self.context) };
        }
    }

    fn swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<TextureId> {
        let state = self.state.lock();
        state
            .swapchains
            .get(&swapchain)
            .and_then(|images| images.slots.get(index as usize).copied())
            .ok_or_else(|| GpuError::device(format!("{swapchain} has no buffer {index}")))
    }

    fn acquire_swapchain_buffer(&self, swapchain: SwapchainId, index: u32) -> Result<()> {
        self.status()?;
        let mut state = self.state.lock();
        let images = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GpuError::from(VulkanError::unknown("swapchain", swapchain)))?;

        match images.acquired {
            // A frame abandoned after acquiring keeps its image
            Some(acquired) if acquired.slot == index => return Ok(()),
            Some(acquired) => {
                return Err(GpuError::invalid_state(format!(
                    "{swapchain} buffer {} is still acquired",
                    acquired.slot
                )))
            }
            None => {}
        }

        let semaphore = images.next_acquire_semaphore();
        let (image_index, suboptimal) = unsafe {
            self.context.swapchain_loader.acquire_next_image(
                images.handle,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        }
        .map_err(|e| self.fail(e))?;
        if suboptimal {
            tracing::debug!("{} is suboptimal for its surface", swapchain);
        }

        images.acquired = Some(Acquired {
            slot: index,
            image_index,
            semaphore,
            consumed: false,
            rendered: false,
        });
        Ok(())
    }

    fn present(&self, swapchain: SwapchainId, sync_interval: u32) -> Result<()> {
        self.status()?;
        let mut state = self.state.lock();
        let images = state
            .swapchains
            .get_mut(&swapchain)
            .ok_or_else(|| GpuError::from(VulkanError::unknown("swapchain", swapchain)))?;
        let acquired = images
            .acquired
            .take()
            .ok_or_else(|| GpuError::invalid_state(format!("{swapchain} has no acquired buffer")))?;

        let wait = if acquired.rendered {
            images.render_finished.get(acquired.image_index as usize).copied()
        } else if acquired.consumed {
            None
        } else {
            Some(acquired.semaphore)
        };
        let waits: Vec<_> = wait.into_iter().collect();
        let swapchains = [images.handle];
        let image_indices = [acquired.image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&waits)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        // The present mode is fixed at creation, so the interval is informational
        match unsafe {
            self.context
                .swapchain_loader
                .queue_present(self.context.queue, &present_info)
        } {
            Ok(false) => {}
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                tracing::debug!("{} no longer matches its surface", swapchain);
            }
            Err(err) => return Err(self.fail(err)),
        }
        tracing::trace!(
            "Presented {} buffer {} (interval {})",
            swapchain,
            acquired.slot,
            sync_interval
        );
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe {
            let _ = device.device_wait_idle();
        }

        let state = self.state.get_mut();
        for (_, view) in state.views.drain() {
            if let Some(handle) = view.view {
                unsafe { device.destroy_image_view(handle, None) };
            }
        }
        for (_, sampler) in state.samplers.drain() {
            unsafe { device.destroy_sampler(sampler, None) };
        }
        for (_, texture) in state.textures.drain() {
            if let TextureEntry::Owned { image, desc } = texture {
                if let Err(err) = self.context.allocator.lock().free_image(image) {
                    tracing::warn!("Failed to free {}: {}", desc.label, err);
                }
            }
        }
        for (_, mut images) in state.swapchains.drain() {
            unsafe { images.destroy(&self.context) };
        }
        for (_, entry) in state.allocators.drain() {
            unsafe { device.destroy_command_pool(entry.pool, None) };
        }
        for (_, semaphore) in state.fences.drain() {
            unsafe { device.destroy_semaphore(semaphore, None) };
        }
        unsafe { device.destroy_command_pool(state.setup_pool, None) };
    }
}
