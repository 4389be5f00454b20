//! Encoding recorded [`GpuCommand`]s into a Vulkan command buffer.

use crate::convert::{destination_scope, full_aspect_mask, source_scope};
use crate::error::{Result, VulkanError};
use ash::vk;
use cadence_core::Format;
use cadence_gpu::{GpuCommand, ResourceState, ScissorRect, SwapchainId, TextureId, ViewId, Viewport};

/// An image resolved for encoding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ImageRef {
    pub image: vk::Image,
    pub format: Format,
    pub extent: vk::Extent2D,
    pub swapchain: Option<SwapchainId>,
}

/// A view resolved for encoding.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ViewRef {
    pub view: vk::ImageView,
    pub format: Format,
    pub extent: vk::Extent2D,
    pub swapchain: Option<SwapchainId>,
}

/// Lookup of live resources by engine handle.
pub(crate) trait ResourceLookup {
    /// `None` for a swap chain buffer that is not currently acquired.
    fn image(&self, texture: TextureId) -> Result<Option<ImageRef>>;
    fn view(&self, view: ViewId) -> Result<ViewRef>;
}

/// What encoding learned about the recording.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct EncodeSummary {
    /// Swap chain whose acquired image the recording touches.
    pub swapchain: Option<SwapchainId>,
    /// Draws dropped because no pipeline was bound.
    pub skipped_draws: u32,
}

struct Encoder<'a, L> {
    device: &'a ash::Device,
    cmd: vk::CommandBuffer,
    resources: &'a L,
    pipeline: Option<vk::Pipeline>,
    barriers: Vec<vk::ImageMemoryBarrier2<'static>>,
    color: Option<ViewRef>,
    depth: Option<ViewRef>,
    viewport: Option<vk::Viewport>,
    scissor: Option<vk::Rect2D>,
    rendering: bool,
    summary: EncodeSummary,
}

/// Encode `commands` into `cmd`, which must be in the recording state.
///
/// Transitions are batched into one barrier until the next non-transition
/// command. Transitions of swap chain buffers that are not acquired are
/// dropped, since the presentation engine owns those images.
///
/// # Safety
/// `cmd` must be recording and every resource `resources` returns must be alive.
pub(crate) unsafe fn encode<L: ResourceLookup>(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    commands: &[GpuCommand],
    resources: &L,
    pipeline: Option<vk::Pipeline>,
) -> Result<EncodeSummary> {
    let mut encoder = Encoder {
        device,
        cmd,
        resources,
        pipeline,
        barriers: Vec::new(),
        color: None,
        depth: None,
        viewport: None,
        scissor: None,
        rendering: false,
        summary: EncodeSummary::default(),
    };

    for command in commands {
        unsafe { encoder.command(command)? };
    }
    unsafe {
        encoder.end_rendering();
        encoder.flush_barriers();
    }
    Ok(encoder.summary)
}

impl<L: ResourceLookup> Encoder<'_, L> {
    unsafe fn command(&mut self, command: &GpuCommand) -> Result<()> {
        if let GpuCommand::Transition {
            texture,
            before,
            after,
        } = *command
        {
            return self.transition(texture, before, after);
        }

        unsafe { self.flush_barriers() };

        match *command {
            GpuCommand::Transition { .. } => {}
            GpuCommand::ClearRenderTarget { view, color } => {
                let view = self.view(view)?;
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(view.view)
                    .image_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        color: vk::ClearColorValue { float32: color },
                    });
                unsafe {
                    self.end_rendering();
                    self.clear_pass(view.extent, Some(attachment), None, false);
                }
            }
            GpuCommand::ClearDepthStencil {
                view,
                depth,
                stencil,
            } => {
                let view = self.view(view)?;
                let attachment = vk::RenderingAttachmentInfo::default()
                    .image_view(view.view)
                    .image_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
                    .load_op(vk::AttachmentLoadOp::CLEAR)
                    .store_op(vk::AttachmentStoreOp::STORE)
                    .clear_value(vk::ClearValue {
                        depth_stencil: vk::ClearDepthStencilValue {
                            depth,
                            stencil: u32::from(stencil),
                        },
                    });
                unsafe {
                    self.end_rendering();
                    self.clear_pass(view.extent, None, Some(attachment), view.format.has_stencil());
                }
            }
            GpuCommand::SetRenderTargets { color, depth } => {
                unsafe { self.end_rendering() };
                self.color = color.map(|view| self.view(view)).transpose()?;
                self.depth = depth.map(|view| self.view(view)).transpose()?;
            }
            GpuCommand::SetViewport(viewport) => {
                let viewport = vk_viewport(&viewport);
                self.viewport = Some(viewport);
                if self.rendering {
                    unsafe { self.device.cmd_set_viewport(self.cmd, 0, &[viewport]) };
                }
            }
            GpuCommand::SetScissor(rect) => {
                let scissor = vk_scissor(&rect);
                self.scissor = Some(scissor);
                if self.rendering {
                    unsafe { self.device.cmd_set_scissor(self.cmd, 0, &[scissor]) };
                }
            }
            GpuCommand::Draw {
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            } => {
                let Some(pipeline) = self.pipeline else {
                    self.summary.skipped_draws += 1;
                    return Ok(());
                };
                unsafe {
                    self.begin_rendering(pipeline)?;
                    self.device.cmd_draw(
                        self.cmd,
                        vertex_count,
                        instance_count,
                        first_vertex,
                        first_instance,
                    );
                }
            }
            GpuCommand::Resolve {
                source,
                destination,
                ..
            } => {
                let source = self.acquired_image(source)?;
                let destination = self.acquired_image(destination)?;
                let layers = vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .mip_level(0)
                    .base_array_layer(0)
                    .layer_count(1);
                let region = vk::ImageResolve::default()
                    .src_subresource(layers)
                    .dst_subresource(layers)
                    .extent(vk::Extent3D {
                        width: source.extent.width.min(destination.extent.width),
                        height: source.extent.height.min(destination.extent.height),
                        depth: 1,
                    });
                unsafe {
                    self.end_rendering();
                    self.device.cmd_resolve_image(
                        self.cmd,
                        source.image,
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        destination.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
            }
        }
        Ok(())
    }

    fn transition(
        &mut self,
        texture: TextureId,
        before: ResourceState,
        after: ResourceState,
    ) -> Result<()> {
        let Some(image) = self.resources.image(texture)? else {
            return Ok(());
        };
        self.note(image.swapchain);

        let mut src = source_scope(before);
        // A freshly acquired image may never have been presented
        if image.swapchain.is_some() && before == ResourceState::Present {
            src.layout = vk::ImageLayout::UNDEFINED;
        }
        let dst = destination_scope(after);

        let range = vk::ImageSubresourceRange::default()
            .aspect_mask(full_aspect_mask(image.format))
            .base_mip_level(0)
            .level_count(1)
            .base_array_layer(0)
            .layer_count(1);
        self.barriers.push(
            vk::ImageMemoryBarrier2::default()
                .src_stage_mask(src.stages)
                .src_access_mask(src.access)
                .dst_stage_mask(dst.stages)
                .dst_access_mask(dst.access)
                .old_layout(src.layout)
                .new_layout(dst.layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(image.image)
                .subresource_range(range),
        );
        Ok(())
    }

    unsafe fn flush_barriers(&mut self) {
        if self.barriers.is_empty() {
            return;
        }
        unsafe { self.end_rendering() };
        let dependency = vk::DependencyInfo::default().image_memory_barriers(&self.barriers);
        unsafe { self.device.cmd_pipeline_barrier2(self.cmd, &dependency) };
        self.barriers.clear();
    }

    unsafe fn clear_pass(
        &self,
        extent: vk::Extent2D,
        color: Option<vk::RenderingAttachmentInfo<'_>>,
        depth: Option<vk::RenderingAttachmentInfo<'_>>,
        stencil: bool,
    ) {
        let colors: Vec<_> = color.into_iter().collect();
        let mut info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
            if stencil {
                info = info.stencil_attachment(depth);
            }
        }
        unsafe {
            self.device.cmd_begin_rendering(self.cmd, &info);
            self.device.cmd_end_rendering(self.cmd);
        }
    }

    unsafe fn begin_rendering(&mut self, pipeline: vk::Pipeline) -> Result<()> {
        if self.rendering {
            return Ok(());
        }
        let extent = self
            .color
            .or(self.depth)
            .map(|view| view.extent)
            .ok_or_else(|| VulkanError::InvalidUse("draw with no render targets bound".into()))?;

        let load = |view: &ViewRef| {
            vk::RenderingAttachmentInfo::default()
                .image_view(view.view)
                .image_layout(vk::ImageLayout::ATTACHMENT_OPTIMAL)
                .load_op(vk::AttachmentLoadOp::LOAD)
                .store_op(vk::AttachmentStoreOp::STORE)
        };
        let colors: Vec<_> = self.color.iter().map(load).collect();
        let depth = self.depth.as_ref().map(load);

        let mut info = vk::RenderingInfo::default()
            .render_area(self.scissor.unwrap_or(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            }))
            .layer_count(1)
            .color_attachments(&colors);
        if let Some(depth) = depth.as_ref() {
            info = info.depth_attachment(depth);
            if self.depth.is_some_and(|view| view.format.has_stencil()) {
                info = info.stencil_attachment(depth);
            }
        }

        unsafe {
            self.device.cmd_begin_rendering(self.cmd, &info);
            self.device
                .cmd_bind_pipeline(self.cmd, vk::PipelineBindPoint::GRAPHICS, pipeline);
            if let Some(viewport) = self.viewport {
                self.device.cmd_set_viewport(self.cmd, 0, &[viewport]);
            }
            if let Some(scissor) = self.scissor {
                self.device.cmd_set_scissor(self.cmd, 0, &[scissor]);
            }
        }
        self.rendering = true;
        Ok(())
    }

    unsafe fn end_rendering(&mut self) {
        if self.rendering {
            unsafe { self.device.cmd_end_rendering(self.cmd) };
            self.rendering = false;
        }
    }

    fn view(&mut self, view: ViewId) -> Result<ViewRef> {
        let resolved = self.resources.view(view)?;
        self.note(resolved.swapchain);
        Ok(resolved)
    }

    fn acquired_image(&mut self, texture: TextureId) -> Result<ImageRef> {
        let image = self.resources.image(texture)?.ok_or_else(|| {
            VulkanError::InvalidUse(format!("{texture} is a swap chain buffer that is not acquired"))
        })?;
        self.note(image.swapchain);
        Ok(image)
    }

    fn note(&mut self, swapchain: Option<SwapchainId>) {
        if swapchain.is_some() {
            self.summary.swapchain = swapchain;
        }
    }
}

pub(crate) const fn vk_viewport(viewport: &Viewport) -> vk::Viewport {
    vk::Viewport {
        x: viewport.x,
        y: viewport.y,
        width: viewport.width,
        height: viewport.height,
        min_depth: viewport.min_depth,
        max_depth: viewport.max_depth,
    }
}

#[allow(clippy::cast_possible_wrap)]
pub(crate) const fn vk_scissor(rect: &ScissorRect) -> vk::Rect2D {
    vk::Rect2D {
        offset: vk::Offset2D {
            x: rect.left as i32,
            y: rect.top as i32,
        },
        extent: vk::Extent2D {
            width: rect.right.saturating_sub(rect.left),
            height: rect.bottom.saturating_sub(rect.top),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scissor_is_right_bottom_exclusive() {
        let rect = vk_scissor(&ScissorRect {
            left: 10,
            top: 20,
            right: 110,
            bottom: 70,
        });
        assert_eq!((rect.offset.x, rect.offset.y), (10, 20));
        assert_eq!((rect.extent.width, rect.extent.height), (100, 50));
    }

    #[test]
    fn inverted_scissor_collapses_to_empty() {
        let rect = vk_scissor(&ScissorRect {
            left: 50,
            top: 50,
            right: 10,
            bottom: 10,
        });
        assert_eq!((rect.extent.width, rect.extent.height), (0, 0));
    }

    #[test]
    fn full_viewport_keeps_depth_range() {
        let viewport = vk_viewport(&Viewport::full(1920, 1080));
        assert!((viewport.width - 1920.0).abs() < f32::EPSILON);
        assert!((viewport.max_depth - 1.0).abs() < f32::EPSILON);
    }
}
