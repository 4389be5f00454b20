//! Surfaces and swap chains.

use crate::context::VulkanContext;
use crate::convert::{format_from_vk, vk_format};
use crate::error::{Result, VulkanError};
use ash::vk;
use cadence_core::Format;
use cadence_gpu::{SwapchainDesc, TextureId};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

/// A window surface the device can present to.
pub struct VulkanOutput {
    pub(crate) surface: vk::SurfaceKHR,
    context: Arc<VulkanContext>,
}

impl VulkanOutput {
    pub(crate) fn from_window<W>(context: Arc<VulkanContext>, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| VulkanError::SurfaceCreation(format!("Failed to get display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| VulkanError::SurfaceCreation(format!("Failed to get window handle: {e}")))?;

        // SAFETY: the handles come from a live window and the instance outlives the surface.
        let surface = unsafe {
            ash_window::create_surface(
                &context.entry,
                &context.instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| VulkanError::SurfaceCreation(e.to_string()))?;

        let supported = unsafe {
            context.surface_loader.get_physical_device_surface_support(
                context.physical_device,
                context.queue_family,
                surface,
            )
        };
        if supported != Ok(true) {
            unsafe { context.surface_loader.destroy_surface(surface, None) };
            return Err(VulkanError::SurfaceCreation(
                "graphics queue cannot present to this surface".to_string(),
            ));
        }

        Ok(Self { surface, context })
    }
}

impl Drop for VulkanOutput {
    fn drop(&mut self) {
        unsafe { self.context.surface_loader.destroy_surface(self.surface, None) };
    }
}

/// An acquired image waiting to be presented.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Acquired {
    pub slot: u32,
    pub image_index: u32,
    pub semaphore: vk::Semaphore,
    /// Whether a submission has already waited on `semaphore`.
    pub consumed: bool,
    /// Whether `render_finished[image_index]` has been signalled.
    pub rendered: bool,
}

/// Swap chain images plus the logical slots the engine rotates through.
///
/// The driver picks which image each acquire returns, so slots are bound to
/// images only between acquire and present.
pub(crate) struct SwapchainImages {
    pub handle: vk::SwapchainKHR,
    pub surface: vk::SurfaceKHR,
    pub format: Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub slots: Vec<TextureId>,
    pub acquire_semaphores: Vec<vk::Semaphore>,
    pub next_acquire: usize,
    pub render_finished: Vec<vk::Semaphore>,
    pub acquired: Option<Acquired>,
}

impl SwapchainImages {
    /// Create a swap chain for `surface`, retiring `old` if given.
    ///
    /// # Safety
    /// The surface must belong to the context's instance and `old` must not be in use.
    pub unsafe fn new(
        context: &VulkanContext,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        slots: Vec<TextureId>,
        old: vk::SwapchainKHR,
    ) -> Result<Self> {
        let loader = &context.surface_loader;
        let physical = context.physical_device;
        let (capabilities, formats, present_modes) = unsafe {
            (
                loader.get_physical_device_surface_capabilities(physical, surface)?,
                loader.get_physical_device_surface_formats(physical, surface)?,
                loader.get_physical_device_surface_present_modes(physical, surface)?,
            )
        };

        let surface_format = select_surface_format(&formats, desc.format)
            .ok_or_else(|| VulkanError::SurfaceCreation("surface reports no formats".to_string()))?;
        let format = format_from_vk(surface_format.format).ok_or_else(|| {
            VulkanError::UnsupportedFormat(format!("{:?}", surface_format.format))
        })?;
        if format != desc.format {
            tracing::warn!(
                "Surface does not support {:?}, presenting as {:?}",
                desc.format,
                format
            );
        }
        let present_mode = select_present_mode(&present_modes, desc.vsync);
        let extent = calculate_extent(&capabilities, desc.width, desc.height);

        let queue_families = [context.queue_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count(&capabilities, desc.buffer_count))
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .queue_family_indices(&queue_families)
            .pre_transform(capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain_loader = &context.swapchain_loader;
        let handle = unsafe { swapchain_loader.create_swapchain(&create_info, None)? };

        let mut created = Self {
            handle,
            surface,
            format,
            extent,
            images: Vec::new(),
            image_views: Vec::new(),
            slots,
            acquire_semaphores: Vec::new(),
            next_acquire: 0,
            render_finished: Vec::new(),
            acquired: None,
        };
        if let Err(err) = unsafe { created.create_image_objects(context, surface_format.format) } {
            unsafe { created.destroy(context) };
            return Err(err);
        }

        tracing::debug!(
            "Swapchain {}x{} with {} images, {:?}",
            extent.width,
            extent.height,
            created.images.len(),
            present_mode
        );
        Ok(created)
    }

    unsafe fn create_image_objects(&mut self, context: &VulkanContext, format: vk::Format) -> Result<()> {
        let device = &context.device;
        self.images = unsafe { context.swapchain_loader.get_swapchain_images(self.handle)? };

        for &image in &self.images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(format)
                .components(vk::ComponentMapping::default())
                .subresource_range(color_subresource_range());
            self.image_views
                .push(unsafe { device.create_image_view(&view_info, None)? });
            self.render_finished.push(unsafe { create_semaphore(device)? });
        }

        // One spare so an acquire never reuses a semaphore still being waited on
        for _ in 0..=self.images.len() {
            self.acquire_semaphores
                .push(unsafe { create_semaphore(device)? });
        }
        Ok(())
    }

    /// Destroy the swap chain and its views and semaphores.
    ///
    /// # Safety
    /// No submitted work may still reference the images or semaphores.
    pub unsafe fn destroy(&mut self, context: &VulkanContext) {
        let device = &context.device;
        unsafe {
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view, None);
            }
            for semaphore in self
                .render_finished
                .drain(..)
                .chain(self.acquire_semaphores.drain(..))
            {
                device.destroy_semaphore(semaphore, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                context.swapchain_loader.destroy_swapchain(self.handle, None);
                self.handle = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
        self.acquired = None;
    }

    /// Logical slot index of `texture`, if it is one of ours.
    pub fn slot_of(&self, texture: TextureId) -> Option<u32> {
        self.slots
            .iter()
            .position(|slot| *slot == texture)
            .and_then(|index| u32::try_from(index).ok())
    }

    /// Image bound to `slot`, if that slot is the one currently acquired.
    pub fn acquired_image(&self, slot: u32) -> Option<(vk::Image, vk::ImageView)> {
        let acquired = self.acquired.filter(|a| a.slot == slot)?;
        let index = acquired.image_index as usize;
        Some((*self.images.get(index)?, *self.image_views.get(index)?))
    }

    pub fn next_acquire_semaphore(&mut self) -> vk::Semaphore {
        let semaphore = self.acquire_semaphores[self.next_acquire % self.acquire_semaphores.len()];
        self.next_acquire = (self.next_acquire + 1) % self.acquire_semaphores.len();
        semaphore
    }
}

/// Create a binary semaphore.
///
/// # Safety
/// The device must be valid.
pub(crate) unsafe fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore> {
    let create_info = vk::SemaphoreCreateInfo::default();
    Ok(unsafe { device.create_semaphore(&create_info, None)? })
}

pub(crate) fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

/// Pick the surface format matching `requested`, falling back to sRGB BGRA
/// and then to whatever the surface lists first.
pub fn select_surface_format(
    available: &[vk::SurfaceFormatKHR],
    requested: Format,
) -> Option<vk::SurfaceFormatKHR> {
    let requested = vk_format(requested);
    let srgb = |format: &&vk::SurfaceFormatKHR| format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;

    available
        .iter()
        .filter(srgb)
        .find(|format| format.format == requested)
        .or_else(|| {
            available
                .iter()
                .filter(srgb)
                .find(|format| format.format == vk::Format::B8G8R8A8_SRGB)
        })
        .or_else(|| available.first())
        .copied()
}

/// Select the best present mode.
pub fn select_present_mode(available: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| available.contains(mode))
        // FIFO is always supported
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Calculate swapchain extent.
pub fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// Image count to request for `buffer_count` logical slots.
pub fn image_count(capabilities: &vk::SurfaceCapabilitiesKHR, buffer_count: u32) -> u32 {
    let count = buffer_count.max(capabilities.min_image_count);
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn requested_format_wins_when_listed() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_SRGB),
            surface_format(vk::Format::R8G8B8A8_UNORM),
        ];
        let picked = select_surface_format(&available, Format::Rgba8Unorm).unwrap();
        assert_eq!(picked.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn unlisted_format_falls_back_to_srgb_bgra() {
        let available = [
            surface_format(vk::Format::B8G8R8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_SRGB),
        ];
        let picked = select_surface_format(&available, Format::Rgba16Float).unwrap();
        assert_eq!(picked.format, vk::Format::B8G8R8A8_SRGB);
        assert!(select_surface_format(&[], Format::Rgba8Unorm).is_none());
    }

    #[test]
    fn vsync_always_uses_fifo() {
        let modes = [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::FIFO];
        assert_eq!(select_present_mode(&modes, true), vk::PresentModeKHR::FIFO);
        assert_eq!(select_present_mode(&modes, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            select_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn fixed_extent_overrides_request() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            ..Default::default()
        };
        assert_eq!(
            calculate_extent(&capabilities, 1920, 1080),
            vk::Extent2D {
                width: 800,
                height: 600
            }
        );
    }

    #[test]
    fn free_extent_is_clamped() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let extent = calculate_extent(&capabilities, 4096, 300);
        assert_eq!((extent.width, extent.height), (1024, 300));
    }

    #[test]
    fn image_count_respects_surface_limits() {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 3,
            max_image_count: 4,
            ..Default::default()
        };
        assert_eq!(image_count(&capabilities, 2), 3);
        assert_eq!(image_count(&capabilities, 8), 4);

        let unbounded = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            ..Default::default()
        };
        assert_eq!(image_count(&unbounded, 6), 6);
    }
}
