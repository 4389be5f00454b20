//! Presentation surface.

use std::sync::Arc;

use cadence_core::limits::{MAX_BUFFER_COUNT, MAX_TEXTURE_DIMENSION};
use cadence_core::ConfigError;
use tracing::{debug, info};

use crate::device::{GpuDevice, SwapchainDesc, SwapchainId, TextureId, ViewId, ViewKind};
use crate::error::{GpuError, Result};
use crate::sync::FenceSynchronizer;

/// One presentable buffer and its render target view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSlot {
    pub index: u32,
    pub texture: TextureId,
    pub view: ViewId,
}

/// Rotating set of presentable buffers bound to an output.
///
/// Exactly one slot is current. [`present_current`](Self::present_current)
/// advances to the next slot after a successful present; nothing else does
/// unless the caller uses [`advance`](Self::advance) directly.
pub struct PresentationSurface<D: GpuDevice> {
    device: Arc<D>,
    swapchain: Option<SwapchainId>,
    slots: Vec<BufferSlot>,
    current: u32,
    desc: Option<SwapchainDesc>,
}

impl<D: GpuDevice> PresentationSurface<D> {
    /// An empty surface. Nothing is allocated until
    /// [`create_or_resize`](Self::create_or_resize).
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            swapchain: None,
            slots: Vec::new(),
            current: 0,
            desc: None,
        }
    }

    /// Check a swap chain description without touching the device.
    pub fn validate_desc(desc: &SwapchainDesc) -> Result<()> {
        if desc.buffer_count < 2 || desc.buffer_count > MAX_BUFFER_COUNT {
            return Err(ConfigError::BufferCount {
                count: desc.buffer_count,
                max: MAX_BUFFER_COUNT,
            }
            .into());
        }
        if desc.width == 0
            || desc.height == 0
            || desc.width > MAX_TEXTURE_DIMENSION
            || desc.height > MAX_TEXTURE_DIMENSION
        {
            return Err(ConfigError::InvalidDimensions {
                width: desc.width,
                height: desc.height,
            }
            .into());
        }
        if !desc.format.is_presentable() {
            return Err(ConfigError::InvalidFormat {
                format: desc.format,
                role: "back buffer",
            }
            .into());
        }
        Ok(())
    }

    /// Allocate `desc.buffer_count` slots, replacing any existing ones.
    ///
    /// Every submission must have retired; the caller drains the fence
    /// first. The current index is reset to 0.
    pub fn create_or_resize(
        &mut self,
        output: &D::Output,
        desc: SwapchainDesc,
        fence: &FenceSynchronizer<D>,
    ) -> Result<()> {
        Self::validate_desc(&desc)?;
        if !fence.is_drained()? {
            return Err(GpuError::invalid_state(
                "presentation surface resized while GPU work is in flight",
            ));
        }

        self.release_views();
        let swapchain = match self.swapchain {
            Some(swapchain) => {
                self.device.resize_swapchain(swapchain, &desc)?;
                swapchain
            }
            None => {
                let swapchain = self.device.create_swapchain(output, &desc)?;
                self.swapchain = Some(swapchain);
                swapchain
            }
        };

        for index in 0..desc.buffer_count {
            let texture = self.device.swapchain_buffer(swapchain, index)?;
            let view = self.device.create_view(texture, ViewKind::RenderTarget)?;
            self.slots.push(BufferSlot {
                index,
                texture,
                view,
            });
        }
        self.current = 0;
        self.desc = Some(desc);

        info!(
            width = desc.width,
            height = desc.height,
            buffer_count = desc.buffer_count,
            format = ?desc.format,
            "Presentation surface ready"
        );
        Ok(())
    }

    /// Slot the next frame renders into.
    pub fn current_slot(&self) -> Result<BufferSlot> {
        self.slots
            .get(self.current as usize)
            .copied()
            .ok_or_else(|| GpuError::invalid_state("presentation surface has no buffers"))
    }

    pub const fn current_index(&self) -> u32 {
        self.current
    }

    /// Move to the next slot. Called once per presented frame.
    pub fn advance(&mut self) {
        if let Some(desc) = self.desc {
            self.current = (self.current + 1) % desc.buffer_count;
        }
    }

    /// Tell the backend which slot this frame renders to.
    pub fn acquire_current(&self) -> Result<BufferSlot> {
        let swapchain = self.require_swapchain()?;
        self.device
            .acquire_swapchain_buffer(swapchain, self.current)?;
        self.current_slot()
    }

    /// Present the current slot and advance on success.
    pub fn present_current(&mut self, sync_interval: u32) -> Result<()> {
        let swapchain = self.require_swapchain()?;
        self.device.present(swapchain, sync_interval)?;
        self.advance();
        Ok(())
    }

    /// Release every slot and the swap chain. Requires a drained fence.
    pub fn destroy(&mut self, fence: &FenceSynchronizer<D>) -> Result<()> {
        if !fence.is_drained()? {
            return Err(GpuError::invalid_state(
                "presentation surface destroyed while GPU work is in flight",
            ));
        }
        self.release();
        Ok(())
    }

    pub fn buffer_count(&self) -> u32 {
        self.desc.map_or(0, |desc| desc.buffer_count)
    }

    pub const fn desc(&self) -> Option<SwapchainDesc> {
        self.desc
    }

    pub fn slots(&self) -> &[BufferSlot] {
        &self.slots
    }

    fn require_swapchain(&self) -> Result<SwapchainId> {
        self.swapchain
            .ok_or_else(|| GpuError::invalid_state("presentation surface not created"))
    }

    fn release_views(&mut self) {
        for slot in self.slots.drain(..) {
            self.device.destroy_view(slot.view);
        }
    }

    fn release(&mut self) {
        self.release_views();
        if let Some(swapchain) = self.swapchain.take() {
            self.device.destroy_swapchain(swapchain);
            debug!("Presentation surface destroyed");
        }
        self.desc = None;
        self.current = 0;
    }
}

impl<D: GpuDevice> Drop for PresentationSurface<D> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ResourceState;
    use crate::headless::{DeviceEvent, HeadlessDevice};
    use crate::CommandChannel;
    use cadence_core::{Format, WindowMode};

    fn desc(width: u32, height: u32, buffer_count: u32) -> SwapchainDesc {
        SwapchainDesc {
            width,
            height,
            format: Format::Rgba8Unorm,
            buffer_count,
            refresh_rate: 60,
            mode: WindowMode::Windowed,
            vsync: false,
        }
    }

    fn setup() -> (Arc<HeadlessDevice>, FenceSynchronizer<HeadlessDevice>) {
        let device = Arc::new(HeadlessDevice::new().unwrap());
        let fence = FenceSynchronizer::new(device.clone(), None).unwrap();
        (device, fence)
    }

    #[test]
    fn advance_cycles_through_slots() {
        let (device, fence) = setup();
        let mut surface = PresentationSurface::new(device);
        surface.create_or_resize(&(), desc(64, 64, 2), &fence).unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(surface.current_index());
            assert!(surface.current_index() < surface.buffer_count());
            surface.advance();
        }
        assert_eq!(seen, vec![0, 1, 0, 1, 0]);
        assert_eq!(surface.current_slot().unwrap().index, 1);
    }

    #[test]
    fn single_buffer_is_rejected_before_device_calls() {
        let (device, fence) = setup();
        let mut surface = PresentationSurface::new(device.clone());
        assert!(matches!(
            surface.create_or_resize(&(), desc(64, 64, 1), &fence),
            Err(GpuError::Configuration(ConfigError::BufferCount { count: 1, .. }))
        ));
        assert!(device.events().is_empty());
        assert!(surface.current_slot().is_err());
    }

    #[test]
    fn resize_resets_index_and_reallocates() {
        let (device, fence) = setup();
        let mut surface = PresentationSurface::new(device.clone());
        surface.create_or_resize(&(), desc(64, 64, 2), &fence).unwrap();
        surface.advance();
        let old = surface.current_slot().unwrap();

        surface.create_or_resize(&(), desc(128, 96, 3), &fence).unwrap();
        assert_eq!(surface.current_index(), 0);
        assert_eq!(surface.buffer_count(), 3);
        let slot = surface.current_slot().unwrap();
        assert_ne!(slot.texture, old.texture);
        assert_eq!(device.texture_desc(slot.texture).unwrap().width, 128);
        assert!(device.texture_desc(old.texture).is_none());
        assert!(device
            .events()
            .iter()
            .any(|e| matches!(e, DeviceEvent::SwapchainResized { width: 128, .. })));
        assert!(device.violations().is_empty());
    }

    #[test]
    fn resize_refuses_unretired_work() {
        let (device, mut fence) = setup();
        let mut surface = PresentationSurface::new(device.clone());
        surface.create_or_resize(&(), desc(64, 64, 2), &fence).unwrap();

        device.pause();
        fence.signal().unwrap();
        assert!(matches!(
            surface.create_or_resize(&(), desc(32, 32, 2), &fence),
            Err(GpuError::InvalidState(_))
        ));
        // Slots are untouched.
        assert_eq!(surface.slots().len(), 2);
        device.resume();
        fence.wait_for_value(fence.last_signalled()).unwrap();
        surface.create_or_resize(&(), desc(32, 32, 2), &fence).unwrap();
    }

    #[test]
    fn present_advances_once() {
        let (device, mut fence) = setup();
        let mut surface = PresentationSurface::new(device.clone());
        let mut channel = CommandChannel::new(device.clone(), 1, 8).unwrap();
        surface.create_or_resize(&(), desc(64, 64, 2), &fence).unwrap();

        channel.begin_frame(&fence).unwrap();
        for slot in surface.slots() {
            channel
                .transition(slot.texture, ResourceState::Common, ResourceState::Present)
                .unwrap();
        }
        channel.end_frame().unwrap();
        let value = channel.submit(&mut fence).unwrap();
        fence.wait_for_value(value).unwrap();

        for expected in [0, 1, 0] {
            let slot = surface.acquire_current().unwrap();
            assert_eq!(slot.index, expected);
            channel.begin_frame(&fence).unwrap();
            channel
                .transition(slot.texture, ResourceState::Present, ResourceState::RenderTarget)
                .unwrap();
            channel.clear_render_target(slot.view, [0.0; 4]).unwrap();
            channel
                .transition(slot.texture, ResourceState::RenderTarget, ResourceState::Present)
                .unwrap();
            channel.end_frame().unwrap();
            let value = channel.submit(&mut fence).unwrap();
            surface.present_current(0).unwrap();
            fence.wait_for_value(value).unwrap();
        }
        fence.flush().unwrap();
        assert_eq!(surface.current_index(), 1);
        assert_eq!(device.present_count(), 3);
        assert!(device.violations().is_empty());
    }
}
