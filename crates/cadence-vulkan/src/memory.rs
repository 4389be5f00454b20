//! Image memory management.

use crate::error::{Result, VulkanError};
use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator, AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;

/// Device-local image allocator.
pub struct ImageAllocator {
    allocator: Option<Allocator>,
    device: ash::Device,
}

impl ImageAllocator {
    /// Create a new allocator.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: false,
            allocation_sizes: gpu_allocator::AllocationSizes::default(),
        })?;

        Ok(Self {
            allocator: Some(allocator),
            device: device.clone(),
        })
    }

    fn allocator(&mut self) -> Result<&mut Allocator> {
        self.allocator
            .as_mut()
            .ok_or_else(|| VulkanError::AllocationFailed("allocator shut down".to_string()))
    }

    /// Create an image and bind device-local memory to it.
    pub fn create_image(&mut self, create_info: &vk::ImageCreateInfo, name: &str) -> Result<GpuImage> {
        let image = unsafe { self.device.create_image(create_info, None)? };
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let allocation = match self.allocator()?.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        }) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err.into());
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.allocator()?.free(allocation)?;
            unsafe { self.device.destroy_image(image, None) };
            return Err(err.into());
        }

        Ok(GpuImage {
            image,
            allocation: Some(allocation),
        })
    }

    /// Destroy an image and return its memory.
    pub fn free_image(&mut self, mut image: GpuImage) -> Result<()> {
        if let Some(allocation) = image.allocation.take() {
            self.allocator()?.free(allocation)?;
        }
        unsafe { self.device.destroy_image(image.image, None) };
        Ok(())
    }

    /// Free all remaining memory. Must run before the device is destroyed.
    pub fn shutdown(&mut self) {
        drop(self.allocator.take());
    }
}

impl Drop for ImageAllocator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// An image with its memory allocation.
pub struct GpuImage {
    pub image: vk::Image,
    allocation: Option<Allocation>,
}
