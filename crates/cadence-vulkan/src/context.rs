//! Instance, adapter, and logical device bring-up.

use crate::error::{Result, VulkanError};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::ImageAllocator;
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::ffi::c_char;

/// Vulkan objects shared by every backend component.
pub struct VulkanContext {
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: ash::Device,
    pub(crate) allocator: Mutex<ImageAllocator>,
    pub(crate) surface_loader: ash::khr::surface::Instance,
    pub(crate) swapchain_loader: ash::khr::swapchain::Device,
    pub(crate) queue_family: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) device_name: String,
    pub(crate) limits: vk::PhysicalDeviceLimits,
    pub(crate) sampler_anisotropy: bool,
}

impl VulkanContext {
    /// Load Vulkan and create a device able to present to `display`.
    pub fn new(display: RawDisplayHandle, app_name: &str, enable_validation: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| VulkanError::Loading(e.to_string()))?;
        let instance = unsafe { create_instance(&entry, display, app_name, enable_validation)? };

        match unsafe { Self::with_instance(entry.clone(), instance.clone()) } {
            Ok(context) => Ok(context),
            Err(err) => {
                unsafe { instance.destroy_instance(None) };
                Err(err)
            }
        }
    }

    unsafe fn with_instance(entry: ash::Entry, instance: ash::Instance) -> Result<Self> {
        let physical_device = unsafe { select_physical_device(&instance)? };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let features = unsafe { instance.get_physical_device_features(physical_device) };
        let device_name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());

        tracing::info!("Selected GPU: {}", device_name);

        let queue_family = unsafe { find_graphics_queue_family(&instance, physical_device)? };
        let sampler_anisotropy = features.sampler_anisotropy == vk::TRUE;
        let device = unsafe {
            create_device(&instance, physical_device, queue_family, sampler_anisotropy)?
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        let allocator = match unsafe { ImageAllocator::new(&instance, &device, physical_device) } {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe { device.destroy_device(None) };
                return Err(err);
            }
        };

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);
        let swapchain_loader = ash::khr::swapchain::Device::new(&instance, &device);

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            allocator: Mutex::new(allocator),
            surface_loader,
            swapchain_loader,
            queue_family,
            queue,
            device_name,
            limits: properties.limits,
            sampler_anisotropy,
        })
    }

    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get the graphics queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Frees every VkDeviceMemory block
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// First queue family with graphics support.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_graphics_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

    families
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .and_then(|index| u32::try_from(index).ok())
        .ok_or(VulkanError::NoSuitableDevice)
}

/// Create the logical device with the 1.3 features the backend relies on.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    sampler_anisotropy: bool,
) -> Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: [*const c_char; 1] = [ash::khr::swapchain::NAME.as_ptr()];

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true);

    let mut vulkan_1_2_features =
        vk::PhysicalDeviceVulkan12Features::default().timeline_semaphore(true);

    let features = vk::PhysicalDeviceFeatures::default().sampler_anisotropy(sampler_anisotropy);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    Ok(unsafe { instance.create_device(physical_device, &device_create_info, None)? })
}
