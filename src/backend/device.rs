// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Physical device selection (ranked by the enumerator)
// - Queue family mapping against the window surface
// - Logical device + graphics/transfer/present queue creation
// - Memory allocator setup

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::{Mutex, MutexGuard};
use std::mem::ManuallyDrop;
use std::sync::Arc;

use super::enumerate::{self, GpuDevice};
use super::queue_family::{map_queue_families, QueueRequirements, ResolvedQueueFamilies};
use super::{Surface, VulkanInstance};
use crate::config::RendererSettings;
use crate::error::{RenderError, RenderResult};

/// Vulkan device wrapper with automatic cleanup
pub struct VulkanDevice {
    // Vulkan handles (order matters for drop!)
    allocator: ManuallyDrop<Mutex<Allocator>>,
    pub device: ash::Device,
    pub gpu: GpuDevice,
    pub queue_families: ResolvedQueueFamilies,

    // Queue handles; may alias when families are shared
    pub graphics_queue: vk::Queue,
    pub transfer_queue: vk::Queue,
    pub present_queue: vk::Queue,

    pub instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    /// Create Vulkan device
    ///
    /// # Arguments
    /// * `instance` - Instance the surface was created from
    /// * `surface` - Window surface the device must be able to present to
    /// * `settings` - Queue requirements and logging switches
    pub fn new(
        instance: Arc<VulkanInstance>,
        surface: &Surface,
        settings: &RendererSettings,
    ) -> RenderResult<Arc<Self>> {
        let requirements = QueueRequirements {
            dedicated_transfer: settings.dedicated_transfer_queue,
        };

        // Step 1: Rank every GPU on the system
        let candidates = enumerate::enumerate(&instance.instance)?;

        // Step 2: Take the best one that can actually drive this surface
        let (gpu, queue_families) = Self::select(candidates, surface, requirements)?;

        log::info!("Selected GPU: {}", gpu.name());
        if settings.print_gpu_info {
            gpu.log_info();
        }
        log::info!(
            "Queue families: graphics={} transfer={} present={}",
            queue_families.graphics,
            queue_families.transfer,
            queue_families.present
        );

        // Step 3: Create logical device
        let device = Self::create_logical_device(&instance.instance, &gpu, &queue_families)?;

        let (graphics_queue, transfer_queue, present_queue) = unsafe {
            (
                device.get_device_queue(queue_families.graphics, 0),
                device.get_device_queue(queue_families.transfer, 0),
                device.get_device_queue(queue_families.present, 0),
            )
        };

        // Step 4: Create memory allocator
        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.instance.clone(),
            device: device.clone(),
            physical_device: gpu.handle,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(e.into());
            }
        };

        Ok(Arc::new(Self {
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            device,
            gpu,
            queue_families,
            graphics_queue,
            transfer_queue,
            present_queue,
            instance,
        }))
    }

    fn select(
        candidates: Vec<GpuDevice>,
        surface: &Surface,
        requirements: QueueRequirements,
    ) -> RenderResult<(GpuDevice, ResolvedQueueFamilies)> {
        let mut last_error = None;

        for gpu in candidates {
            match Self::check_suitability(&gpu, surface, requirements) {
                Ok(families) => return Ok((gpu, families)),
                Err(e) => {
                    log::warn!("Skipping GPU '{}': {}", gpu.name(), e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| RenderError::DeviceUnavailable {
            reason: "no candidate GPUs".into(),
        }))
    }

    fn check_suitability(
        gpu: &GpuDevice,
        surface: &Surface,
        requirements: QueueRequirements,
    ) -> RenderResult<ResolvedQueueFamilies> {
        if !gpu.supports_extension(SwapchainLoader::name()) {
            return Err(RenderError::capability("VK_KHR_swapchain device extension"));
        }

        map_queue_families(&gpu.queue_families, requirements, |family| {
            surface.supports_present(gpu.handle, family)
        })?
        .resolve(requirements)
    }

    fn create_logical_device(
        instance: &ash::Instance,
        gpu: &GpuDevice,
        queue_families: &ResolvedQueueFamilies,
    ) -> RenderResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = queue_families
            .unique_families()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        // Required device extensions
        let extensions = [SwapchainLoader::name().as_ptr()];

        // Only request what the hardware has
        let features = vk::PhysicalDeviceFeatures {
            sampler_anisotropy: gpu.features.sampler_anisotropy,
            fill_mode_non_solid: gpu.features.fill_mode_non_solid,
            ..Default::default()
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(gpu.handle, &create_info, None) }
            .map_err(RenderError::creation("logical device"))
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.gpu.handle
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.gpu.memory_properties
    }

    /// Zero when anisotropic filtering wasn't enabled on the device.
    pub fn max_sampler_anisotropy(&self) -> f32 {
        if self.gpu.features.sampler_anisotropy == vk::TRUE {
            self.gpu.max_sampler_anisotropy()
        } else {
            0.0
        }
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.allocator.lock()
    }

    /// Find a memory type index matching `type_filter` with all of `properties`
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<u32> {
        find_memory_type(self.memory_properties(), type_filter, properties)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> RenderResult<()> {
        unsafe { self.device.device_wait_idle() }.map_err(RenderError::backend("device wait idle"))
    }
}

pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> RenderResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            let has_type = (type_filter & (1 << i)) != 0;
            let has_properties = memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties);
            has_type && has_properties
        })
        .ok_or_else(|| RenderError::capability(format!("memory type with {properties:?}")))
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        // Wait for device to finish
        if let Err(e) = self.wait_idle() {
            log::warn!("Wait idle before device destruction failed: {}", e);
        }

        unsafe {
            // Allocator frees its memory blocks through the device
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &property_flags) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = property_flags;
        }
        props
    }

    #[test]
    fn memory_type_respects_filter_and_flags() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;
        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b100, host).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn missing_memory_type_is_an_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        assert!(matches!(
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE),
            Err(RenderError::CapabilityMissing { .. })
        ));
    }
}
