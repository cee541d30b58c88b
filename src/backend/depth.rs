// Depth attachment
//
// Sized to the swapchain extent, so it lives and dies with the swapchain.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

const DEPTH_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// First candidate whose optimal tiling supports depth attachments.
pub fn choose_depth_format<F>(mut optimal_features: F) -> RenderResult<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatFeatureFlags,
{
    DEPTH_CANDIDATES
        .into_iter()
        .find(|&format| {
            optimal_features(format).contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
        })
        .ok_or_else(|| RenderError::capability("depth attachment format"))
}

pub fn find_depth_format(device: &VulkanDevice) -> RenderResult<vk::Format> {
    choose_depth_format(|format| unsafe {
        device
            .instance
            .instance
            .get_physical_device_format_properties(device.physical_device(), format)
            .optimal_tiling_features
    })
}

pub struct DepthBuffer {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl DepthBuffer {
    pub fn new(
        device: Arc<VulkanDevice>,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> RenderResult<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(RenderError::creation("depth image"))?;

        // From here on Drop cleans up whatever got created
        let mut depth = Self {
            image,
            view: vk::ImageView::null(),
            format,
            allocation: None,
            device,
        };

        let requirements = unsafe { depth.device.device.get_image_memory_requirements(image) };
        let allocation = depth.device.allocator().allocate(&AllocationCreateDesc {
            name: "depth buffer",
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            depth
                .device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .map_err(RenderError::backend("bind depth image memory"))?;
        depth.allocation = Some(allocation);

        let aspect_mask = if format == vk::Format::D32_SFLOAT {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        };

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        depth.view = unsafe { depth.device.device.create_image_view(&view_info, None) }
            .map_err(RenderError::creation("depth image view"))?;

        Ok(depth)
    }
}

impl Drop for DepthBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.device.destroy_image_view(self.view, None);
            }
            self.device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free depth buffer memory: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_pure_depth_format() {
        let format =
            choose_depth_format(|_| vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT).unwrap();
        assert_eq!(format, vk::Format::D32_SFLOAT);
    }

    #[test]
    fn falls_back_to_packed_depth_stencil() {
        let format = choose_depth_format(|format| {
            if format == vk::Format::D24_UNORM_S8_UINT {
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
            } else {
                vk::FormatFeatureFlags::SAMPLED_IMAGE
            }
        })
        .unwrap();
        assert_eq!(format, vk::Format::D24_UNORM_S8_UINT);
    }

    #[test]
    fn no_depth_format_is_capability_missing() {
        assert!(choose_depth_format(|_| vk::FormatFeatureFlags::empty()).is_err());
    }
}
