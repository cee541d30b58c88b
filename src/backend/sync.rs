// Synchronization primitives
//
// Fences, semaphores for GPU-CPU and GPU-GPU sync, and the per-slot resource
// bundle the frame synchronizer cycles through.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use std::time::Duration;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

/// Convert a wait bound to the nanosecond count the API expects.
pub fn timeout_nanos(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX)
}

pub struct Fence {
    pub handle: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl Fence {
    pub fn new(device: Arc<VulkanDevice>, signaled: bool) -> RenderResult<Self> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence_info = vk::FenceCreateInfo::builder().flags(flags);

        let handle = unsafe { device.device.create_fence(&fence_info, None) }
            .map_err(RenderError::creation("fence"))?;
        Ok(Self { handle, device })
    }

    /// Block until signaled; running out of time is fatal.
    pub fn wait(&self, timeout: Duration, what: &str) -> RenderResult<()> {
        let result = unsafe {
            self.device
                .device
                .wait_for_fences(&[self.handle], true, timeout_nanos(timeout))
        };

        match result {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::SynchronizationTimeout {
                what: what.to_string(),
                timeout,
            }),
            Err(status) => Err(RenderError::backend("fence wait")(status)),
        }
    }

    pub fn reset(&self) -> RenderResult<()> {
        unsafe { self.device.device.reset_fences(&[self.handle]) }
            .map_err(RenderError::backend("fence reset"))
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_fence(self.handle, None) };
    }
}

pub struct Semaphore {
    pub handle: vk::Semaphore,
    device: Arc<VulkanDevice>,
}

impl Semaphore {
    pub fn new(device: Arc<VulkanDevice>) -> RenderResult<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let handle = unsafe { device.device.create_semaphore(&semaphore_info, None) }
            .map_err(RenderError::creation("semaphore"))?;
        Ok(Self { handle, device })
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_semaphore(self.handle, None) };
    }
}

/// Per-frame shader data, std140 compatible
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct FrameUniforms {
    pub transform: Mat4,
    pub tint: [f32; 4],
}

impl FrameUniforms {
    /// Slowly spinning quad, corrected for the window's aspect ratio
    pub fn animated(elapsed: Duration, extent: vk::Extent2D) -> Self {
        let aspect = if extent.height == 0 {
            1.0
        } else {
            extent.width as f32 / extent.height as f32
        };
        let t = elapsed.as_secs_f32();
        let transform = Mat4::from_scale(glam::Vec3::new(1.0 / aspect, 1.0, 1.0))
            * Mat4::from_rotation_z(t * 0.5);
        let pulse = 0.75 + 0.25 * (t * 2.0).sin();

        Self {
            transform,
            tint: [pulse, pulse, pulse, 1.0],
        }
    }
}

/// Everything one frame in flight owns exclusively
pub struct FrameSlot {
    pub image_available: Semaphore,
    pub render_finished: Semaphore,
    /// Created signaled so the first wait on each slot returns immediately
    pub in_flight: Fence,
    pub command_buffer: vk::CommandBuffer,
    pub uniforms: GpuBuffer,
    pub descriptor_set: vk::DescriptorSet,
}

/// Fixed array of frame slots plus the pools they draw from
pub struct FrameSlots {
    // Drop order: slots, then descriptor pool, then command pool
    slots: Vec<FrameSlot>,
    descriptor_pool: vk::DescriptorPool,
    _command_pool: CommandPool,
    device: Arc<VulkanDevice>,
}

impl FrameSlots {
    pub fn new(
        device: Arc<VulkanDevice>,
        count: usize,
        descriptor_set_layout: vk::DescriptorSetLayout,
    ) -> RenderResult<Self> {
        let command_pool = CommandPool::new(device.clone(), device.queue_families.graphics)?;
        let command_buffers = command_pool.allocate(count as u32)?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: count as u32,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&pool_sizes)
            .max_sets(count as u32);
        let descriptor_pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .map_err(RenderError::creation("descriptor pool"))?;

        let mut frame_slots = Self {
            slots: Vec::with_capacity(count),
            descriptor_pool,
            _command_pool: command_pool,
            device: device.clone(),
        };

        let layouts = vec![descriptor_set_layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(descriptor_pool)
            .set_layouts(&layouts);
        let descriptor_sets = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(RenderError::creation("descriptor sets"))?;

        let uniform_size = std::mem::size_of::<FrameUniforms>() as vk::DeviceSize;

        for (command_buffer, descriptor_set) in command_buffers.into_iter().zip(descriptor_sets) {
            let uniforms = GpuBuffer::new(
                device.clone(),
                "frame uniforms",
                uniform_size,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
                &[],
            )?;

            let buffer_info = [vk::DescriptorBufferInfo {
                buffer: uniforms.handle,
                offset: 0,
                range: uniform_size,
            }];
            let write = vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(&buffer_info)
                .build();
            unsafe { device.device.update_descriptor_sets(&[write], &[]) };

            frame_slots.slots.push(FrameSlot {
                image_available: Semaphore::new(device.clone())?,
                render_finished: Semaphore::new(device.clone())?,
                in_flight: Fence::new(device.clone(), true)?,
                command_buffer,
                uniforms,
                descriptor_set,
            });
        }

        log::info!("Created {} frame slots", count);
        Ok(frame_slots)
    }

    pub fn count(&self) -> usize {
        self.slots.len()
    }

    pub fn get(&self, index: usize) -> &FrameSlot {
        &self.slots[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut FrameSlot {
        &mut self.slots[index]
    }
}

impl Drop for FrameSlots {
    fn drop(&mut self) {
        self.slots.clear();
        unsafe {
            // Also frees the sets
            self.device
                .device
                .destroy_descriptor_pool(self.descriptor_pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_conversion_saturates() {
        assert_eq!(timeout_nanos(Duration::from_millis(2)), 2_000_000);
        assert_eq!(timeout_nanos(Duration::MAX), u64::MAX);
    }

    #[test]
    fn uniforms_fit_std140_layout() {
        assert_eq!(std::mem::size_of::<FrameUniforms>(), 80);
    }

    #[test]
    fn uniforms_correct_for_aspect_ratio() {
        let uniforms = FrameUniforms::animated(
            Duration::ZERO,
            vk::Extent2D {
                width: 200,
                height: 100,
            },
        );
        let x = uniforms.transform.transform_point3(glam::Vec3::X);
        assert!((x.x - 0.5).abs() < 1e-6);

        // Degenerate extent doesn't divide by zero
        let flat = FrameUniforms::animated(Duration::ZERO, vk::Extent2D::default());
        assert!(flat.transform.is_finite());
    }
}
