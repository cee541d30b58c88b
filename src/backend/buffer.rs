// Buffer utilities for vertex, index, and uniform buffers
//
// Memory comes from the device's gpu-allocator. Host-visible buffers are
// written through their persistent mapping; device-local ones are filled by a
// staging copy on the transfer queue.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;
use std::time::Duration;

use super::command::CommandPool;
use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

/// GPU buffer with allocator-managed memory
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer shared between `families` (exclusive when fewer than two)
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        families: &[u32],
    ) -> RenderResult<Self> {
        let mut buffer_info = vk::BufferCreateInfo::builder().size(size).usage(usage);
        buffer_info = if families.len() > 1 {
            buffer_info
                .sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(families)
        } else {
            buffer_info.sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(RenderError::creation("buffer"))?;

        let mut buffer = Self {
            handle,
            size,
            allocation: None,
            device,
        };

        let requirements = unsafe { buffer.device.device.get_buffer_memory_requirements(handle) };
        let allocation = buffer.device.allocator().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            buffer
                .device
                .device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        }
        .map_err(RenderError::backend("bind buffer memory"))?;
        buffer.allocation = Some(allocation);

        log::debug!("Created {} buffer: {} bytes", name, size);
        Ok(buffer)
    }

    /// Copy `data` into a host-visible buffer
    pub fn write<T: Pod>(&mut self, data: &[T]) -> RenderResult<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or_else(|| RenderError::capability("host-visible buffer mapping"))?;

        if bytes.len() > mapped.len() {
            return Err(RenderError::capability(format!(
                "buffer of {} bytes for a {} byte write",
                mapped.len(),
                bytes.len()
            )));
        }
        mapped[..bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Create a device-local buffer filled through a staging copy
    pub fn upload<T: Pod>(
        device: Arc<VulkanDevice>,
        transfer_pool: &CommandPool,
        name: &str,
        usage: vk::BufferUsageFlags,
        data: &[T],
        timeout: Duration,
    ) -> RenderResult<Self> {
        let size = std::mem::size_of_val(data) as vk::DeviceSize;
        let families = &device.queue_families;
        let (_, sharing_families) = families.buffer_sharing();

        // Step 1: Fill staging memory
        let mut staging = Self::new(
            device.clone(),
            "staging",
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            &[],
        )?;
        staging.write(data)?;

        // Step 2: Destination readable by both transfer and graphics families
        let buffer = Self::new(
            device.clone(),
            name,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            &sharing_families,
        )?;

        // Step 3: Copy on the transfer queue
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        transfer_pool.submit_one_shot(device.transfer_queue, timeout, |dev, cmd| unsafe {
            dev.cmd_copy_buffer(cmd, staging.handle, buffer.handle, &[region]);
        })?;

        Ok(buffer)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.handle, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().free(allocation) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
    }
}

/// Interleaved 2D position + RGB color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 2],
    pub color: [f32; 3],
}

impl Vertex {
    pub const fn new(position: [f32; 2], color: [f32; 3]) -> Self {
        Self { position, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // Position
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(0)
                .build(),
            // Color
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::size_of::<[f32; 2]>() as u32)
                .build(),
        ]
    }
}

pub const QUAD_VERTICES: [Vertex; 4] = [
    Vertex::new([-0.5, -0.5], [1.0, 0.0, 0.0]),
    Vertex::new([0.5, -0.5], [0.0, 1.0, 0.0]),
    Vertex::new([0.5, 0.5], [0.0, 0.0, 1.0]),
    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0]),
];

pub const QUAD_INDICES: [u16; 6] = [0, 1, 2, 2, 3, 0];

/// Vertex + index buffers ready to draw
pub struct Mesh {
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
}

impl Mesh {
    pub fn upload(
        device: Arc<VulkanDevice>,
        transfer_pool: &CommandPool,
        vertices: &[Vertex],
        indices: &[u16],
        timeout: Duration,
    ) -> RenderResult<Self> {
        let vertex_buffer = GpuBuffer::upload(
            device.clone(),
            transfer_pool,
            "vertex",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            vertices,
            timeout,
        )?;
        let index_buffer = GpuBuffer::upload(
            device,
            transfer_pool,
            "index",
            vk::BufferUsageFlags::INDEX_BUFFER,
            indices,
            timeout,
        )?;

        Ok(Self {
            vertex_buffer,
            index_buffer,
            index_count: indices.len() as u32,
        })
    }

    pub fn quad(
        device: Arc<VulkanDevice>,
        transfer_pool: &CommandPool,
        timeout: Duration,
    ) -> RenderResult<Self> {
        Self::upload(device, transfer_pool, &QUAD_VERTICES, &QUAD_INDICES, timeout)
    }

    pub fn record_draw(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.handle], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.handle, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_attributes() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        assert_eq!(Vertex::binding_description().stride, 20);

        let [position, color] = Vertex::attribute_descriptions();
        assert_eq!(position.offset, 0);
        assert_eq!(color.offset, 8);
        assert_eq!(color.location, 1);
    }

    #[test]
    fn quad_indices_stay_in_range() {
        assert_eq!(QUAD_INDICES.len() % 3, 0);
        assert!(QUAD_INDICES
            .iter()
            .all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }

    #[test]
    fn vertices_cast_to_tightly_packed_bytes() {
        let bytes: &[u8] = bytemuck::cast_slice(&QUAD_VERTICES);
        assert_eq!(bytes.len(), QUAD_VERTICES.len() * 20);
    }
}
