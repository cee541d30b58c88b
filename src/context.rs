// =============================================================================
// RENDER CONTEXT - Everything the renderer owns, in one place
// =============================================================================
//
// Created once at startup from the window's raw handles and handed to the
// render loop by value. Fields are declared in reverse creation order so the
// implicit drop after `Drop::drop` releases dependents first.

use ash::vk;
use gpu_allocator::vulkan::Allocator;
use parking_lot::MutexGuard;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;
use std::time::Instant;

use crate::backend::buffer::Mesh;
use crate::backend::command::CommandPool;
use crate::backend::depth::find_depth_format;
use crate::backend::frame::VulkanFrameBackend;
use crate::backend::pipeline::{DescriptorSetLayout, GraphicsPipeline, RenderPass};
use crate::backend::swapchain::SurfaceSupport;
use crate::backend::sync::{FrameSlots, FrameUniforms};
use crate::backend::{
    FrameOutcome, FrameSynchronizer, GpuDevice, ResolvedQueueFamilies, Surface, Swapchain,
    SwapchainDescriptor, VulkanDevice, VulkanInstance,
};
use crate::config::RendererSettings;
use crate::error::RenderResult;
use crate::render_loop::{RebuildOutcome, RenderTarget};

pub struct RenderContext {
    synchronizer: FrameSynchronizer,
    frame_slots: FrameSlots,
    mesh: Mesh,
    /// None while the window has no area
    swapchain: Option<Swapchain>,
    pipeline: GraphicsPipeline,
    render_pass: RenderPass,
    descriptor_set_layout: DescriptorSetLayout,
    device: Arc<VulkanDevice>,
    surface: Surface,
    instance: Arc<VulkanInstance>,
    settings: RendererSettings,
    started: Instant,
}

impl RenderContext {
    /// Initialize all Vulkan resources.
    ///
    /// 1. Instance + surface for the window
    /// 2. Device selection and logical device
    /// 3. Render pass + pipeline for the negotiated format
    /// 4. Swapchain (unless minimized)
    /// 5. Demo mesh through the transfer queue
    /// 6. Frame slots
    pub fn new(
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        window_extent: vk::Extent2D,
        settings: RendererSettings,
    ) -> RenderResult<Self> {
        log::info!("Initializing Vulkan...");

        // Step 1: Instance + surface
        let instance =
            VulkanInstance::new(&settings.app_name, display_handle, settings.enable_validation)?;
        let surface = Surface::new(instance.clone(), display_handle, window_handle)?;

        // Step 2: Device
        let device = VulkanDevice::new(instance.clone(), &surface, &settings)?;

        // Step 3: Format-dependent objects
        let depth_format = find_depth_format(&device)?;
        let support = SurfaceSupport::query(&surface, device.physical_device())?;
        let descriptor = SwapchainDescriptor::negotiate(
            &support,
            window_extent,
            &device.queue_families,
            settings.preferred_present_mode,
        )?;

        let render_pass = RenderPass::new(device.clone(), descriptor.format.format, depth_format)?;
        let descriptor_set_layout = DescriptorSetLayout::frame_uniforms(device.clone())?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            &render_pass,
            &descriptor_set_layout,
            &settings.vertex_shader,
            &settings.fragment_shader,
        )?;

        // Step 4: Swapchain
        let swapchain = if descriptor.is_zero_area() {
            log::info!("Window has no area, deferring swapchain creation");
            None
        } else {
            Some(Swapchain::create(device.clone(), &surface, descriptor, &render_pass)?)
        };

        // Step 5: Mesh, copied on the transfer queue
        let mesh = {
            let transfer_pool = CommandPool::new(device.clone(), device.queue_families.transfer)?;
            Mesh::quad(device.clone(), &transfer_pool, settings.fence_timeout)?
        };

        // Step 6: Frame slots
        let frame_slots = FrameSlots::new(
            device.clone(),
            settings.slot_count(),
            descriptor_set_layout.handle,
        )?;

        log::info!("Vulkan initialized successfully!");

        Ok(Self {
            synchronizer: FrameSynchronizer::new(frame_slots.count()),
            frame_slots,
            mesh,
            swapchain,
            pipeline,
            render_pass,
            descriptor_set_layout,
            device,
            surface,
            instance,
            settings,
            started: Instant::now(),
        })
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn device(&self) -> &Arc<VulkanDevice> {
        &self.device
    }

    pub fn instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn gpu(&self) -> &GpuDevice {
        &self.device.gpu
    }

    pub fn queue_families(&self) -> &ResolvedQueueFamilies {
        &self.device.queue_families
    }

    pub fn graphics_queue(&self) -> vk::Queue {
        self.device.graphics_queue
    }

    pub fn transfer_queue(&self) -> vk::Queue {
        self.device.transfer_queue
    }

    pub fn present_queue(&self) -> vk::Queue {
        self.device.present_queue
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        self.device.memory_properties()
    }

    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> RenderResult<u32> {
        self.device.find_memory_type(type_filter, properties)
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.device.max_sampler_anisotropy()
    }

    pub fn allocator(&self) -> MutexGuard<'_, Allocator> {
        self.device.allocator()
    }

    /// None while minimized
    pub fn swapchain_extent(&self) -> Option<vk::Extent2D> {
        self.swapchain.as_ref().map(Swapchain::extent)
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn frames_in_flight(&self) -> usize {
        self.synchronizer.slot_count()
    }

    pub fn settings(&self) -> &RendererSettings {
        &self.settings
    }

    // =========================================================================
    // SWAPCHAIN REBUILD
    // =========================================================================

    fn rebuild(&mut self, window_extent: vk::Extent2D) -> RenderResult<RebuildOutcome> {
        self.device.wait_idle()?;

        // Old set goes first; a surface only has one live swapchain here
        self.swapchain = None;

        if window_extent.width == 0 || window_extent.height == 0 {
            return Ok(RebuildOutcome::Deferred);
        }

        let support = SurfaceSupport::query(&self.surface, self.device.physical_device())?;
        let descriptor = SwapchainDescriptor::negotiate(
            &support,
            window_extent,
            &self.device.queue_families,
            self.settings.preferred_present_mode,
        )?;

        if descriptor.is_zero_area() {
            return Ok(RebuildOutcome::Deferred);
        }

        if descriptor.format.format != self.render_pass.color_format {
            log::info!(
                "Surface format changed {:?} -> {:?}, recreating render pass",
                self.render_pass.color_format,
                descriptor.format.format
            );
            let render_pass = RenderPass::new(
                self.device.clone(),
                descriptor.format.format,
                self.render_pass.depth_format,
            )?;
            let pipeline = self.build_pipeline(&render_pass)?;
            self.pipeline = pipeline;
            self.render_pass = render_pass;
        }

        self.swapchain = Some(Swapchain::create(
            self.device.clone(),
            &self.surface,
            descriptor,
            &self.render_pass,
        )?);

        Ok(RebuildOutcome::Rebuilt)
    }

    fn build_pipeline(&self, render_pass: &RenderPass) -> RenderResult<GraphicsPipeline> {
        GraphicsPipeline::new(
            self.device.clone(),
            render_pass,
            &self.descriptor_set_layout,
            &self.settings.vertex_shader,
            &self.settings.fragment_shader,
        )
    }
}

impl RenderTarget for RenderContext {
    fn draw_frame(&mut self) -> RenderResult<FrameOutcome> {
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(FrameOutcome::Skipped);
        };

        let mut backend = VulkanFrameBackend {
            device: &self.device,
            swapchain,
            slots: &mut self.frame_slots,
            render_pass: &self.render_pass,
            pipeline: &self.pipeline,
            mesh: &self.mesh,
            uniforms: FrameUniforms::animated(self.started.elapsed(), swapchain.extent()),
            clear_color: self.settings.clear_color,
            fence_timeout: self.settings.fence_timeout,
            acquire_timeout: self.settings.acquire_timeout,
        };

        self.synchronizer.draw_frame(&mut backend)
    }

    fn rebuild_swapchain(&mut self, window_extent: vk::Extent2D) -> RenderResult<RebuildOutcome> {
        let outcome = self.rebuild(window_extent)?;
        match (outcome, self.swapchain_extent()) {
            (RebuildOutcome::Rebuilt, Some(extent)) => {
                log::info!("Swapchain rebuilt at {}x{}", extent.width, extent.height)
            }
            _ => log::debug!("Swapchain rebuild deferred, window has no area"),
        }
        Ok(outcome)
    }

    fn wait_idle(&mut self) -> RenderResult<()> {
        self.device.wait_idle()
    }

    fn reload_pipeline(&mut self) -> RenderResult<()> {
        // The old pipeline stays if this fails
        let pipeline = self.build_pipeline(&self.render_pass)?;
        self.pipeline = pipeline;
        Ok(())
    }
}

impl Drop for RenderContext {
    fn drop(&mut self) {
        log::info!("Cleaning up Vulkan resources...");
        // Nothing may be released while the GPU still uses it
        if let Err(e) = self.device.wait_idle() {
            log::warn!("Wait idle during cleanup failed: {}", e);
        }
    }
}
