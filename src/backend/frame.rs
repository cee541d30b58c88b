// Frame synchronizer
//
// Cycles through N frame slots: wait on the slot's fence, acquire, reset,
// record, submit, present. The GPU-facing steps sit behind `FrameBackend`, so
// the ordering rules are enforced in one place for both the real device and
// test doubles.

use ash::vk;
use std::time::Duration;

use super::buffer::Mesh;
use super::pipeline::{GraphicsPipeline, RenderPass};
use super::swapchain::{AcquireOutcome, PresentOutcome, Swapchain};
use super::sync::{FrameSlots, FrameUniforms};
use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

/// What happened to one `draw_frame` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Submitted and presented on a current swapchain
    Presented,
    /// Acquire reported out-of-date or suboptimal; nothing was recorded
    Skipped,
    /// Submitted, but present reported the swapchain out of date or suboptimal
    Suboptimal,
}

impl FrameOutcome {
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, FrameOutcome::Presented)
    }
}

/// The per-slot GPU operations a frame is made of
pub trait FrameBackend {
    /// Block until the slot's previous submission has finished
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()>;
    /// Ask for the next image, signalling the slot's image-available semaphore
    fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome>;
    /// Unsignal the slot's fence ahead of the submit that will signal it
    fn reset_slot(&mut self, slot: usize) -> RenderResult<()>;
    /// Consume the slot's image-available signal without rendering, signalling
    /// the fence again once the GPU has waited on it
    fn release_image(&mut self, slot: usize) -> RenderResult<()>;
    /// Rewrite the slot's uniforms and command buffer for `image_index`
    fn record(&mut self, slot: usize, image_index: u32) -> RenderResult<()>;
    fn submit(&mut self, slot: usize) -> RenderResult<()>;
    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome>;
}

pub struct FrameSynchronizer {
    frame_counter: u64,
    slot_count: usize,
}

impl FrameSynchronizer {
    pub fn new(slot_count: usize) -> Self {
        Self {
            frame_counter: 0,
            slot_count: slot_count.max(1),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    /// Slot the next frame will use
    pub fn current_slot(&self) -> usize {
        (self.frame_counter % self.slot_count as u64) as usize
    }

    pub fn draw_frame<B: FrameBackend>(&mut self, backend: &mut B) -> RenderResult<FrameOutcome> {
        let slot = self.current_slot();

        // Step 1: The slot's command buffer and uniforms may still be in use
        backend.wait_for_slot(slot)?;

        // Step 2: Acquire; the fence stays signaled if we bail out here
        let image_index = match backend.acquire_image(slot)? {
            AcquireOutcome::Ready {
                image_index,
                suboptimal: false,
            } => image_index,
            AcquireOutcome::Ready {
                suboptimal: true, ..
            } => {
                // The semaphore will be signaled; it must be waited on before reuse
                log::debug!("Swapchain suboptimal on acquire, skipping frame");
                backend.reset_slot(slot)?;
                backend.release_image(slot)?;
                return Ok(FrameOutcome::Skipped);
            }
            AcquireOutcome::Stale => {
                log::debug!("Swapchain out of date on acquire, skipping frame");
                return Ok(FrameOutcome::Skipped);
            }
        };

        // Step 3: Reset only once a submit is certain to follow
        backend.reset_slot(slot)?;

        // Step 4: Record
        backend.record(slot, image_index)?;

        // Step 5: Submit
        backend.submit(slot)?;

        // Step 6: Present
        let presented = backend.present(slot, image_index)?;

        // Step 7: Advance
        self.frame_counter += 1;

        if presented == PresentOutcome::Stale {
            Ok(FrameOutcome::Suboptimal)
        } else {
            Ok(FrameOutcome::Presented)
        }
    }
}

/// `FrameBackend` over the live device, borrowed from the render context
pub struct VulkanFrameBackend<'a> {
    pub device: &'a VulkanDevice,
    pub swapchain: &'a Swapchain,
    pub slots: &'a mut FrameSlots,
    pub render_pass: &'a RenderPass,
    pub pipeline: &'a GraphicsPipeline,
    pub mesh: &'a Mesh,
    pub uniforms: FrameUniforms,
    pub clear_color: [f32; 4],
    pub fence_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl FrameBackend for VulkanFrameBackend<'_> {
    fn wait_for_slot(&mut self, slot: usize) -> RenderResult<()> {
        self.slots
            .get(slot)
            .in_flight
            .wait(self.fence_timeout, &format!("frame slot {slot} fence"))
    }

    fn acquire_image(&mut self, slot: usize) -> RenderResult<AcquireOutcome> {
        self.swapchain.acquire_next_image(
            self.acquire_timeout,
            self.slots.get(slot).image_available.handle,
        )
    }

    fn reset_slot(&mut self, slot: usize) -> RenderResult<()> {
        self.slots.get(slot).in_flight.reset()
    }

    fn release_image(&mut self, slot: usize) -> RenderResult<()> {
        let frame = self.slots.get(slot);
        let wait_semaphores = [frame.image_available.handle];
        let wait_stages = [vk::PipelineStageFlags::ALL_COMMANDS];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight.handle,
            )
        }
        .map_err(RenderError::backend("image release submit"))
    }

    fn record(&mut self, slot: usize, image_index: u32) -> RenderResult<()> {
        let frame = self.slots.get_mut(slot);
        frame.uniforms.write(&[self.uniforms])?;

        let device = &self.device.device;
        let cmd = frame.command_buffer;
        let extent = self.swapchain.extent();

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .map_err(RenderError::backend("reset command buffer"))?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(RenderError::backend("begin command buffer"))?;

            let clear_values = [
                vk::ClearValue {
                    color: vk::ClearColorValue {
                        float32: self.clear_color,
                    },
                },
                vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: 1.0,
                        stencil: 0,
                    },
                },
            ];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            let pass_info = vk::RenderPassBeginInfo::builder()
                .render_pass(self.render_pass.handle)
                .framebuffer(self.swapchain.framebuffer(image_index))
                .render_area(render_area)
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.handle);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[frame.descriptor_set],
                &[],
            );
            self.mesh.record_draw(device, cmd);

            device.cmd_end_render_pass(cmd);
            device
                .end_command_buffer(cmd)
                .map_err(RenderError::backend("end command buffer"))?;
        }

        Ok(())
    }

    fn submit(&mut self, slot: usize) -> RenderResult<()> {
        let frame = self.slots.get(slot);
        let wait_semaphores = [frame.image_available.handle];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let signal_semaphores = [frame.render_finished.handle];
        let command_buffers = [frame.command_buffer];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info.build()],
                frame.in_flight.handle,
            )
        }
        .map_err(RenderError::backend("queue submit"))
    }

    fn present(&mut self, slot: usize, image_index: u32) -> RenderResult<PresentOutcome> {
        let frame = self.slots.get(slot);
        self.swapchain.present(
            self.device.present_queue,
            image_index,
            &[frame.render_finished.handle],
        )
    }
}
