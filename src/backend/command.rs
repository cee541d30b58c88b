// Command pools
//
// One resettable pool per queue family we record for. One-shot submissions
// (staging copies) wait on their own fence with a bounded timeout.

use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::sync::Fence;
use super::VulkanDevice;
use crate::error::{RenderError, RenderResult};

pub struct CommandPool {
    pub handle: vk::CommandPool,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(device: Arc<VulkanDevice>, queue_family: u32) -> RenderResult<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            // RESET: each frame slot re-records its own buffer
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

        let handle = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(RenderError::creation("command pool"))?;

        Ok(Self { handle, device })
    }

    pub fn allocate(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.handle)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .map_err(RenderError::creation("command buffers"))
    }

    /// Record with `record`, submit to `queue` and block until it finishes.
    pub fn submit_one_shot<F>(
        &self,
        queue: vk::Queue,
        timeout: Duration,
        record: F,
    ) -> RenderResult<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let device = &self.device.device;
        let cmd = self.allocate(1)?[0];
        let fence = match Fence::new(self.device.clone(), false) {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { device.free_command_buffers(self.handle, &[cmd]) };
                return Err(e);
            }
        };

        let result = (|| {
            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { device.begin_command_buffer(cmd, &begin_info) }
                .map_err(RenderError::backend("begin command buffer"))?;

            record(device, cmd);

            unsafe { device.end_command_buffer(cmd) }
                .map_err(RenderError::backend("end command buffer"))?;

            let command_buffers = [cmd];
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

            unsafe { device.queue_submit(queue, &[submit_info.build()], fence.handle) }
                .map_err(RenderError::backend("one-shot queue submit"))?;

            fence.wait(timeout, "one-shot transfer")
        })();

        // The copy may still be running if the wait gave up; fence, command
        // buffer and the caller's staging memory must outlive it
        let result = drain_on_error(result, || {
            unsafe { device.queue_wait_idle(queue) }
                .map_err(RenderError::backend("one-shot queue wait idle"))
        });

        unsafe { device.free_command_buffers(self.handle, &[cmd]) };
        drop(fence);
        result
    }
}

/// Run `drain` before handing back a failed `result`, keeping the original error.
fn drain_on_error<T>(
    result: RenderResult<T>,
    drain: impl FnOnce() -> RenderResult<()>,
) -> RenderResult<T> {
    if result.is_err() {
        if let Err(e) = drain() {
            log::warn!("Draining queue after failed submit: {}", e);
        }
    }
    result
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe {
            // Also frees every buffer allocated from it
            self.device.device.destroy_command_pool(self.handle, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn success_does_not_drain() {
        let drained = Cell::new(false);
        let result = drain_on_error(Ok(7), || {
            drained.set(true);
            Ok(())
        });
        assert_eq!(result.unwrap(), 7);
        assert!(!drained.get());
    }

    #[test]
    fn timed_out_wait_drains_before_returning() {
        let drained = Cell::new(false);
        let timeout = Err::<(), _>(RenderError::SynchronizationTimeout {
            what: "one-shot transfer".into(),
            timeout: Duration::from_millis(1),
        });

        let err = drain_on_error(timeout, || {
            drained.set(true);
            Ok(())
        })
        .unwrap_err();

        assert!(drained.get());
        assert!(matches!(err, RenderError::SynchronizationTimeout { .. }));
    }

    #[test]
    fn failed_drain_keeps_the_original_error() {
        let lost = Err::<(), _>(RenderError::backend("one-shot queue submit")(
            vk::Result::ERROR_DEVICE_LOST,
        ));

        let err = drain_on_error(lost, || {
            Err(RenderError::backend("one-shot queue wait idle")(
                vk::Result::ERROR_DEVICE_LOST,
            ))
        })
        .unwrap_err();

        assert!(matches!(
            err,
            RenderError::Backend { operation: "one-shot queue submit", .. }
        ));
    }
}
