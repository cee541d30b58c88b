// Window surface
//
// The platform target the swapchain presents into. Created from the raw
// handles the window collaborator hands us; the window itself is not ours.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

use super::VulkanInstance;
use crate::error::{RenderError, RenderResult};

pub struct Surface {
    pub handle: vk::SurfaceKHR,
    instance: Arc<VulkanInstance>,
}

impl Surface {
    pub fn new(
        instance: Arc<VulkanInstance>,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> RenderResult<Self> {
        let handle = unsafe {
            ash_window::create_surface(
                instance.entry(),
                &instance.instance,
                display_handle,
                window_handle,
                None,
            )
        }
        .map_err(RenderError::creation("window surface"))?;

        Ok(Self { handle, instance })
    }

    /// Explicit per-family presentation query; flags can't tell us this.
    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> RenderResult<bool> {
        unsafe {
            self.instance.surface_loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.handle,
            )
        }
        .map_err(RenderError::backend("surface support query"))
    }

    pub fn loader(&self) -> &ash::extensions::khr::Surface {
        &self.instance.surface_loader
    }
}

impl Drop for Surface {
    fn drop(&mut self) {
        unsafe {
            self.instance.surface_loader.destroy_surface(self.handle, None);
        }
    }
}
