// Swapchain - Window presentation
//
// Negotiation (format, present mode, extent, image count, sharing) is pure and
// runs against a snapshot of the surface's support. The resulting chain owns
// one view + framebuffer per image and the depth attachment, and is rebuilt
// as a whole when the window changes.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::vk;
use std::sync::Arc;
use std::time::Duration;

use super::depth::DepthBuffer;
use super::pipeline::RenderPass;
use super::queue_family::ResolvedQueueFamilies;
use super::sync::timeout_nanos;
use super::{Surface, VulkanDevice};
use crate::error::{RenderError, RenderResult};

pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// What the surface offers on the selected device, queried fresh per build
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(surface: &Surface, physical_device: vk::PhysicalDevice) -> RenderResult<Self> {
        let loader = surface.loader();
        let (capabilities, formats, present_modes) = unsafe {
            (
                loader
                    .get_physical_device_surface_capabilities(physical_device, surface.handle)
                    .map_err(RenderError::backend("surface capabilities query"))?,
                loader
                    .get_physical_device_surface_formats(physical_device, surface.handle)
                    .map_err(RenderError::backend("surface formats query"))?,
                loader
                    .get_physical_device_surface_present_modes(physical_device, surface.handle)
                    .map_err(RenderError::backend("surface present modes query"))?,
            )
        };

        Self {
            capabilities,
            formats,
            present_modes,
        }
        .validate()
    }

    fn validate(self) -> RenderResult<Self> {
        if self.formats.is_empty() {
            return Err(no_formats());
        }
        if self.present_modes.is_empty() {
            return Err(RenderError::ResourceCreationFailure {
                resource: "swapchain (surface reports no present modes)",
                status: vk::Result::ERROR_INITIALIZATION_FAILED,
            });
        }
        Ok(self)
    }
}

fn no_formats() -> RenderError {
    RenderError::ResourceCreationFailure {
        resource: "swapchain (surface reports no formats)",
        status: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
    }
}

/// Prefer sRGB BGRA, else whatever the surface lists first
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space
        })
        .or_else(|| formats.first().copied())
}

/// The preferred mode if advertised; FIFO is always supported
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// Surface extent, or the window size clamped when the surface leaves it to us
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }

    let min = capabilities.min_image_extent;
    let max = capabilities.max_image_extent;
    vk::Extent2D {
        width: window.width.max(min.width).min(max.width),
        height: window.height.max(min.height).min(max.height),
    }
}

/// One more than the minimum, capped when the surface has a maximum
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

fn choose_composite_alpha(supported: vk::CompositeAlphaFlagsKHR) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::INHERIT,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
    ]
    .into_iter()
    .find(|&mode| supported.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Everything negotiated for one swapchain build
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainDescriptor {
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub present_mode: vk::PresentModeKHR,
    pub sharing_mode: vk::SharingMode,
    pub queue_family_indices: Vec<u32>,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
}

impl SwapchainDescriptor {
    pub fn negotiate(
        support: &SurfaceSupport,
        window_extent: vk::Extent2D,
        queue_families: &ResolvedQueueFamilies,
        preferred_present_mode: vk::PresentModeKHR,
    ) -> RenderResult<Self> {
        let caps = &support.capabilities;
        let format = choose_surface_format(&support.formats).ok_or_else(no_formats)?;
        let (sharing_mode, queue_family_indices) = queue_families.image_sharing();

        Ok(Self {
            format,
            extent: choose_extent(caps, window_extent),
            image_count: choose_image_count(caps),
            present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
            sharing_mode,
            queue_family_indices,
            pre_transform: caps.current_transform,
            composite_alpha: choose_composite_alpha(caps.supported_composite_alpha),
        })
    }

    pub fn is_zero_area(&self) -> bool {
        self.extent.width == 0 || self.extent.height == 0
    }
}

/// Result of asking for the next image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Ready { image_index: u32, suboptimal: bool },
    /// Out of date; nothing was signalled
    Stale,
}

/// Result of queueing an image for presentation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented or dropped, but the chain no longer matches the surface
    Stale,
}

fn classify_status(status: vk::Result, operation: &'static str, timeout: Duration) -> RenderError {
    match status {
        vk::Result::ERROR_OUT_OF_DATE_KHR => RenderError::SwapchainStale,
        vk::Result::TIMEOUT | vk::Result::NOT_READY => RenderError::SynchronizationTimeout {
            what: operation.to_string(),
            timeout,
        },
        status => RenderError::backend(operation)(status),
    }
}

pub fn interpret_acquire(
    result: Result<(u32, bool), vk::Result>,
    timeout: Duration,
) -> RenderResult<AcquireOutcome> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Ready {
            image_index,
            suboptimal,
        }),
        Err(status) => match classify_status(status, "swapchain image acquire", timeout) {
            RenderError::SwapchainStale => Ok(AcquireOutcome::Stale),
            e => Err(e),
        },
    }
}

pub fn interpret_present(result: Result<bool, vk::Result>) -> RenderResult<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) => Ok(PresentOutcome::Stale),
        Err(status) => match classify_status(status, "queue present", Duration::ZERO) {
            RenderError::SwapchainStale => Ok(PresentOutcome::Stale),
            e => Err(e),
        },
    }
}

/// One swapchain image with the objects built on top of it
pub struct PresentableImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
}

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub loader: SwapchainLoader,
    pub images: Vec<PresentableImage>,
    pub descriptor: SwapchainDescriptor,
    depth: Option<DepthBuffer>,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    pub fn create(
        device: Arc<VulkanDevice>,
        surface: &Surface,
        descriptor: SwapchainDescriptor,
        render_pass: &RenderPass,
    ) -> RenderResult<Self> {
        log::info!(
            "Creating swapchain: {}x{}, {:?}, {} images requested",
            descriptor.extent.width,
            descriptor.extent.height,
            descriptor.present_mode,
            descriptor.image_count
        );

        let loader = SwapchainLoader::new(&device.instance.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(descriptor.image_count)
            .image_format(descriptor.format.format)
            .image_color_space(descriptor.format.color_space)
            .image_extent(descriptor.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(descriptor.sharing_mode)
            .queue_family_indices(&descriptor.queue_family_indices)
            .pre_transform(descriptor.pre_transform)
            .composite_alpha(descriptor.composite_alpha)
            .present_mode(descriptor.present_mode)
            .clipped(true);

        let handle = unsafe { loader.create_swapchain(&create_info, None) }
            .map_err(RenderError::creation("swapchain"))?;

        // Partially built chains are released by Drop
        let mut swapchain = Self {
            handle,
            loader,
            images: Vec::new(),
            descriptor,
            depth: None,
            device: device.clone(),
        };

        let images = unsafe { swapchain.loader.get_swapchain_images(handle) }
            .map_err(RenderError::backend("swapchain image query"))?;
        log::info!("Created swapchain with {} images", images.len());

        let depth = swapchain.depth.insert(DepthBuffer::new(
            device.clone(),
            render_pass.depth_format,
            swapchain.descriptor.extent,
        )?);
        let depth_view = depth.view;

        for image in images {
            let view = create_color_view(&device, image, swapchain.descriptor.format.format)?;
            let framebuffer = match create_framebuffer(
                &device,
                render_pass.handle,
                &[view, depth_view],
                swapchain.descriptor.extent,
            ) {
                Ok(framebuffer) => framebuffer,
                Err(e) => {
                    unsafe { device.device.destroy_image_view(view, None) };
                    return Err(e);
                }
            };

            swapchain.images.push(PresentableImage {
                image,
                view,
                framebuffer,
            });
        }

        Ok(swapchain)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.descriptor.extent
    }

    pub fn format(&self) -> vk::Format {
        self.descriptor.format.format
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.images[image_index as usize].framebuffer
    }

    /// Acquire next image, signalling `semaphore` when it's ready
    pub fn acquire_next_image(
        &self,
        timeout: Duration,
        semaphore: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.handle,
                timeout_nanos(timeout),
                semaphore,
                vk::Fence::null(),
            )
        };
        interpret_acquire(result, timeout)
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> RenderResult<PresentOutcome> {
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        interpret_present(unsafe { self.loader.queue_present(queue, &present_info) })
    }
}

fn create_color_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
) -> RenderResult<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&create_info, None) }
        .map_err(RenderError::creation("swapchain image view"))
}

fn create_framebuffer(
    device: &VulkanDevice,
    render_pass: vk::RenderPass,
    attachments: &[vk::ImageView],
    extent: vk::Extent2D,
) -> RenderResult<vk::Framebuffer> {
    let framebuffer_info = vk::FramebufferCreateInfo::builder()
        .render_pass(render_pass)
        .attachments(attachments)
        .width(extent.width)
        .height(extent.height)
        .layers(1);

    unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
        .map_err(RenderError::creation("framebuffer"))
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for image in self.images.drain(..) {
                self.device.device.destroy_framebuffer(image.framebuffer, None);
                self.device.device.destroy_image_view(image.view, None);
            }
        }
        self.depth = None;
        unsafe { self.loader.destroy_swapchain(self.handle, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(
        current: (u32, u32),
        min: (u32, u32),
        max: (u32, u32),
        images: (u32, u32),
    ) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            min_image_count: images.0,
            max_image_count: images.1,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            ..Default::default()
        }
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn surface_format(format: vk::Format) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR {
            format,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }
    }

    #[test]
    fn srgb_format_preferred_when_listed() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            PREFERRED_FORMAT,
        ];
        assert_eq!(choose_surface_format(&formats), Some(PREFERRED_FORMAT));
    }

    #[test]
    fn first_format_used_otherwise() {
        let formats = [
            surface_format(vk::Format::R8G8B8A8_UNORM),
            surface_format(vk::Format::B8G8R8A8_UNORM),
        ];
        assert_eq!(
            choose_surface_format(&formats).map(|f| f.format),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn preferred_present_mode_or_fifo() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO
        );
        assert_eq!(
            choose_present_mode(&modes, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn current_extent_wins_unless_sentinel() {
        let fixed = caps((1920, 1080), (1, 1), (4096, 4096), (2, 8));
        assert_eq!(choose_extent(&fixed, extent(800, 600)), extent(1920, 1080));

        let free = caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096), (2, 8));
        assert_eq!(choose_extent(&free, extent(800, 600)), extent(800, 600));
    }

    #[test]
    fn window_extent_is_clamped_into_surface_bounds() {
        let free = caps((u32::MAX, u32::MAX), (100, 100), (1920, 1080), (2, 8));
        assert_eq!(choose_extent(&free, extent(5000, 50)), extent(1920, 100));
    }

    #[test]
    fn image_count_is_min_plus_one_capped_by_max() {
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (2, 8))), 3);
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (2, 2))), 2);
        // Zero max means unbounded
        assert_eq!(choose_image_count(&caps((1, 1), (1, 1), (1, 1), (3, 0))), 4);
    }

    #[test]
    fn negotiate_combines_choices() {
        let support = SurfaceSupport {
            capabilities: caps((u32::MAX, u32::MAX), (1, 1), (4096, 4096), (2, 0)),
            formats: vec![surface_format(vk::Format::R8G8B8A8_UNORM), PREFERRED_FORMAT],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let split = ResolvedQueueFamilies {
            graphics: 0,
            transfer: 0,
            present: 2,
        };

        let desc = SwapchainDescriptor::negotiate(
            &support,
            extent(640, 480),
            &split,
            vk::PresentModeKHR::MAILBOX,
        )
        .unwrap();

        assert_eq!(desc.format, PREFERRED_FORMAT);
        assert_eq!(desc.extent, extent(640, 480));
        assert_eq!(desc.image_count, 3);
        assert_eq!(desc.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!(desc.sharing_mode, vk::SharingMode::CONCURRENT);
        assert_eq!(desc.queue_family_indices, vec![0, 2]);
        assert_eq!(desc.composite_alpha, vk::CompositeAlphaFlagsKHR::OPAQUE);
        assert!(!desc.is_zero_area());
    }

    #[test]
    fn minimized_surface_gives_zero_area() {
        let support = SurfaceSupport {
            capabilities: caps((0, 0), (0, 0), (4096, 4096), (2, 0)),
            formats: vec![PREFERRED_FORMAT],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };
        let shared = ResolvedQueueFamilies {
            graphics: 0,
            transfer: 0,
            present: 0,
        };
        let desc = SwapchainDescriptor::negotiate(
            &support,
            extent(0, 0),
            &shared,
            vk::PresentModeKHR::FIFO,
        )
        .unwrap();
        assert!(desc.is_zero_area());
        assert_eq!(desc.sharing_mode, vk::SharingMode::EXCLUSIVE);
        assert!(desc.queue_family_indices.is_empty());
    }

    #[test]
    fn empty_support_lists_fail_creation() {
        let no_formats = SurfaceSupport {
            present_modes: vec![vk::PresentModeKHR::FIFO],
            ..Default::default()
        };
        assert!(matches!(
            no_formats.validate(),
            Err(RenderError::ResourceCreationFailure { .. })
        ));

        let no_modes = SurfaceSupport {
            formats: vec![PREFERRED_FORMAT],
            ..Default::default()
        };
        assert!(matches!(
            no_modes.validate(),
            Err(RenderError::ResourceCreationFailure { .. })
        ));
    }

    #[test]
    fn acquire_results_map_to_outcomes() {
        let timeout = Duration::from_millis(5);
        assert_eq!(
            interpret_acquire(Ok((2, false)), timeout).unwrap(),
            AcquireOutcome::Ready {
                image_index: 2,
                suboptimal: false
            }
        );
        assert_eq!(
            interpret_acquire(Err(vk::Result::ERROR_OUT_OF_DATE_KHR), timeout).unwrap(),
            AcquireOutcome::Stale
        );
        assert!(matches!(
            interpret_acquire(Err(vk::Result::TIMEOUT), timeout),
            Err(RenderError::SynchronizationTimeout { .. })
        ));
        assert!(interpret_acquire(Err(vk::Result::ERROR_DEVICE_LOST), timeout)
            .unwrap_err()
            .is_device_lost());
    }

    #[test]
    fn present_results_map_to_outcomes() {
        assert_eq!(interpret_present(Ok(false)).unwrap(), PresentOutcome::Presented);
        assert_eq!(interpret_present(Ok(true)).unwrap(), PresentOutcome::Stale);
        assert_eq!(
            interpret_present(Err(vk::Result::ERROR_OUT_OF_DATE_KHR)).unwrap(),
            PresentOutcome::Stale
        );
        assert!(matches!(
            interpret_present(Err(vk::Result::ERROR_SURFACE_LOST_KHR)),
            Err(RenderError::Backend { .. })
        ));
    }
}
