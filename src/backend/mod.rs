// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash with safety and ergonomics
// Every handle is owned by a type whose Drop releases it

pub mod buffer;
pub mod command;
pub mod depth;
pub mod device;
pub mod enumerate;
pub mod frame;
pub mod instance;
pub mod pipeline;
pub mod queue_family;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use device::VulkanDevice;
pub use enumerate::GpuDevice;
pub use frame::{FrameBackend, FrameOutcome, FrameSynchronizer};
pub use instance::VulkanInstance;
pub use queue_family::{QueueFamilyIndices, ResolvedQueueFamilies};
pub use surface::Surface;
pub use swapchain::{Swapchain, SwapchainDescriptor};
