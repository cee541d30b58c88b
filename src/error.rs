//! Error types for the rendering subsystem.
//!
//! Fatal conditions travel through [`RenderError`]. A stale swapchain is a
//! recoverable signal: the frame synchronizer turns it into a
//! [`FrameOutcome`](crate::backend::frame::FrameOutcome) and it never reaches
//! callers of the render loop.

use ash::vk;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RenderError {
    /// No GPU was reported, or none cleared the baseline suitability score.
    #[error("No usable GPU: {reason}")]
    DeviceUnavailable { reason: String },

    /// A required queue family role or device extension is missing.
    #[error("Required capability missing: {capability}")]
    CapabilityMissing { capability: String },

    /// A create call returned a non-success status.
    #[error("Failed to create {resource}: {status}")]
    ResourceCreationFailure {
        resource: &'static str,
        status: vk::Result,
    },

    /// Acquire or present reported the swapchain out of date or suboptimal.
    #[error("Swapchain is stale and must be rebuilt")]
    SwapchainStale,

    /// A fence or acquire wait exceeded its bound.
    #[error("Timed out after {timeout:?} waiting for {what}")]
    SynchronizationTimeout { what: String, timeout: Duration },

    /// Any other non-success status from the API (submit, present, idle, device lost).
    #[error("{operation} failed: {status}")]
    Backend {
        operation: &'static str,
        status: vk::Result,
    },

    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("GPU allocation failed: {0}")]
    Allocation(#[from] gpu_allocator::AllocationError),

    #[error("Failed to read shader {path:?}: {source}")]
    ShaderLoad {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    /// Shorthand for mapping a create-call status.
    pub fn creation(resource: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |status| Self::ResourceCreationFailure { resource, status }
    }

    /// Shorthand for mapping a non-create call status.
    pub fn backend(operation: &'static str) -> impl FnOnce(vk::Result) -> Self {
        move |status| Self::Backend { operation, status }
    }

    pub fn capability(capability: impl Into<String>) -> Self {
        Self::CapabilityMissing {
            capability: capability.into(),
        }
    }

    /// The backend status code carried by this error, if any.
    pub fn status(&self) -> Option<vk::Result> {
        match self {
            Self::ResourceCreationFailure { status, .. } | Self::Backend { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }

    /// Whether the error means the device can no longer be trusted.
    pub fn is_device_lost(&self) -> bool {
        matches!(self, Self::SynchronizationTimeout { .. })
            || self.status() == Some(vk::Result::ERROR_DEVICE_LOST)
    }
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;
