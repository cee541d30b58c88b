//! Device selection, swapchain lifecycle and frame pacing on top of `ash`.
//!
//! [`RenderContext`] owns every GPU object and is driven by a
//! [`RenderLoop`]. The window itself stays with the caller, who hands over
//! raw handles and forwards window events as [`WindowSignal`]s.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod render_loop;

pub use backend::FrameOutcome;
pub use config::{Config, RendererSettings};
pub use context::RenderContext;
pub use error::{RenderError, RenderResult};
pub use render_loop::{FrameStats, RebuildOutcome, RenderLoop, RenderTarget, Tick, WindowSignal};
