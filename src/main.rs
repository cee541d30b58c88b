// =============================================================================
// VITREOUS - Windowed driver for the renderer library
// =============================================================================
//
// This binary plays the window collaborator: it owns the winit window, hands
// raw handles to the render context and forwards window events to the
// render loop as signals.
//
// FRAME FLOW (per redraw):
// 1. Poll the shader watcher (if hot reload is enabled)
// 2. Tick the render loop (rebuild or draw)
// 3. Update the FPS counter in the title bar
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use vitreous_renderer::backend::shader::ShaderWatcher;
use vitreous_renderer::{Config, RenderContext, RenderLoop, Tick, WindowSignal};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting Vitreous renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new().context("Failed to create event loop")?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Level from config, RUST_LOG still wins
fn init_logging(config: &Config) {
    env_logger::Builder::new()
        .filter_level(config.log_level())
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The render loop (and with it
/// every GPU object) must go before the window it presents to.
struct App {
    render_loop: Option<RenderLoop<RenderContext>>,
    shader_watcher: Option<ShaderWatcher>,
    window: Option<Arc<Window>>,
    config: Config,
    is_fullscreen: bool,
    /// First fatal error, reported from main once the event loop returns
    fatal: Option<anyhow::Error>,
    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            render_loop: None,
            shader_watcher: None,
            window: None,
            config,
            is_fullscreen,
            fatal: None,
            fps: FpsCounter::new(),
        }
    }

    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        let size = window.inner_size();
        let extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };

        let settings = self.config.renderer_settings();
        let context = RenderContext::new(
            window.raw_display_handle(),
            window.raw_window_handle(),
            extent,
            settings,
        )
        .context("Failed to initialize Vulkan")?;

        log::info!(
            "Rendering with {} frames in flight on {}",
            context.frames_in_flight(),
            context.gpu().name()
        );

        if self.config.debug.hot_reload_shaders {
            let directory = self
                .config
                .graphics
                .vertex_shader
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            match ShaderWatcher::new(directory) {
                Ok(watcher) => self.shader_watcher = Some(watcher),
                Err(e) => log::warn!("Shader hot reload disabled: {}", e),
            }
        }

        self.render_loop = Some(RenderLoop::new(context, extent));
        Ok(())
    }

    fn signal(&mut self, signal: WindowSignal) {
        if let Some(render_loop) = self.render_loop.as_mut() {
            render_loop.handle_signal(signal);
        }
    }

    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let shaders_changed = self
            .shader_watcher
            .as_ref()
            .is_some_and(ShaderWatcher::poll);

        let Some(render_loop) = self.render_loop.as_mut() else {
            return;
        };
        if shaders_changed {
            render_loop.handle_signal(WindowSignal::ShadersChanged);
        }

        match render_loop.tick() {
            Ok(Tick::Presented | Tick::Recovered) => self.update_fps(),
            Ok(Tick::Rebuilt | Tick::Paused) => {}
            Ok(Tick::Stopped) => event_loop.exit(),
            Err(e) => {
                log::error!("Render error: {}", e);
                self.fatal = Some(anyhow::Error::new(e).context("Rendering stopped"));
                event_loop.exit();
            }
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
            // winit follows up with a Resized event
        }
    }

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(report) = self.fps.frame() else {
            return;
        };

        if let Some(ref window) = self.window {
            let mode = if self.is_fullscreen { "fullscreen" } else { "windowed" };
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{}]",
                self.config.window.title, report.fps, report.frame_ms, mode
            ));
        }
    }

    fn shutdown(&mut self) {
        self.shader_watcher = None;
        if let Some(render_loop) = self.render_loop.take() {
            // Waits idle, then the context releases everything
            drop(render_loop.into_target());
            log::info!("Cleanup complete");
        }
    }
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsReport {
    fps: f32,
    frame_ms: f32,
}

struct FpsCounter {
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl FpsCounter {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Count a frame; yields a report about once per second
    fn frame(&mut self) -> Option<FpsReport> {
        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return None;
        }

        let report = FpsReport {
            fps: self.frame_count as f32 / elapsed,
            frame_ms: frame_time * 1000.0,
        };
        self.frame_count = 0;
        self.last_fps_update = now;
        Some(report)
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes =
                window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {}", e);
                self.fatal = Some(anyhow::anyhow!("Failed to create window: {}", e));
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("{:#}", e);
            self.fatal = Some(e);
            event_loop.exit();
            return;
        }

        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                self.signal(WindowSignal::CloseRequested);
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                self.signal(WindowSignal::Resized {
                    width: size.width,
                    height: size.height,
                });
            }

            // Back on screen; the surface may have changed while hidden
            WindowEvent::Occluded(false) => self.signal(WindowSignal::Exposed),

            WindowEvent::RedrawRequested => self.redraw(event_loop),

            WindowEvent::KeyboardInput { event, .. } if event.state.is_pressed() => {
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => {
                        log::info!("ESC pressed, exiting...");
                        self.signal(WindowSignal::CloseRequested);
                        event_loop.exit();
                    }
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen(),
                    _ => {}
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws for maximum FPS.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        self.shutdown();
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
