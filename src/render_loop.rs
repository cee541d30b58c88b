// =============================================================================
// RENDER LOOP - Drives a render target once per tick
// =============================================================================
//
// Window events arrive as `WindowSignal`s and only set flags; all GPU work
// happens in `tick()`. A pending resize means this tick rebuilds instead of
// drawing. A frame that comes back stale triggers exactly one rebuild in the
// same tick.

use ash::vk;

use crate::backend::FrameOutcome;
use crate::error::RenderResult;

/// What the orchestrator needs from whatever it drives
pub trait RenderTarget {
    fn draw_frame(&mut self) -> RenderResult<FrameOutcome>;
    /// Rebuild against the given window size; callers wait idle first
    fn rebuild_swapchain(&mut self, window_extent: vk::Extent2D) -> RenderResult<RebuildOutcome>;
    fn wait_idle(&mut self) -> RenderResult<()>;
    /// Recreate the pipeline from the shader files on disk
    fn reload_pipeline(&mut self) -> RenderResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    Rebuilt,
    /// Zero-area surface; try again after the next resize
    Deferred,
}

/// Window-system events the loop reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowSignal {
    Resized { width: u32, height: u32 },
    /// Surface may have changed under us (restored, moved between outputs)
    Exposed,
    ShadersChanged,
    CloseRequested,
}

/// What a single tick did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Presented,
    /// Frame dropped or stale; the swapchain has been rebuilt
    Recovered,
    Rebuilt,
    /// Minimized; nothing to draw into
    Paused,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub skipped: u64,
    pub suboptimal: u64,
    pub rebuilds: u64,
    pub deferred_rebuilds: u64,
}

pub struct RenderLoop<T: RenderTarget> {
    target: T,
    window_extent: vk::Extent2D,
    needs_rebuild: bool,
    reload_requested: bool,
    minimized: bool,
    close_requested: bool,
    shut_down: bool,
    stats: FrameStats,
}

impl<T: RenderTarget> RenderLoop<T> {
    pub fn new(target: T, window_extent: vk::Extent2D) -> Self {
        Self {
            target,
            window_extent,
            needs_rebuild: false,
            reload_requested: false,
            minimized: window_extent.width == 0 || window_extent.height == 0,
            close_requested: false,
            shut_down: false,
            stats: FrameStats::default(),
        }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    pub fn is_minimized(&self) -> bool {
        self.minimized
    }

    pub fn is_running(&self) -> bool {
        !self.shut_down && !self.close_requested
    }

    pub fn handle_signal(&mut self, signal: WindowSignal) {
        match signal {
            WindowSignal::Resized { width, height } => {
                log::debug!("Window resized to {}x{}", width, height);
                self.window_extent = vk::Extent2D { width, height };
                self.minimized = width == 0 || height == 0;
                self.needs_rebuild = true;
            }
            WindowSignal::Exposed => {
                self.needs_rebuild = true;
            }
            WindowSignal::ShadersChanged => {
                self.reload_requested = true;
            }
            WindowSignal::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
        }
    }

    /// Advance one tick. An error is fatal: the loop has already shut down.
    pub fn tick(&mut self) -> RenderResult<Tick> {
        if !self.is_running() {
            self.shutdown();
            return Ok(Tick::Stopped);
        }

        match self.step() {
            Ok(tick) => Ok(tick),
            Err(e) => {
                log::error!("Render loop stopping: {}", e);
                self.shutdown();
                Err(e)
            }
        }
    }

    fn step(&mut self) -> RenderResult<Tick> {
        if self.reload_requested {
            self.reload_requested = false;
            self.reload_pipeline()?;
        }

        if self.minimized {
            return Ok(Tick::Paused);
        }

        if self.needs_rebuild {
            return Ok(match self.rebuild()? {
                RebuildOutcome::Rebuilt => Tick::Rebuilt,
                RebuildOutcome::Deferred => Tick::Paused,
            });
        }

        let outcome = self.target.draw_frame()?;
        match outcome {
            FrameOutcome::Presented => {
                self.stats.presented += 1;
                return Ok(Tick::Presented);
            }
            FrameOutcome::Skipped => self.stats.skipped += 1,
            FrameOutcome::Suboptimal => {
                self.stats.presented += 1;
                self.stats.suboptimal += 1;
            }
        }

        self.rebuild()?;
        Ok(Tick::Recovered)
    }

    fn rebuild(&mut self) -> RenderResult<RebuildOutcome> {
        self.target.wait_idle()?;
        let outcome = self.target.rebuild_swapchain(self.window_extent)?;

        match outcome {
            RebuildOutcome::Rebuilt => {
                self.stats.rebuilds += 1;
                self.needs_rebuild = false;
            }
            RebuildOutcome::Deferred => {
                // Keep the request; it's retried once the window has area again
                self.stats.deferred_rebuilds += 1;
                self.needs_rebuild = true;
                self.minimized = true;
            }
        }
        Ok(outcome)
    }

    fn reload_pipeline(&mut self) -> RenderResult<()> {
        self.target.wait_idle()?;
        match self.target.reload_pipeline() {
            Ok(()) => {
                log::info!("Shaders reloaded");
                Ok(())
            }
            Err(e) if e.is_device_lost() => Err(e),
            Err(e) => {
                log::warn!("Shader reload failed, keeping previous pipeline: {}", e);
                Ok(())
            }
        }
    }

    /// Wait for the GPU before anything is released. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Err(e) = self.target.wait_idle() {
            log::warn!("Wait idle during shutdown failed: {}", e);
        }
        log::info!(
            "Render loop finished: {} presented, {} skipped, {} rebuilds",
            self.stats.presented,
            self.stats.skipped,
            self.stats.rebuilds
        );
    }

    /// Shut down and hand back the target for orderly destruction
    pub fn into_target(mut self) -> T {
        self.shutdown();
        self.target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RenderError;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Draw,
        WaitIdle,
        Rebuild(u32, u32),
        Reload,
    }

    #[derive(Default)]
    struct MockTarget {
        events: Vec<Event>,
        draws: VecDeque<RenderResult<FrameOutcome>>,
        reload_fails: bool,
    }

    impl RenderTarget for MockTarget {
        fn draw_frame(&mut self) -> RenderResult<FrameOutcome> {
            self.events.push(Event::Draw);
            self.draws.pop_front().unwrap_or(Ok(FrameOutcome::Presented))
        }

        fn rebuild_swapchain(&mut self, extent: vk::Extent2D) -> RenderResult<RebuildOutcome> {
            self.events.push(Event::Rebuild(extent.width, extent.height));
            if extent.width == 0 || extent.height == 0 {
                Ok(RebuildOutcome::Deferred)
            } else {
                Ok(RebuildOutcome::Rebuilt)
            }
        }

        fn wait_idle(&mut self) -> RenderResult<()> {
            self.events.push(Event::WaitIdle);
            Ok(())
        }

        fn reload_pipeline(&mut self) -> RenderResult<()> {
            self.events.push(Event::Reload);
            if self.reload_fails {
                Err(RenderError::ShaderLoad {
                    path: "shaders/quad.frag.spv".into(),
                    source: std::io::ErrorKind::NotFound.into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn render_loop() -> RenderLoop<MockTarget> {
        RenderLoop::new(
            MockTarget::default(),
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        )
    }

    fn rebuild_count(events: &[Event]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, Event::Rebuild(..)))
            .count()
    }

    #[test]
    fn resize_waits_idle_and_rebuilds_before_next_draw() {
        let mut lp = render_loop();
        assert_eq!(lp.tick().unwrap(), Tick::Presented);

        lp.handle_signal(WindowSignal::Resized {
            width: 1024,
            height: 768,
        });
        assert_eq!(lp.tick().unwrap(), Tick::Rebuilt);
        assert_eq!(lp.tick().unwrap(), Tick::Presented);

        assert_eq!(
            lp.target().events,
            vec![
                Event::Draw,
                Event::WaitIdle,
                Event::Rebuild(1024, 768),
                Event::Draw
            ]
        );
        assert_eq!(lp.stats().rebuilds, 1);
    }

    #[test]
    fn skipped_frame_triggers_exactly_one_rebuild() {
        let mut lp = render_loop();
        lp.target_mut().draws.push_back(Ok(FrameOutcome::Skipped));

        assert_eq!(lp.tick().unwrap(), Tick::Recovered);
        assert_eq!(lp.tick().unwrap(), Tick::Presented);

        let events = &lp.target().events;
        assert_eq!(rebuild_count(events), 1);
        assert_eq!(events[0], Event::Draw);
        assert_eq!(events[1], Event::WaitIdle);
        assert_eq!(lp.stats().skipped, 1);
        assert_eq!(lp.stats().presented, 1);
    }

    #[test]
    fn suboptimal_frame_counts_as_presented_and_rebuilds() {
        let mut lp = render_loop();
        lp.target_mut().draws.push_back(Ok(FrameOutcome::Suboptimal));

        assert_eq!(lp.tick().unwrap(), Tick::Recovered);
        assert_eq!(rebuild_count(&lp.target().events), 1);
        assert_eq!(lp.stats().presented, 1);
        assert_eq!(lp.stats().suboptimal, 1);
    }

    #[test]
    fn minimized_window_pauses_until_restored() {
        let mut lp = render_loop();
        lp.handle_signal(WindowSignal::Resized {
            width: 0,
            height: 0,
        });
        assert!(lp.is_minimized());
        assert_eq!(lp.tick().unwrap(), Tick::Paused);
        assert_eq!(lp.tick().unwrap(), Tick::Paused);
        assert!(lp.target().events.is_empty());

        lp.handle_signal(WindowSignal::Resized {
            width: 640,
            height: 480,
        });
        assert_eq!(lp.tick().unwrap(), Tick::Rebuilt);
        assert_eq!(lp.tick().unwrap(), Tick::Presented);
    }

    #[test]
    fn deferred_rebuild_is_retried_later() {
        let mut lp = RenderLoop::new(
            MockTarget::default(),
            vk::Extent2D {
                width: 0,
                height: 600,
            },
        );
        lp.handle_signal(WindowSignal::Exposed);
        // Zero width still counts as minimized
        assert_eq!(lp.tick().unwrap(), Tick::Paused);

        lp.handle_signal(WindowSignal::Resized {
            width: 300,
            height: 200,
        });
        assert_eq!(lp.tick().unwrap(), Tick::Rebuilt);
        assert_eq!(lp.target().events.last(), Some(&Event::Rebuild(300, 200)));
    }

    #[test]
    fn shutdown_waits_idle_once() {
        let mut lp = render_loop();
        lp.handle_signal(WindowSignal::CloseRequested);
        assert!(!lp.is_running());

        assert_eq!(lp.tick().unwrap(), Tick::Stopped);
        lp.shutdown();
        assert_eq!(lp.tick().unwrap(), Tick::Stopped);

        let target = lp.into_target();
        assert_eq!(target.events, vec![Event::WaitIdle]);
    }

    #[test]
    fn fatal_error_stops_the_loop() {
        let mut lp = render_loop();
        lp.target_mut()
            .draws
            .push_back(Err(RenderError::SynchronizationTimeout {
                what: "frame slot 0 fence".into(),
                timeout: Duration::from_millis(2000),
            }));

        assert!(lp.tick().is_err());
        assert!(!lp.is_running());
        assert_eq!(lp.tick().unwrap(), Tick::Stopped);
        assert_eq!(lp.target().events, vec![Event::Draw, Event::WaitIdle]);
    }

    #[test]
    fn shader_change_reloads_after_idle_wait() {
        let mut lp = render_loop();
        lp.handle_signal(WindowSignal::ShadersChanged);
        assert_eq!(lp.tick().unwrap(), Tick::Presented);
        assert_eq!(
            lp.target().events,
            vec![Event::WaitIdle, Event::Reload, Event::Draw]
        );
    }

    #[test]
    fn failed_reload_keeps_rendering() {
        let mut lp = render_loop();
        lp.target_mut().reload_fails = true;
        lp.handle_signal(WindowSignal::ShadersChanged);
        assert_eq!(lp.tick().unwrap(), Tick::Presented);
        assert!(lp.is_running());
    }
}
