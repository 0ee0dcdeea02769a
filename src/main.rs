// =============================================================================
// SWAPFRAME - Windowed driver for the Vulkan frame core
// =============================================================================
//
// Opens a window, selects a GPU, and runs the frame loop: every redraw is a
// begin/end pair that clears the swapchain image and presents it.
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit event loop (resize, keys, redraw)                        │
// │    └── RenderContext (frame cursor, begin/end frame)            │
// │          ├── Swapchain + depth buffer                           │
// │          ├── FrameSync (fences, semaphores, image owners)       │
// │          └── VulkanDevice (instance, surface, queues, pools)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Resize events only record the new size
// 2. frame_begin: apply pending resize, wait slot fence, acquire, record
// 3. frame_end: submit, present, advance frame slot
//
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use log::LevelFilter;
use swapframe::{Config, RenderContext, RenderError, VulkanDevice};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting swapframe");
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

    if let Some(error) = app.fatal.take() {
        return Err(error).context("Render loop stopped");
    }
    Ok(())
}

/// Level from config; `RUST_LOG` wins when set
fn init_logging(config: &Config) {
    let level = config
        .debug
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or(LevelFilter::Info);

    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// IMPORTANT: Field order matters for Drop! The render context owns the
/// surface, which must go before the window it was created from.
struct App {
    config: Config,

    render: Option<RenderContext<VulkanDevice>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,

    /// Error that ended the event loop, reported from main
    fatal: Option<RenderError>,

    // FPS tracking
    presented_since_update: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        let now = Instant::now();
        Self {
            config,
            render: None,
            window: None,
            is_fullscreen,
            fatal: None,
            presented_since_update: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    fn init_vulkan(&self, window: &Window) -> Result<RenderContext<VulkanDevice>> {
        let device = VulkanDevice::new(
            window,
            &self.config.window.title,
            self.config.debug.validation_layers,
            &self.config.device_requirements(),
        )
        .context("Failed to create Vulkan device")?;

        let size = window.inner_size();
        let render = RenderContext::create(
            device,
            size.width,
            size.height,
            self.config.frame_settings(),
        )
        .context("Failed to create render context")?;

        Ok(render)
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    /// One begin/end pair. `Ok(true)` when an image reached the screen.
    fn render_frame(&mut self) -> Result<bool, RenderError> {
        let Some(render) = self.render.as_mut() else {
            return Ok(false);
        };

        if !render.frame_begin()? {
            return Ok(false);
        }

        // Draw calls would be recorded into render.current_command_buffer()
        // here; the pass itself only clears.

        render.frame_end()
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        let Some(window) = self.window.as_ref() else {
            return;
        };
        self.is_fullscreen = !self.is_fullscreen;
        window.set_fullscreen(self.is_fullscreen.then_some(Fullscreen::Borderless(None)));
        log::info!("Fullscreen: {}", self.is_fullscreen);
        // The Resized event that follows schedules the swapchain rebuild
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    /// Called for presented frames only; skipped frames do not count.
    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }

        let now = Instant::now();
        let frame_ms = now.duration_since(self.last_frame_time).as_secs_f32() * 1000.0;
        self.last_frame_time = now;
        self.presented_since_update += 1;

        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        if elapsed < 1.0 {
            return;
        }
        let fps = self.presented_since_update as f32 / elapsed;
        self.presented_since_update = 0;
        self.last_fps_update = now;

        if let Some(window) = self.window.as_ref() {
            window.set_title(&format!(
                "{} | {:.0} presents/s, last {:.1}ms",
                self.config.window.title, fps, frame_ms
            ));
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut render) = self.render.take() {
            let stats = render.stats();
            log::info!(
                "Frames presented: {}, skipped: {}, swapchain rebuilds: {}",
                stats.frames_presented,
                stats.frames_skipped,
                stats.swapchain_recreations
            );
            render.shutdown();
        }
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

        // Create window with settings from config
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
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        match self.init_vulkan(&window) {
            Ok(render) => self.render = Some(render),
            Err(e) => {
                log::error!("Failed to initialize Vulkan: {:?}", e);
                event_loop.exit();
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(render) = self.render.as_mut() {
                    render.on_resize(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error ({:?}): {}", e.kind(), e);
                    self.fatal = Some(e);
                    self.shutdown();
                    event_loop.exit();
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                self.shutdown();
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    /// Request continuous redraws
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}
