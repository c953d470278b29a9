// =============================================================================
// HF-GPU DEMO - clear-colour frame loop on top of the GPU layer
// =============================================================================
//
// FRAME FLOW:
// 1. winit RedrawRequested
// 2. Renderer::begin_frame (rebuilds a stale swapchain, acquires an image)
// 3. Record a clear into the frame's command list
// 4. Renderer::end_frame (submit + present)
//
// Controls (config.toml [controls]): quit, fullscreen toggle, vsync toggle.
//
// =============================================================================

use anyhow::{Context, Result};
use hf_gpu::config::Config;
use hf_gpu::input::{parse_key, InputState};
use hf_gpu::window::{ResizeCallback, WindowState};
use hf_gpu::{Attachment, ClearValue, Device, FrameContext, Renderer, RenderpassInfo, VulkanBackend, WindowId};
use raw_window_handle::{DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    // Load configuration from config.toml
    let config = Config::load();

    // Initialize logging
    init_logging(&config);
    log::info!("Starting hf-gpu demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("VSync: {}", config.graphics.vsync);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    // Structural GPU failures end up here and terminate with a non-zero status
    if let Some(err) = app.fatal.take() {
        return Err(err);
    }
    Ok(())
}

/// Level comes from config; RUST_LOG overrides it when set
fn init_logging(config: &Config) {
    use env_logger::{Builder, Env};

    Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str())).init();
}

// =============================================================================
// WINDOW SHIM
// =============================================================================

/// winit window plus the size/open flags the renderer reads.
struct AppWindow {
    window: winit::window::Window,
    state: WindowState,
}

impl AppWindow {
    fn new(window: winit::window::Window) -> Self {
        let size = window.inner_size();
        Self {
            state: WindowState::new(size.width, size.height),
            window,
        }
    }
}

impl HasWindowHandle for AppWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        self.window.window_handle()
    }
}

impl HasDisplayHandle for AppWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        self.window.display_handle()
    }
}

impl hf_gpu::Window for AppWindow {
    fn pixel_size(&self) -> (u32, u32) {
        self.state.size()
    }

    fn is_open(&self) -> bool {
        self.state.is_open()
    }

    fn on_resize(&self, callback: ResizeCallback) {
        self.state.add_callback(callback);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct Keys {
    quit: KeyCode,
    fullscreen: KeyCode,
    vsync: KeyCode,
}

impl Keys {
    fn from_config(config: &Config) -> Self {
        let key = |name: &str, fallback: KeyCode| {
            parse_key(name).unwrap_or_else(|| {
                log::warn!("Unknown key '{}', using {:?}", name, fallback);
                fallback
            })
        };
        Self {
            quit: key(&config.controls.quit_key, KeyCode::Escape),
            fullscreen: key(&config.controls.fullscreen_key, KeyCode::F11),
            vsync: key(&config.controls.vsync_key, KeyCode::KeyV),
        }
    }
}

/// IMPORTANT: the renderer must go before the window it presents to,
/// `Drop` below handles that.
struct App {
    config: Config,
    keys: Keys,
    input: InputState,

    window: Option<Arc<AppWindow>>,
    renderer: Option<Renderer>,
    window_id: Option<WindowId>,

    is_fullscreen: bool,
    vsync: bool,
    fatal: Option<anyhow::Error>,

    started: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            keys: Keys::from_config(&config),
            input: InputState::new(),
            window: None,
            renderer: None,
            window_id: None,
            is_fullscreen: config.window.fullscreen,
            vsync: config.graphics.vsync,
            fatal: None,
            started: now,
            frame_count: 0,
            last_fps_update: now,
            config,
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_gpu(&mut self, window: Arc<AppWindow>) -> Result<()> {
        log::info!("Initializing GPU layer...");

        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let backend = VulkanBackend::new(&self.config.window.title, self.config.debug.validation_layers, display)
            .context("Failed to create Vulkan backend")?;

        let settings = self.config.renderer_settings();
        let device = Device::new(Arc::new(backend), settings.device.clone()).context("Failed to create device")?;
        let features = device.supported_features();
        log::info!(
            "Sampler anisotropy: {} (max {})",
            features.sampler_anisotropy,
            features.max_sampler_anisotropy
        );

        let mut renderer = Renderer::new(Arc::new(device), settings).context("Failed to create renderer")?;
        let id = renderer
            .register_window(window.clone())
            .context("Failed to register window")?;

        self.renderer = Some(renderer);
        self.window_id = Some(id);
        self.window = Some(window);
        log::info!("GPU layer initialized successfully!");
        Ok(())
    }

    // =========================================================================
    // RENDER LOOP
    // =========================================================================

    fn clear_colour(&self) -> glam::Vec4 {
        let [r, g, b, a] = self.config.graphics.clear_color;
        let base = glam::Vec4::new(r, g, b, a);
        // Slow pulse so presentation is visibly alive
        let t = self.started.elapsed().as_secs_f32();
        let pulse = 0.85 + 0.15 * (t * 1.5).sin();
        (base.truncate() * pulse).extend(base.w)
    }

    fn render_frame(&mut self) -> Result<bool> {
        let colour = self.clear_colour();
        let (Some(renderer), Some(id)) = (self.renderer.as_mut(), self.window_id) else {
            return Ok(false);
        };

        if !renderer.begin_frame(id)? {
            return Ok(false);
        }

        {
            let FrameContext {
                cmd, backbuffer, extent, ..
            } = renderer.frame(id)?;
            let info = RenderpassInfo::new().colour(Attachment::clear(backbuffer, ClearValue::from(colour)));
            cmd.begin_renderpass(&info)?;
            cmd.set_viewport(0.0, 0.0, extent.width as f32, extent.height as f32)?;
            cmd.set_scissor(0, 0, extent.width, extent.height)?;
            cmd.end_renderpass()?;
        }

        renderer.end_frame(id)?;
        Ok(true)
    }

    /// Frame errors that aren't fatal are logged and the loop carries on.
    fn handle_gpu_error(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        let fatal = err
            .downcast_ref::<hf_gpu::GpuError>()
            .map_or(false, hf_gpu::GpuError::is_fatal);
        if fatal {
            log::error!("FATAL: {:#}", err);
            self.fatal = Some(err);
            event_loop.exit();
        } else {
            log::error!("Render error: {:#}", err);
        }
    }

    // =========================================================================
    // TOGGLES
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                // Enter fullscreen (use current monitor)
                window.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }
        }
    }

    fn toggle_vsync(&mut self) -> Result<()> {
        self.vsync = !self.vsync;
        if let (Some(renderer), Some(id)) = (self.renderer.as_mut(), self.window_id) {
            renderer.set_vsync(id, self.vsync)?;
        }
        log::info!("VSync {}", if self.vsync { "on" } else { "off" });
        Ok(())
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        self.frame_count += 1;

        let now = Instant::now();
        let elapsed = now.duration_since(self.last_fps_update).as_secs_f32();
        // Update title every second
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            if let Some(ref window) = self.window {
                let mode = if self.vsync { "vsync" } else { "no vsync" };
                window
                    .window
                    .set_title(&format!("{} - {:.0} FPS [{}]", self.config.window.title, fps, mode));
            }
            self.frame_count = 0;
            self.last_fps_update = now;
        }
    }

    fn shutdown(&mut self) {
        if let Some(window) = self.window.as_ref() {
            window.state.close();
        }
        if let Some(mut renderer) = self.renderer.take() {
            if let Err(err) = renderer.destroy() {
                log::error!("Renderer teardown failed: {}", err);
            }
        }
        self.window_id = None;
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
            .with_resizable(self.config.window.resizable)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        // Set fullscreen if configured
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(AppWindow::new(w)),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                self.fatal = Some(e.into());
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_gpu(window) {
            log::error!("FATAL: failed to initialize the GPU layer: {:#}", e);
            self.fatal = Some(e);
            event_loop.exit();
        }
    }

    /// Handle window events.
    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            // The renderer picks the new size up through the resize callback
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                if let Some(ref window) = self.window {
                    window.state.resize(size.width, size.height);
                }
            }

            WindowEvent::Focused(false) => self.input.clear(),

            WindowEvent::KeyboardInput { event, .. } => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    self.input.key_event(key, event.state);
                }

                if self.input.was_pressed(self.keys.quit) {
                    log::info!("Quit key pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                    return;
                }
                if self.input.was_pressed(self.keys.fullscreen) {
                    self.toggle_fullscreen();
                }
                if self.input.was_pressed(self.keys.vsync) {
                    if let Err(e) = self.toggle_vsync() {
                        self.handle_gpu_error(event_loop, e);
                    }
                }
                self.input.end_frame();
            }

            WindowEvent::MouseInput { state, button, .. } => self.input.mouse_button(button, state),

            WindowEvent::CursorMoved { position, .. } => {
                self.input.set_cursor(position.x as f32, position.y as f32);
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.handle_gpu_error(event_loop, e),
            },

            _ => {}
        }
    }

    /// Called when the event loop is about to block waiting for events.
    /// We use this to request continuous redraws.
    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.window.request_redraw();
        }
    }
}

// =============================================================================
// CLEANUP
// =============================================================================

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up GPU resources...");
        self.shutdown();
        log::info!("Cleanup complete");
    }
}
