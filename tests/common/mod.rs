#![allow(dead_code)]

use hf_gpu::{
    Attachment, ClearValue, Device, FrameContext, HeadlessBackend, HeadlessWindow, PresentStatus, Renderer,
    RendererSettings, RenderpassInfo, WindowId,
};
use std::sync::Arc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct Harness {
    pub backend: Arc<HeadlessBackend>,
    pub window: Arc<HeadlessWindow>,
    pub renderer: Renderer,
    pub id: WindowId,
}

pub fn harness() -> Harness {
    harness_with(RendererSettings::default(), 1280, 720)
}

pub fn harness_with(settings: RendererSettings, width: u32, height: u32) -> Harness {
    init_logging();
    let backend = Arc::new(HeadlessBackend::new());
    let device = Device::new(backend.clone(), settings.device.clone()).unwrap();
    let mut renderer = Renderer::new(Arc::new(device), settings).unwrap();
    let window = Arc::new(HeadlessWindow::new(width, height));
    let id = renderer.register_window(window.clone()).unwrap();
    Harness {
        backend,
        window,
        renderer,
        id,
    }
}

/// Clear the backbuffer once.
pub fn record_clear(frame: FrameContext<'_>) {
    let FrameContext { cmd, backbuffer, .. } = frame;
    let info = RenderpassInfo::new().colour(Attachment::clear(backbuffer, ClearValue::colour(0.0, 0.0, 0.0, 1.0)));
    cmd.begin_renderpass(&info).unwrap();
    cmd.end_renderpass().unwrap();
}

impl Harness {
    /// One full frame. `None` when begin_frame decided to skip.
    pub fn run_frame(&mut self) -> Option<PresentStatus> {
        run_frame(&mut self.renderer, self.id)
    }

    pub fn frame_index(&self) -> u32 {
        self.renderer.swapchain(self.id).unwrap().current_frame_index()
    }

    pub fn recreations(&self) -> u32 {
        self.renderer.swapchain(self.id).unwrap().recreation_count()
    }

    pub fn assert_clean(&self) {
        let errors = self.backend.validation_errors();
        assert!(errors.is_empty(), "validation errors: {errors:#?}");
    }
}

pub fn run_frame(renderer: &mut Renderer, id: WindowId) -> Option<PresentStatus> {
    if !renderer.begin_frame(id).unwrap() {
        return None;
    }
    record_clear(renderer.frame(id).unwrap());
    Some(renderer.end_frame(id).unwrap())
}
