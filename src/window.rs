// Window abstraction consumed by the GPU layer
//
// The renderer only needs three things from a window: native handles for
// surface creation, the current pixel size and whether it's still open.
// Resize notifications are delivered through callbacks registered on the
// shared `WindowState`.

use parking_lot::Mutex;
use raw_window_handle::{
    DisplayHandle, HandleError, HasDisplayHandle, HasWindowHandle, WindowHandle,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

pub type ResizeCallback = Box<dyn Fn(u32, u32) + Send + Sync>;

pub trait Window: HasWindowHandle + HasDisplayHandle + Send + Sync {
    /// Drawable size in physical pixels.
    fn pixel_size(&self) -> (u32, u32);

    fn is_open(&self) -> bool;

    fn on_resize(&self, callback: ResizeCallback);
}

/// Size/open bookkeeping shared by window implementations.
pub struct WindowState {
    width: AtomicU32,
    height: AtomicU32,
    open: AtomicBool,
    callbacks: Mutex<Vec<ResizeCallback>>,
}

impl WindowState {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: AtomicU32::new(width),
            height: AtomicU32::new(height),
            open: AtomicBool::new(true),
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn size(&self) -> (u32, u32) {
        (
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Record a new size and notify listeners. No-op if unchanged.
    pub fn resize(&self, width: u32, height: u32) {
        if self.size() == (width, height) {
            return;
        }
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);

        for callback in self.callbacks.lock().iter() {
            callback(width, height);
        }
    }

    pub fn add_callback(&self, callback: ResizeCallback) {
        self.callbacks.lock().push(callback);
    }
}

/// Window with no native backing, for offscreen use and tests.
pub struct HeadlessWindow {
    state: WindowState,
}

impl HeadlessWindow {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: WindowState::new(width, height),
        }
    }

    pub fn state(&self) -> &WindowState {
        &self.state
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.state.resize(width, height);
    }

    pub fn close(&self) {
        self.state.close();
    }
}

impl HasWindowHandle for HeadlessWindow {
    fn window_handle(&self) -> Result<WindowHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl HasDisplayHandle for HeadlessWindow {
    fn display_handle(&self) -> Result<DisplayHandle<'_>, HandleError> {
        Err(HandleError::Unavailable)
    }
}

impl Window for HeadlessWindow {
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn resize_fires_callbacks_once_per_change() {
        let window = HeadlessWindow::new(640, 480);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        window.on_resize(Box::new(move |w, h| sink.lock().push((w, h))));

        window.resize(800, 600);
        window.resize(800, 600);
        window.resize(0, 0);

        assert_eq!(*seen.lock(), vec![(800, 600), (0, 0)]);
        assert_eq!(window.pixel_size(), (0, 0));
    }

    #[test]
    fn headless_window_has_no_native_handles() {
        let window = HeadlessWindow::new(1, 1);
        assert!(window.window_handle().is_err());
        assert!(window.display_handle().is_err());
        window.close();
        assert!(!window.is_open());
    }
}
