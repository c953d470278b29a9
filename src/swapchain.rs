// Swapchain state machine
//
// Valid -> Stale when present/acquire report suboptimal or out-of-date, the
// window size no longer matches what the chain was built for, or settings
// changed. Stale -> Recreating -> Valid on the next acquire. Recreation is
// a full destroy and rebuild bracketed by device idle waits.
//
// The frame counter (which per-frame resources to use) and the acquired
// image index (which backbuffer to draw into) are deliberately separate:
// outside FIFO the driver may hand back images in any order.

use ash::vk;
use std::sync::Arc;

use crate::backend::{Backend, RawSwapchain, SwapchainCreateDesc};
use crate::error::{GpuError, GpuResult};
use crate::format::Format;
use crate::resource::Texture;
use crate::sync::Semaphore;
use crate::window::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SwapchainSettings {
    pub vsync: bool,
    /// Requested image count, clamped to what the surface allows.
    /// `None` means one more than the surface minimum.
    pub image_count: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapchainState {
    Valid,
    Stale,
    Recreating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentStatus {
    Presented,
    /// Presented, but the chain will be rebuilt on the next acquire.
    Suboptimal,
    /// Not presented; the chain will be rebuilt on the next acquire.
    OutOfDate,
    /// No image was acquired this frame so nothing was presented.
    Skipped,
}

/// Presentable surface bound to one window.
pub struct Surface {
    pub(crate) handle: vk::SurfaceKHR,
    pub(crate) present_family: u32,
    pub(crate) window: Arc<dyn Window>,
}

impl Surface {
    pub fn raw(&self) -> vk::SurfaceKHR {
        self.handle
    }

    pub fn present_family(&self) -> u32 {
        self.present_family
    }

    pub fn window(&self) -> &Arc<dyn Window> {
        &self.window
    }
}

pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    let preferred = vk::SurfaceFormatKHR {
        format: vk::Format::B8G8R8A8_SRGB,
        color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
    };

    // A lone UNDEFINED entry means the surface takes anything
    if formats.is_empty()
        || (formats.len() == 1 && formats[0].format == vk::Format::UNDEFINED)
    {
        return preferred;
    }

    formats
        .iter()
        .copied()
        .find(|f| f.format == preferred.format && f.color_space == preferred.color_space)
        .or_else(|| {
            formats
                .iter()
                .copied()
                .find(|f| f.format == vk::Format::R8G8B8A8_SRGB)
        })
        .unwrap_or(formats[0])
}

/// FIFO for vsync. Otherwise the lowest-latency mode available, falling
/// back to FIFO which is always supported.
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], vsync: bool) -> vk::PresentModeKHR {
    if vsync {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window_size: (u32, u32)) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }
    vk::Extent2D {
        width: window_size
            .0
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window_size
            .1
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR, requested: Option<u32>) -> u32 {
    let min = caps.min_image_count.max(1);
    let count = requested.unwrap_or(min + 1).max(min);
    // Zero max means no upper limit
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub struct Swapchain {
    backend: Arc<dyn Backend>,
    surface: vk::SurfaceKHR,
    window: Arc<dyn Window>,
    graphics_family: u32,
    present_family: u32,
    acquire_timeout_ns: u64,

    settings: SwapchainSettings,
    built_settings: SwapchainSettings,
    built_window_size: (u32, u32),

    raw: Option<RawSwapchain>,
    images: Vec<Texture>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    present_mode: vk::PresentModeKHR,

    current_frame: u32,
    acquired: Option<u32>,
    state: SwapchainState,
    recreations: u32,
}

impl Swapchain {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        surface: &Surface,
        settings: SwapchainSettings,
        acquire_timeout_ns: u64,
    ) -> GpuResult<Self> {
        let graphics_family = backend.adapter().queue_families.graphics;
        let mut swapchain = Self {
            backend,
            surface: surface.handle,
            window: surface.window.clone(),
            graphics_family,
            present_family: surface.present_family,
            acquire_timeout_ns,
            settings,
            built_settings: settings,
            built_window_size: (0, 0),
            raw: None,
            images: Vec::new(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            current_frame: 0,
            acquired: None,
            state: SwapchainState::Recreating,
            recreations: 0,
        };
        swapchain.build()?;
        swapchain.state = SwapchainState::Valid;
        Ok(swapchain)
    }

    fn build(&mut self) -> GpuResult<()> {
        let window_size = self.window.pixel_size();
        let support = self.backend.surface_support(self.surface)?;
        let caps = &support.capabilities;

        let format = choose_surface_format(&support.formats);
        let present_mode = choose_present_mode(&support.present_modes, self.settings.vsync);
        let extent = choose_extent(caps, window_size);
        let image_count = choose_image_count(caps, self.settings.image_count);

        if extent.width == 0 || extent.height == 0 {
            return Err(GpuError::invalid_usage("swapchain built for a zero-sized window"));
        }

        let raw = self.backend.create_swapchain(&SwapchainCreateDesc {
            surface: self.surface,
            min_image_count: image_count,
            format,
            extent,
            present_mode,
            pre_transform: caps.current_transform,
            graphics_family: self.graphics_family,
            present_family: self.present_family,
        })?;

        self.images = raw
            .images
            .iter()
            .zip(&raw.views)
            .map(|(&image, &view)| Texture::from_swapchain(image, view, format.format, extent))
            .collect();
        self.raw = Some(raw);
        self.format = format;
        self.extent = extent;
        self.present_mode = present_mode;
        self.built_settings = self.settings;
        self.built_window_size = window_size;

        log::info!(
            "Swapchain created: {}x{}, {} images, {:?}, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            format.format,
            present_mode
        );
        Ok(())
    }

    fn destroy_raw(&mut self) {
        self.images.clear();
        if let Some(raw) = self.raw.take() {
            self.backend.destroy_swapchain(&raw);
        }
    }

    /// Rebuild the chain for the current window size and settings.
    /// False leaves the chain Stale: the surface has no area right now.
    pub fn recreate(&mut self) -> GpuResult<bool> {
        let support = self.backend.surface_support(self.surface)?;
        let extent = choose_extent(&support.capabilities, self.window.pixel_size());
        if extent.width == 0 || extent.height == 0 {
            log::debug!("Surface extent is zero, postponing swapchain rebuild");
            self.state = SwapchainState::Stale;
            return Ok(false);
        }

        self.state = SwapchainState::Recreating;
        log::info!("Recreating swapchain");

        self.backend.device_wait_idle()?;
        self.destroy_raw();
        if let Err(err) = self.build() {
            self.state = SwapchainState::Stale;
            return Err(crate::error::fatal("swapchain", err));
        }
        self.backend.device_wait_idle()?;

        self.current_frame = 0;
        self.acquired = None;
        self.recreations += 1;
        self.state = SwapchainState::Valid;
        Ok(true)
    }

    fn needs_rebuild(&self, window_size: (u32, u32)) -> bool {
        self.state != SwapchainState::Valid
            || window_size != self.built_window_size
            || self.settings != self.built_settings
    }

    /// Bring the chain up to date before a frame. False when the window
    /// has no drawable area and the frame must be skipped.
    pub fn prepare(&mut self) -> GpuResult<bool> {
        let window_size = self.window.pixel_size();
        if window_size.0 == 0 || window_size.1 == 0 {
            return Ok(false);
        }
        if self.needs_rebuild(window_size) {
            return self.recreate();
        }
        Ok(true)
    }

    /// Acquire the next image, signalling `signal` when it's ready.
    /// False means skip the frame: the window is minimised, the chain was
    /// out of date (and has been rebuilt) or the acquire timed out.
    pub fn acquire_next_image(&mut self, signal: &Semaphore) -> GpuResult<bool> {
        if !self.prepare()? {
            return Ok(false);
        }
        let Some(handle) = self.raw() else {
            return Ok(false);
        };

        match self
            .backend
            .acquire_next_image(handle, self.acquire_timeout_ns, signal.handle)
        {
            Ok(acquired) if acquired.index as usize >= self.images.len() => {
                log::warn!(
                    "Acquired image {} outside a {} image chain, rebuilding",
                    acquired.index,
                    self.images.len()
                );
                self.acquired = None;
                self.state = SwapchainState::Stale;
                Ok(false)
            }
            Ok(acquired) => {
                if acquired.suboptimal {
                    log::debug!("Swapchain suboptimal on acquire, rebuilding next frame");
                    self.state = SwapchainState::Stale;
                }
                self.acquired = Some(acquired.index);
                Ok(true)
            }
            Err(GpuError::OutOfDate) => {
                self.acquired = None;
                self.recreate()?;
                Ok(false)
            }
            Err(GpuError::Timeout) => {
                log::warn!("Timed out acquiring swapchain image");
                self.acquired = None;
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    /// Present the acquired image once `wait` signals. Advances the frame
    /// counter unless nothing was acquired.
    pub fn present(&mut self, wait: &Semaphore) -> GpuResult<PresentStatus> {
        let Some(index) = self.acquired.take() else {
            log::warn!("Present called without an acquired image, skipping");
            return Ok(PresentStatus::Skipped);
        };
        let Some(handle) = self.raw() else {
            return Ok(PresentStatus::Skipped);
        };
        if index as usize >= self.images.len() {
            log::warn!(
                "Image {} is outside a {} image chain, skipping present",
                index,
                self.images.len()
            );
            self.state = SwapchainState::Stale;
            return Ok(PresentStatus::Skipped);
        }

        let result = self
            .backend
            .queue_present(self.present_family, handle, index, wait.handle);
        self.current_frame = (self.current_frame + 1) % self.image_count().max(1);

        match result {
            Ok(false) => Ok(PresentStatus::Presented),
            Ok(true) => {
                self.state = SwapchainState::Stale;
                Ok(PresentStatus::Suboptimal)
            }
            Err(GpuError::OutOfDate) => {
                self.state = SwapchainState::Stale;
                Ok(PresentStatus::OutOfDate)
            }
            Err(err) => {
                log::error!("Failed to present swapchain image: {}", err);
                Err(err)
            }
        }
    }

    /// New settings apply at the next acquire.
    pub fn set_settings(&mut self, settings: SwapchainSettings) {
        if settings != self.settings {
            self.settings = settings;
            self.state = SwapchainState::Stale;
        }
    }

    /// Force a rebuild on the next acquire.
    pub fn invalidate(&mut self) {
        if self.state == SwapchainState::Valid {
            self.state = SwapchainState::Stale;
        }
    }

    pub fn settings(&self) -> SwapchainSettings {
        self.settings
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn image_count(&self) -> u32 {
        self.images.len() as u32
    }

    pub fn current_frame_index(&self) -> u32 {
        self.current_frame
    }

    pub fn acquired_image_index(&self) -> Option<u32> {
        self.acquired
    }

    pub fn acquired_image(&self) -> Option<&Texture> {
        self.acquired.and_then(|i| self.images.get(i as usize))
    }

    pub fn image(&self, index: u32) -> Option<&Texture> {
        self.images.get(index as usize)
    }

    pub fn format(&self) -> Format {
        Format::from_vk(self.format.format)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn recreation_count(&self) -> u32 {
        self.recreations
    }

    pub fn raw(&self) -> Option<vk::SwapchainKHR> {
        self.raw.as_ref().map(|r| r.handle)
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_raw();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::window::HeadlessWindow;

    fn headless_chain(backend: &Arc<HeadlessBackend>) -> Swapchain {
        let window = Arc::new(HeadlessWindow::new(640, 480));
        let surface = Surface {
            handle: backend.create_surface(&*window).unwrap(),
            present_family: 0,
            window,
        };
        let shared: Arc<dyn Backend> = backend.clone();
        Swapchain::new(shared, &surface, SwapchainSettings::default(), 1_000_000).unwrap()
    }

    #[test]
    fn present_of_an_index_past_the_chain_is_skipped() {
        let backend = Arc::new(HeadlessBackend::new());
        let mut chain = headless_chain(&backend);
        let wait = Semaphore::new(&*backend).unwrap();
        assert_eq!(chain.image_count(), 3);

        chain.acquired = Some(7);
        assert_eq!(chain.present(&wait).unwrap(), PresentStatus::Skipped);
        assert_eq!(chain.state(), SwapchainState::Stale);
        assert_eq!(chain.current_frame_index(), 0);
        assert_eq!(chain.acquired_image_index(), None);
        assert!(backend.presented_images().is_empty());
    }

    fn caps(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 64, height: 64 },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            ..Default::default()
        }
    }

    #[test]
    fn image_count_is_clamped_to_surface_limits() {
        assert_eq!(choose_image_count(&caps(2, 3), None), 3);
        assert_eq!(choose_image_count(&caps(2, 3), Some(8)), 3);
        assert_eq!(choose_image_count(&caps(2, 3), Some(1)), 2);
        assert_eq!(choose_image_count(&caps(3, 0), Some(6)), 6);
        assert_eq!(choose_image_count(&caps(3, 0), None), 4);
    }

    #[test]
    fn vsync_selects_fifo_otherwise_lowest_latency() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::IMMEDIATE], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn extent_follows_window_within_limits() {
        assert_eq!(
            choose_extent(&caps(2, 3), (1280, 720)),
            vk::Extent2D { width: 1280, height: 720 }
        );
        assert_eq!(
            choose_extent(&caps(2, 3), (10, 9000)),
            vk::Extent2D { width: 64, height: 4096 }
        );

        let mut fixed = caps(2, 3);
        fixed.current_extent = vk::Extent2D { width: 800, height: 600 };
        assert_eq!(
            choose_extent(&fixed, (1280, 720)),
            vk::Extent2D { width: 800, height: 600 }
        );
    }

    #[test]
    fn srgb_bgra_is_preferred() {
        let formats = [
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ];
        assert_eq!(choose_surface_format(&formats).format, vk::Format::B8G8R8A8_SRGB);
        assert_eq!(
            choose_surface_format(&formats[..1]).format,
            vk::Format::B8G8R8A8_UNORM
        );

        let anything = [vk::SurfaceFormatKHR {
            format: vk::Format::UNDEFINED,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        }];
        assert_eq!(choose_surface_format(&anything).format, vk::Format::B8G8R8A8_SRGB);
    }
}
