// Frame orchestration
//
// Per window: acquire -> record -> submit -> present, chained with one
// image-available and one work-finished semaphore per frame slot. A frame
// slot is only reused once its command list's fence has signaled, which
// bounds the frames in flight by the swapchain image count.

use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::QueueKind;
use crate::command::{CommandList, CommandListLevel, RecordingState};
use crate::device::{Device, DeviceSettings};
use crate::error::{GpuError, GpuResult};
use crate::format::Format;
use crate::resource::{Buffer, BufferDesc, ImageLayout, Texture};
use crate::staging::UploadQueue;
use crate::swapchain::{PresentStatus, Surface, Swapchain, SwapchainSettings};
use crate::sync::Semaphore;
use crate::window::Window;

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub device: DeviceSettings,
    pub swapchain: SwapchainSettings,
    pub staging_buffer_size: u64,
}

impl Default for RendererSettings {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            swapchain: SwapchainSettings {
                vsync: true,
                image_count: None,
            },
            staging_buffer_size: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(u32);

/// Handle into the renderer's buffer table. Stale after `destroy_buffer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId {
    index: u32,
    generation: u32,
}

struct BufferSlot {
    generation: u32,
    buffer: Option<Buffer>,
}

struct WindowData {
    surface: Surface,
    swapchain: Swapchain,
    image_available: Vec<Semaphore>,
    work_finished: Vec<Semaphore>,
    command_lists: Vec<CommandList>,
    resized: Arc<AtomicBool>,
    frame_active: bool,
    frame_slot: usize,
    waits_on_uploads: bool,
}

/// What a caller records into between `begin_frame` and `end_frame`.
pub struct FrameContext<'a> {
    pub cmd: &'a mut CommandList,
    pub backbuffer: &'a Texture,
    pub extent: vk::Extent2D,
    /// Frame slot, cycling 0..image_count.
    pub frame_index: usize,
    /// Swapchain image being drawn. Not necessarily `frame_index`.
    pub image_index: u32,
}

pub struct Renderer {
    device: Arc<Device>,
    settings: RendererSettings,
    windows: Vec<Option<WindowData>>,
    uploads: Arc<UploadQueue>,
    buffers: Vec<BufferSlot>,
    destroyed: bool,
}

fn window_data(windows: &mut [Option<WindowData>], id: WindowId) -> GpuResult<&mut WindowData> {
    windows
        .get_mut(id.0 as usize)
        .and_then(Option::as_mut)
        .ok_or_else(|| GpuError::invalid_usage(format!("unknown window {:?}", id)))
}

/// Grow the per-slot arrays to the chain's image count. Never shrinks, so
/// a slot's fence history survives recreation.
fn ensure_frame_resources(device: &Device, data: &mut WindowData) -> GpuResult<()> {
    let count = data.swapchain.image_count() as usize;
    while data.image_available.len() < count {
        data.image_available.push(device.create_semaphore()?);
        data.work_finished.push(device.create_semaphore()?);
    }
    let missing = count.saturating_sub(data.command_lists.len());
    if missing > 0 {
        let lists = device.allocate_command_lists(QueueKind::Graphics, CommandListLevel::Primary, missing as u32)?;
        data.command_lists.extend(lists);
    }
    Ok(())
}

impl Renderer {
    pub fn new(device: Arc<Device>, settings: RendererSettings) -> GpuResult<Self> {
        let uploads = Arc::new(UploadQueue::new(device.clone(), settings.staging_buffer_size)?);
        Ok(Self {
            device,
            settings,
            windows: Vec::new(),
            uploads,
            buffers: Vec::new(),
            destroyed: false,
        })
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// Shared upload queue, usable from other threads.
    pub fn uploader(&self) -> Arc<UploadQueue> {
        self.uploads.clone()
    }

    pub fn register_window(&mut self, window: Arc<dyn Window>) -> GpuResult<WindowId> {
        let surface = self.device.create_surface(window.clone())?;
        let swapchain = match self.device.create_swapchain(&surface, self.settings.swapchain) {
            Ok(swapchain) => swapchain,
            Err(err) => {
                self.device.destroy_surface(surface);
                return Err(err);
            }
        };

        let resized = Arc::new(AtomicBool::new(false));
        let flag = resized.clone();
        window.on_resize(Box::new(move |width, height| {
            log::debug!("Window resized to {}x{}", width, height);
            flag.store(true, Ordering::Release);
        }));

        let mut data = WindowData {
            surface,
            swapchain,
            image_available: Vec::new(),
            work_finished: Vec::new(),
            command_lists: Vec::new(),
            resized,
            frame_active: false,
            frame_slot: 0,
            waits_on_uploads: false,
        };
        ensure_frame_resources(&self.device, &mut data)?;

        let id = WindowId(self.windows.len() as u32);
        self.windows.push(Some(data));
        log::info!("Registered window {:?}", id);
        Ok(id)
    }

    pub fn unregister_window(&mut self, id: WindowId) -> GpuResult<()> {
        let data = self
            .windows
            .get_mut(id.0 as usize)
            .and_then(Option::take)
            .ok_or_else(|| GpuError::invalid_usage(format!("unknown window {:?}", id)))?;
        self.release_window(data)
    }

    fn release_window(&self, data: WindowData) -> GpuResult<()> {
        let WindowData {
            surface,
            swapchain,
            image_available,
            work_finished,
            command_lists,
            ..
        } = data;

        self.device.free_command_lists(command_lists)?;
        self.device.wait_idle()?;
        for semaphore in image_available.into_iter().chain(work_finished) {
            self.device.destroy_semaphore(semaphore);
        }
        // Chain first, it was built on the surface
        drop(swapchain);
        self.device.destroy_surface(surface);
        Ok(())
    }

    pub fn swapchain(&self, id: WindowId) -> Option<&Swapchain> {
        self.windows
            .get(id.0 as usize)
            .and_then(Option::as_ref)
            .map(|data| &data.swapchain)
    }

    pub fn swapchain_format(&self, id: WindowId) -> Option<Format> {
        self.swapchain(id).map(Swapchain::format)
    }

    /// Image acquired for the frame in progress.
    pub fn swapchain_image(&self, id: WindowId) -> Option<&Texture> {
        self.swapchain(id).and_then(Swapchain::acquired_image)
    }

    pub fn set_vsync(&mut self, id: WindowId, vsync: bool) -> GpuResult<()> {
        let data = window_data(&mut self.windows, id)?;
        let settings = SwapchainSettings {
            vsync,
            ..data.swapchain.settings()
        };
        data.swapchain.set_settings(settings);
        Ok(())
    }

    /// Start a frame. False means there is nothing to draw into this time
    /// (window closed or minimised, or the chain was rebuilt) and the
    /// caller should skip straight to the next frame.
    pub fn begin_frame(&mut self, id: WindowId) -> GpuResult<bool> {
        let data = window_data(&mut self.windows, id)?;
        if data.frame_active {
            return Err(GpuError::invalid_usage("begin_frame called twice without end_frame"));
        }
        if !data.surface.window().is_open() {
            return Ok(false);
        }
        if data.resized.swap(false, Ordering::AcqRel) {
            data.swapchain.invalidate();
        }
        if !data.swapchain.prepare()? {
            return Ok(false);
        }
        ensure_frame_resources(&self.device, data)?;

        let slot = data.swapchain.current_frame_index() as usize;
        self.device.wait_for(&data.command_lists[slot].finished)?;

        if !data.swapchain.acquire_next_image(&data.image_available[slot])? {
            return Ok(false);
        }

        data.waits_on_uploads = self.uploads.flush_for_frame()?;
        data.command_lists[slot].begin()?;
        data.frame_slot = slot;
        data.frame_active = true;
        log::trace!(
            "Frame slot {} drawing image {:?}",
            slot,
            data.swapchain.acquired_image_index()
        );
        Ok(true)
    }

    pub fn frame(&mut self, id: WindowId) -> GpuResult<FrameContext<'_>> {
        let data = window_data(&mut self.windows, id)?;
        if !data.frame_active {
            return Err(GpuError::invalid_usage("no frame in progress"));
        }
        let slot = data.frame_slot;
        let image_index = data
            .swapchain
            .acquired_image_index()
            .ok_or_else(|| GpuError::invalid_usage("frame has no acquired image"))?;
        let backbuffer = data
            .swapchain
            .acquired_image()
            .ok_or_else(|| GpuError::invalid_usage("frame has no acquired image"))?;

        Ok(FrameContext {
            cmd: &mut data.command_lists[slot],
            backbuffer,
            extent: backbuffer.extent_2d(),
            frame_index: slot,
            image_index,
        })
    }

    /// Submit the frame's list and present. A list still recording is
    /// ended here, after moving the backbuffer to the present layout.
    pub fn end_frame(&mut self, id: WindowId) -> GpuResult<PresentStatus> {
        let data = window_data(&mut self.windows, id)?;
        if !data.frame_active {
            log::warn!("end_frame without a frame in progress, skipping present");
            return Ok(PresentStatus::Skipped);
        }
        data.frame_active = false;
        let slot = data.frame_slot;

        let cmd = &mut data.command_lists[slot];
        if cmd.state() == RecordingState::Recording {
            if let Some(backbuffer) = data.swapchain.acquired_image() {
                if backbuffer.layout() != vk::ImageLayout::PRESENT_SRC_KHR {
                    cmd.resource_barrier(backbuffer, ImageLayout::PresentSrc)?;
                }
            }
            cmd.end()?;
        }

        let mut waits = vec![(
            &data.image_available[slot],
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        )];
        if data.waits_on_uploads {
            waits.push((self.uploads.semaphore(), vk::PipelineStageFlags::ALL_COMMANDS));
        }
        self.device.queue_submit(
            QueueKind::Graphics,
            &mut [cmd],
            &waits,
            Some(&data.work_finished[slot]),
        )?;
        if data.waits_on_uploads {
            self.uploads.signal_consumed();
            data.waits_on_uploads = false;
        }

        let status = data.swapchain.present(&data.work_finished[slot])?;
        if status != PresentStatus::Presented {
            log::debug!("Present returned {:?}", status);
        }
        Ok(status)
    }

    // --- Buffers ---

    pub fn create_buffer(&mut self, desc: &BufferDesc) -> GpuResult<BufferId> {
        let buffer = self.device.create_buffer(desc)?;
        if let Some(index) = self.buffers.iter().position(|slot| slot.buffer.is_none()) {
            let slot = &mut self.buffers[index];
            slot.buffer = Some(buffer);
            return Ok(BufferId {
                index: index as u32,
                generation: slot.generation,
            });
        }
        self.buffers.push(BufferSlot {
            generation: 0,
            buffer: Some(buffer),
        });
        Ok(BufferId {
            index: self.buffers.len() as u32 - 1,
            generation: 0,
        })
    }

    pub fn buffer(&self, id: BufferId) -> Option<&Buffer> {
        self.buffers
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.buffer.as_ref())
    }

    /// Host-visible buffers are written in place; device-local ones go
    /// through the staging buffer and land before the next frame's work.
    pub fn upload_buffer(&self, id: BufferId, offset: u64, data: &[u8]) -> GpuResult<()> {
        let buffer = self
            .buffer(id)
            .ok_or_else(|| GpuError::invalid_usage(format!("stale buffer handle {:?}", id)))?;
        if buffer.is_host_visible() {
            self.device.write_buffer(buffer, offset, data)
        } else {
            self.uploads.upload(buffer, offset, data)
        }
    }

    /// The caller must ensure no submitted work still reads the buffer.
    pub fn destroy_buffer(&mut self, id: BufferId) -> GpuResult<()> {
        let slot = self
            .buffers
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or_else(|| GpuError::invalid_usage(format!("stale buffer handle {:?}", id)))?;
        let buffer = slot
            .buffer
            .take()
            .ok_or_else(|| GpuError::invalid_usage(format!("buffer {:?} already destroyed", id)))?;
        slot.generation = slot.generation.wrapping_add(1);

        self.uploads.discard_copies_for(&buffer);
        self.device.destroy_buffer(buffer);
        Ok(())
    }

    pub fn wait_idle(&self) -> GpuResult<()> {
        self.device.wait_idle()
    }

    /// Tear down every window and buffer, then the device caches.
    pub fn destroy(&mut self) -> GpuResult<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.device.wait_idle()?;

        let windows: Vec<_> = self.windows.drain(..).flatten().collect();
        for data in windows {
            self.release_window(data)?;
        }
        for slot in self.buffers.drain(..) {
            if let Some(buffer) = slot.buffer {
                self.device.destroy_buffer(buffer);
            }
        }
        self.uploads.destroy()?;
        self.device.dispose()
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(err) = self.destroy() {
            log::error!("Renderer teardown failed: {}", err);
        }
    }
}
