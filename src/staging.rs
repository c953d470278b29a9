// Upload path for device-local buffers
//
// One host-visible staging buffer is filled front to back. Each upload
// appends a copy record; a flush records every pending copy into one
// single-use command list and rewinds the write offset. The offset and the
// record list sit behind one mutex, so uploads may come from any thread.

use ash::vk;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::backend::QueueKind;
use crate::device::Device;
use crate::error::{GpuError, GpuResult};
use crate::resource::{range_fits, Buffer, BufferDesc};
use crate::sync::{FenceSlot, Semaphore};

const UPLOAD_ALIGNMENT: u64 = 4;

#[derive(Debug, Clone)]
struct CopyRecord {
    src_offset: u64,
    dst: Buffer,
    dst_offset: u64,
    size: u64,
}

struct StagingState {
    buffer: Buffer,
    offset: u64,
    copies: Vec<CopyRecord>,
    /// Completion of the last flush. The buffer is not written again
    /// until this has signaled.
    in_flight: FenceSlot,
    /// The upload semaphore was signaled and no submit has waited on it yet.
    signal_pending: bool,
    destroyed: bool,
}

pub struct UploadQueue {
    device: Arc<Device>,
    semaphore: Semaphore,
    capacity: u64,
    state: Mutex<StagingState>,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.saturating_add(alignment - 1) & !(alignment - 1)
}

impl UploadQueue {
    pub fn new(device: Arc<Device>, capacity: u64) -> GpuResult<Self> {
        let buffer = device.create_buffer(&BufferDesc::staging(capacity))?;
        let semaphore = device.create_semaphore()?;
        log::info!("Created staging buffer ({} bytes)", capacity);

        Ok(Self {
            device,
            semaphore,
            capacity,
            state: Mutex::new(StagingState {
                buffer,
                offset: 0,
                copies: Vec::new(),
                in_flight: FenceSlot::new(),
                signal_pending: false,
                destroyed: false,
            }),
        })
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes written since the last flush.
    pub fn pending_bytes(&self) -> u64 {
        self.state.lock().offset
    }

    pub fn pending_copies(&self) -> usize {
        self.state.lock().copies.len()
    }

    pub(crate) fn semaphore(&self) -> &Semaphore {
        &self.semaphore
    }

    /// Queue `data` for copy into `dst` at `dst_offset`. If the staging
    /// buffer cannot hold it, everything queued so far is flushed first
    /// with a blocking submit.
    pub fn upload(&self, dst: &Buffer, dst_offset: u64, data: &[u8]) -> GpuResult<()> {
        let size = data.len() as u64;
        if size == 0 {
            return Ok(());
        }
        if !dst.usage.contains(vk::BufferUsageFlags::TRANSFER_DST) {
            return Err(GpuError::invalid_usage("upload destination lacks TRANSFER_DST usage"));
        }
        if !range_fits(dst_offset, size, dst.size) {
            return Err(GpuError::invalid_usage(format!(
                "upload of {} bytes at {} overflows buffer of {}",
                size, dst_offset, dst.size
            )));
        }
        if size > self.capacity {
            return Err(GpuError::invalid_usage(format!(
                "upload of {} bytes exceeds the {} byte staging buffer",
                size, self.capacity
            )));
        }

        let mut state = self.state.lock();
        if state.destroyed {
            return Err(GpuError::invalid_usage("upload after the staging buffer was destroyed"));
        }
        if !range_fits(state.offset, size, self.capacity) {
            log::debug!("Staging buffer full, flushing {} copies", state.copies.len());
            self.flush_locked(&mut state, None)?;
        }
        if state.copies.is_empty() {
            self.device.wait_for(&state.in_flight)?;
        }

        let src_offset = state.offset;
        self.device.write_buffer(&state.buffer, src_offset, data)?;
        state.copies.push(CopyRecord {
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
        state.offset = align_up(src_offset + size, UPLOAD_ALIGNMENT).min(self.capacity);
        Ok(())
    }

    /// Submit every queued copy and wait for them to land.
    pub fn flush_blocking(&self) -> GpuResult<()> {
        let mut state = self.state.lock();
        if state.copies.is_empty() {
            return Ok(());
        }
        self.flush_locked(&mut state, None)
    }

    /// Submit queued copies for a frame. Returns true when the copies
    /// signal the upload semaphore, which that frame's submit must wait on.
    pub(crate) fn flush_for_frame(&self) -> GpuResult<bool> {
        let mut state = self.state.lock();
        if state.copies.is_empty() {
            return Ok(false);
        }
        if state.signal_pending {
            // An earlier frame still owes a wait on the semaphore
            self.flush_locked(&mut state, None)?;
            return Ok(false);
        }
        self.flush_locked(&mut state, Some(&self.semaphore))?;
        state.signal_pending = true;
        Ok(true)
    }

    /// A submit has waited on the upload semaphore.
    pub(crate) fn signal_consumed(&self) {
        self.state.lock().signal_pending = false;
    }

    fn flush_locked(&self, state: &mut StagingState, signal: Option<&Semaphore>) -> GpuResult<()> {
        let copies = std::mem::take(&mut state.copies);
        let staging = state.buffer.clone();

        let finished = self.device.execute_single_usage_command_list(
            QueueKind::Graphics,
            |cmd| {
                for copy in &copies {
                    cmd.copy_buffer(&staging, copy.src_offset, &copy.dst, copy.dst_offset, copy.size)?;
                }
                Ok(())
            },
            signal,
        )?;

        log::debug!("Flushed {} staging copies ({} bytes)", copies.len(), state.offset);
        state.in_flight = finished;
        state.offset = 0;
        Ok(())
    }

    /// Drop queued copies that target `dst`, before it is destroyed.
    pub(crate) fn discard_copies_for(&self, dst: &Buffer) {
        self.state
            .lock()
            .copies
            .retain(|copy| copy.dst.handle != dst.handle);
    }

    pub fn destroy(&self) -> GpuResult<()> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Ok(());
        }
        state.destroyed = true;
        state.copies.clear();
        self.device.wait_for(&state.in_flight)?;
        self.device.destroy_buffer(state.buffer.clone());
        self.device.backend().destroy_semaphore(self.semaphore.raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::device::DeviceSettings;

    fn setup(capacity: u64) -> (Arc<HeadlessBackend>, Arc<Device>, UploadQueue) {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Arc::new(Device::new(backend.clone(), DeviceSettings::default()).unwrap());
        let uploads = UploadQueue::new(device.clone(), capacity).unwrap();
        (backend, device, uploads)
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(9, 4), 12);
        assert_eq!(align_up(u64::MAX, 4), u64::MAX & !3);
    }

    #[test]
    fn huge_destination_offset_is_rejected() {
        let (_backend, device, uploads) = setup(64);
        let dst = device.create_buffer(&BufferDesc::vertex(16)).unwrap();
        assert!(matches!(
            uploads.upload(&dst, u64::MAX, &[1, 2, 3]),
            Err(GpuError::InvalidUsage(_))
        ));
        assert_eq!(uploads.pending_copies(), 0);

        let host = device.create_buffer(&BufferDesc::uniform(16)).unwrap();
        assert!(matches!(
            device.write_buffer(&host, u64::MAX - 1, &[0; 4]),
            Err(GpuError::InvalidUsage(_))
        ));
    }

    #[test]
    fn blocking_flush_copies_bytes() {
        let (backend, device, uploads) = setup(64);
        let dst = device.create_buffer(&BufferDesc::vertex(16)).unwrap();

        uploads.upload(&dst, 4, &[1, 2, 3]).unwrap();
        assert_eq!(uploads.pending_copies(), 1);
        uploads.flush_blocking().unwrap();

        let bytes = backend.buffer_contents(dst.raw()).unwrap();
        assert_eq!(&bytes[..8], &[0, 0, 0, 0, 1, 2, 3, 0]);
        assert_eq!(uploads.pending_bytes(), 0);
        uploads.destroy().unwrap();
    }

    #[test]
    fn overflowing_upload_flushes_first() {
        let (backend, device, uploads) = setup(8);
        let dst = device.create_buffer(&BufferDesc::vertex(16)).unwrap();

        uploads.upload(&dst, 0, &[7; 6]).unwrap();
        uploads.upload(&dst, 8, &[9; 6]).unwrap();
        // First batch landed eagerly, second is still queued
        assert_eq!(&backend.buffer_contents(dst.raw()).unwrap()[..6], &[7; 6]);
        assert_eq!(uploads.pending_copies(), 1);
        uploads.destroy().unwrap();
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let (_backend, device, uploads) = setup(8);
        let dst = device.create_buffer(&BufferDesc::vertex(32)).unwrap();
        assert!(matches!(
            uploads.upload(&dst, 0, &[0; 16]),
            Err(GpuError::InvalidUsage(_))
        ));
    }

    #[test]
    fn host_visible_destination_without_transfer_usage_is_rejected() {
        let (_backend, device, uploads) = setup(64);
        let dst = device.create_buffer(&BufferDesc::uniform(16)).unwrap();
        assert!(uploads.upload(&dst, 0, &[1]).is_err());
    }

    #[test]
    fn frame_flush_signals_once_until_consumed() {
        let (backend, device, uploads) = setup(64);
        let dst = device.create_buffer(&BufferDesc::index(16)).unwrap();

        uploads.upload(&dst, 0, &[1; 4]).unwrap();
        assert!(uploads.flush_for_frame().unwrap());
        assert!(backend.semaphore_signaled(uploads.semaphore().raw()));

        // Unconsumed signal: the next flush falls back to blocking
        uploads.upload(&dst, 4, &[2; 4]).unwrap();
        assert!(!uploads.flush_for_frame().unwrap());

        uploads.signal_consumed();
        assert!(!uploads.flush_for_frame().unwrap());
        assert!(backend.validation_errors().is_empty());
    }
}
