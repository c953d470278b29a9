// Logical device: owns the backend and every device-lifetime cache
//
// Handles all GPU-object creation, queue submission and fence
// bookkeeping. All methods take `&self` and lock internally, so a
// `Device` can be shared across threads behind an `Arc`.

use ash::vk;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::backend::{Backend, QueueKind, SubmitBatch};
use crate::command::{CommandList, CommandListLevel};
use crate::descriptor::{DescriptorSet, DescriptorSetAllocator, DescriptorSetLayout, PoolSizes};
use crate::error::{fatal, GpuError, GpuResult};
use crate::pipeline::{GraphicsPipeline, GraphicsPipelineDesc};
use crate::resource::{range_fits, Buffer, BufferDesc, BufferUsage, BufferVisibility, Texture, TextureDesc};
use crate::sampler::{Sampler, SamplerState};
use crate::swapchain::{Surface, Swapchain, SwapchainSettings};
use crate::sync::{Fence, FencePool, FenceSlot, FenceTicket, Semaphore};
use crate::window::Window;

#[derive(Debug, Clone)]
pub struct DeviceSettings {
    /// Fences created up front, and the step the pool grows by.
    pub fence_pool_size: u32,
    pub fence_timeout_ns: u64,
    pub acquire_timeout_ns: u64,
    pub descriptor_sets_per_pool: u32,
    pub pool_sizes: PoolSizes,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            fence_pool_size: 12,
            fence_timeout_ns: 5_000_000_000,
            acquire_timeout_ns: 1_000_000_000,
            descriptor_sets_per_pool: 1000,
            pool_sizes: PoolSizes::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SupportedFeatures {
    pub sampler_anisotropy: bool,
    pub max_sampler_anisotropy: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CommandPoolKey {
    queue: QueueKind,
    thread: u32,
}

/// Single-use command buffer waiting on its fence before it can be freed.
struct TransientList {
    fence: Fence,
    pool: vk::CommandPool,
    buffer: vk::CommandBuffer,
}

pub struct Device {
    backend: Arc<dyn Backend>,
    settings: DeviceSettings,
    features: SupportedFeatures,
    command_pools: Mutex<HashMap<CommandPoolKey, vk::CommandPool>>,
    set_layouts: Mutex<HashMap<DescriptorSetLayout, vk::DescriptorSetLayout>>,
    samplers: Mutex<HashMap<SamplerState, Sampler>>,
    fences: Mutex<FencePool>,
    descriptor_sets: Mutex<DescriptorSetAllocator>,
    transient: Mutex<Vec<TransientList>>,
    disposed: AtomicBool,
}

impl Device {
    pub fn new(backend: Arc<dyn Backend>, settings: DeviceSettings) -> GpuResult<Self> {
        let adapter = backend.adapter().clone();
        log::info!("Using GPU: {}", adapter.name);

        let fences = FencePool::new(backend.as_ref(), settings.fence_pool_size)
            .map_err(|err| fatal("fence pool", err))?;
        let descriptor_sets = DescriptorSetAllocator::new(
            backend.clone(),
            settings.pool_sizes.clone(),
            settings.descriptor_sets_per_pool,
        );

        Ok(Self {
            features: SupportedFeatures {
                sampler_anisotropy: adapter.sampler_anisotropy,
                max_sampler_anisotropy: adapter.max_sampler_anisotropy,
            },
            backend,
            settings,
            command_pools: Mutex::new(HashMap::new()),
            set_layouts: Mutex::new(HashMap::new()),
            samplers: Mutex::new(HashMap::new()),
            fences: Mutex::new(fences),
            descriptor_sets: Mutex::new(descriptor_sets),
            transient: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn supported_features(&self) -> SupportedFeatures {
        self.features
    }

    // --- Presentation ---

    pub fn create_surface(&self, window: Arc<dyn Window>) -> GpuResult<Surface> {
        let handle = self
            .backend
            .create_surface(window.as_ref())
            .map_err(|err| fatal("surface", err))?;

        match self.backend.present_family(handle)? {
            Some(present_family) => Ok(Surface {
                handle,
                present_family,
                window,
            }),
            None => {
                self.backend.destroy_surface(handle);
                Err(fatal("surface", GpuError::SurfaceUnsupported))
            }
        }
    }

    pub fn destroy_surface(&self, surface: Surface) {
        self.backend.destroy_surface(surface.handle);
    }

    pub fn create_swapchain(&self, surface: &Surface, settings: SwapchainSettings) -> GpuResult<Swapchain> {
        Swapchain::new(
            self.backend.clone(),
            surface,
            settings,
            self.settings.acquire_timeout_ns,
        )
        .map_err(|err| fatal("swapchain", err))
    }

    // --- Synchronisation ---

    pub fn create_semaphore(&self) -> GpuResult<Semaphore> {
        Semaphore::new(self.backend.as_ref())
    }

    pub fn create_semaphores(&self, count: usize) -> GpuResult<Vec<Semaphore>> {
        (0..count).map(|_| self.create_semaphore()).collect()
    }

    pub fn destroy_semaphore(&self, semaphore: Semaphore) {
        semaphore.destroy(self.backend.as_ref());
    }

    /// Block until the submission held in `slot` has finished.
    pub fn wait_for(&self, slot: &FenceSlot) -> GpuResult<()> {
        slot.wait(self.backend.as_ref(), self.settings.fence_timeout_ns)
    }

    /// (free, in use) fence counts.
    pub fn fence_pool_usage(&self) -> (usize, usize) {
        let fences = self.fences.lock();
        (fences.free_count(), fences.in_use_count())
    }

    // --- Resources ---

    pub fn create_buffer(&self, desc: &BufferDesc) -> GpuResult<Buffer> {
        let mut usage = BufferUsage::flags(&desc.usage);
        let host_visible = desc.visibility == BufferVisibility::HostVisible;
        if !host_visible {
            // Device-local buffers are only reachable through copies
            usage |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        let handle = self.backend.create_buffer(desc.size, usage, host_visible)?;
        Ok(Buffer {
            handle,
            size: desc.size,
            usage,
            host_visible,
        })
    }

    pub fn destroy_buffer(&self, buffer: Buffer) {
        self.backend.destroy_buffer(buffer.handle);
    }

    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        if !buffer.host_visible {
            return Err(GpuError::invalid_usage("host write to a device-local buffer"));
        }
        if !range_fits(offset, data.len() as u64, buffer.size) {
            return Err(GpuError::invalid_usage(format!(
                "write of {} bytes at {} overflows buffer of {}",
                data.len(),
                offset,
                buffer.size
            )));
        }
        self.backend.write_buffer(buffer.handle, offset, data)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> GpuResult<Texture> {
        let (image, view) = self.backend.create_texture(desc)?;
        Ok(Texture::new(image, view, desc))
    }

    pub fn destroy_texture(&self, texture: Texture) {
        if texture.swapchain_image {
            log::warn!("Swapchain images are owned by their swapchain, not destroying");
            return;
        }
        self.backend.destroy_texture(texture.image, texture.view);
    }

    /// Sampler for `state`, created on first use and cached for the
    /// device's lifetime.
    pub fn get_sampler(&self, state: &SamplerState) -> GpuResult<Sampler> {
        let mut samplers = self.samplers.lock();
        if let Some(sampler) = samplers.get(state) {
            return Ok(*sampler);
        }

        let anisotropy = state.effective_anisotropy(
            self.features.sampler_anisotropy,
            self.features.max_sampler_anisotropy,
        );
        let sampler = Sampler(self.backend.create_sampler(state, anisotropy)?);
        samplers.insert(*state, sampler);
        Ok(sampler)
    }

    // --- Binding model ---

    pub fn get_set_layout(&self, layout: &DescriptorSetLayout) -> GpuResult<vk::DescriptorSetLayout> {
        let mut layouts = self.set_layouts.lock();
        if let Some(handle) = layouts.get(layout) {
            return Ok(*handle);
        }
        let handle = self.backend.create_descriptor_set_layout(layout.bindings())?;
        layouts.insert(layout.clone(), handle);
        Ok(handle)
    }

    pub fn allocate_descriptor_set(&self, layout: &DescriptorSetLayout) -> GpuResult<DescriptorSet> {
        let layout = self.get_set_layout(layout)?;
        let handle = self.descriptor_sets.lock().allocate(layout)?;
        Ok(DescriptorSet::new(handle, layout))
    }

    /// Flush the writes queued on `set`.
    pub fn write_descriptor_set(&self, set: &mut DescriptorSet) {
        let writes = set.take_writes();
        if !writes.is_empty() {
            self.backend.update_descriptor_set(set.handle, &writes);
        }
    }

    /// Release every descriptor set allocated so far.
    pub fn reset_descriptor_pools(&self) -> GpuResult<()> {
        self.descriptor_sets.lock().reset()
    }

    pub fn retrieve_graphics_pipeline(&self, desc: &GraphicsPipelineDesc) -> GpuResult<GraphicsPipeline> {
        let set_layouts = desc
            .set_layouts
            .iter()
            .map(|layout| self.get_set_layout(layout))
            .collect::<GpuResult<Vec<_>>>()?;

        if desc.shaders.is_empty() {
            log::warn!("Graphics pipeline created without shaders");
        }

        let raw = self
            .backend
            .create_graphics_pipeline(desc, &set_layouts)
            .map_err(|err| fatal("graphics pipeline", err))?;
        log::info!("Created graphics pipeline");
        Ok(GraphicsPipeline {
            pipeline: raw.pipeline,
            layout: raw.layout,
        })
    }

    pub fn destroy_graphics_pipeline(&self, pipeline: GraphicsPipeline) {
        self.backend.destroy_graphics_pipeline(crate::backend::RawPipeline {
            pipeline: pipeline.pipeline,
            layout: pipeline.layout,
        });
    }

    // --- Command lists ---

    /// Pool for `queue`. Always the thread-zero slot.
    pub fn command_pool(&self, queue: QueueKind) -> GpuResult<vk::CommandPool> {
        let key = CommandPoolKey { queue, thread: 0 };
        let mut pools = self.command_pools.lock();
        if let Some(pool) = pools.get(&key) {
            return Ok(*pool);
        }
        let pool = self.backend.create_command_pool(queue)?;
        pools.insert(key, pool);
        Ok(pool)
    }

    pub fn allocate_command_lists(
        &self,
        queue: QueueKind,
        level: CommandListLevel,
        count: u32,
    ) -> GpuResult<Vec<CommandList>> {
        let pool = self.command_pool(queue)?;
        let buffers = self
            .backend
            .allocate_command_buffers(pool, level.to_vk(), count)?;
        Ok(buffers
            .into_iter()
            .map(|buffer| {
                CommandList::new(
                    self.backend.clone(),
                    buffer,
                    pool,
                    level,
                    queue,
                    false,
                    self.settings.fence_timeout_ns,
                )
            })
            .collect())
    }

    pub fn allocate_command_list(&self, queue: QueueKind, level: CommandListLevel) -> GpuResult<CommandList> {
        self.allocate_command_lists(queue, level, 1)?
            .pop()
            .ok_or_else(|| GpuError::invalid_usage("command buffer allocation returned nothing"))
    }

    /// Free lists after waiting for their last submission.
    pub fn free_command_lists(&self, lists: Vec<CommandList>) -> GpuResult<()> {
        for list in lists {
            self.wait_for(&list.finished)?;
            self.backend.free_command_buffers(list.pool, &[list.buffer]);
        }
        Ok(())
    }

    /// Reclaim signaled fences and free single-use buffers that used them.
    fn collect_completed(&self, fences: &mut FencePool) -> GpuResult<()> {
        let reclaimed = fences.reclaim(self.backend.as_ref())?;
        if reclaimed.is_empty() {
            return Ok(());
        }
        self.transient.lock().retain(|list| {
            if reclaimed.contains(&list.fence) {
                self.backend.free_command_buffers(list.pool, &[list.buffer]);
                false
            } else {
                true
            }
        });
        Ok(())
    }

    fn submit_locked(
        &self,
        fences: &mut FencePool,
        queue: QueueKind,
        command_buffers: &[vk::CommandBuffer],
        wait: &[(&Semaphore, vk::PipelineStageFlags)],
        signal: Option<&Semaphore>,
    ) -> GpuResult<FenceTicket> {
        let fence = fences.acquire(self.backend.as_ref())?;

        let wait_semaphores: Vec<_> = wait.iter().map(|(s, _)| s.handle).collect();
        let wait_stages: Vec<_> = wait.iter().map(|(_, stage)| *stage).collect();
        let signal_semaphores: Vec<_> = signal.iter().map(|s| s.handle).collect();
        let batch = SubmitBatch {
            command_buffers,
            wait_semaphores: &wait_semaphores,
            wait_stages: &wait_stages,
            signal_semaphores: &signal_semaphores,
        };

        if let Err(err) = self.backend.queue_submit(queue, &batch, fence.0) {
            fences.release_unsubmitted(fence);
            log::error!("Queue submit to {:?} failed: {}", queue, err);
            return Err(err);
        }
        Ok(fences.ticket(fence))
    }

    /// Submit ended primary lists. Each list, and every secondary it
    /// executed, is tagged with the submission's fence.
    pub fn queue_submit(
        &self,
        queue: QueueKind,
        lists: &mut [&mut CommandList],
        wait: &[(&Semaphore, vk::PipelineStageFlags)],
        signal: Option<&Semaphore>,
    ) -> GpuResult<()> {
        for list in lists.iter() {
            list.check_submittable(queue)?;
        }
        let buffers: Vec<_> = lists.iter().map(|list| list.buffer).collect();

        let mut fences = self.fences.lock();
        self.collect_completed(&mut fences)?;
        let ticket = self.submit_locked(&mut fences, queue, &buffers, wait, signal)?;
        for list in lists.iter_mut() {
            list.mark_submitted(&ticket);
        }
        Ok(())
    }

    fn record_single_use<F>(list: &mut CommandList, record: F) -> GpuResult<()>
    where
        F: FnOnce(&mut CommandList) -> GpuResult<()>,
    {
        list.begin()?;
        record(list)?;
        list.end()
    }

    /// Record and submit a throwaway list. Without `signal` this blocks
    /// until `queue` is idle; with it, ordering is left to whoever waits on
    /// the semaphore. Either way the returned slot tracks completion.
    pub fn execute_single_usage_command_list<F>(
        &self,
        queue: QueueKind,
        record: F,
        signal: Option<&Semaphore>,
    ) -> GpuResult<FenceSlot>
    where
        F: FnOnce(&mut CommandList) -> GpuResult<()>,
    {
        let pool = self.command_pool(queue)?;
        let buffer = self
            .backend
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)?
            .pop()
            .ok_or_else(|| GpuError::invalid_usage("command buffer allocation returned nothing"))?;
        let mut list = CommandList::new(
            self.backend.clone(),
            buffer,
            pool,
            CommandListLevel::Primary,
            queue,
            true,
            self.settings.fence_timeout_ns,
        );

        if let Err(err) = Self::record_single_use(&mut list, record) {
            self.backend.free_command_buffers(pool, &[buffer]);
            return Err(err);
        }

        let mut fences = self.fences.lock();
        self.collect_completed(&mut fences)?;
        let ticket = match self.submit_locked(&mut fences, queue, &[buffer], &[], signal) {
            Ok(ticket) => ticket,
            Err(err) => {
                self.backend.free_command_buffers(pool, &[buffer]);
                return Err(err);
            }
        };
        list.mark_submitted(&ticket);
        let finished = list.finished.clone();

        if signal.is_none() {
            drop(fences);
            self.backend.queue_wait_idle(queue)?;
            self.backend.free_command_buffers(pool, &[buffer]);
        } else {
            self.transient.lock().push(TransientList {
                fence: ticket.fence(),
                pool,
                buffer,
            });
        }
        Ok(finished)
    }

    /// Block until `queue` has drained. Stalls the pipeline.
    pub fn wait_queue(&self, queue: QueueKind) -> GpuResult<()> {
        self.backend.queue_wait_idle(queue)?;
        let mut fences = self.fences.lock();
        self.collect_completed(&mut fences)
    }

    pub fn wait_idle(&self) -> GpuResult<()> {
        self.backend.device_wait_idle()?;
        let mut fences = self.fences.lock();
        self.collect_completed(&mut fences)
    }

    /// Release every device-owned object. Resources created through the
    /// device must already have been destroyed.
    pub fn dispose(&self) -> GpuResult<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        log::info!("Disposing device");
        self.backend.device_wait_idle()?;

        {
            let mut fences = self.fences.lock();
            for list in self.transient.lock().drain(..) {
                self.backend.free_command_buffers(list.pool, &[list.buffer]);
            }
            fences.destroy(self.backend.as_ref());
        }
        self.descriptor_sets.lock().destroy();
        for (_, sampler) in self.samplers.lock().drain() {
            self.backend.destroy_sampler(sampler.0);
        }
        for (_, layout) in self.set_layouts.lock().drain() {
            self.backend.destroy_descriptor_set_layout(layout);
        }
        for (_, pool) in self.command_pools.lock().drain() {
            self.backend.destroy_command_pool(pool);
        }
        Ok(())
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.dispose() {
            log::error!("Device dispose failed: {}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::descriptor::DescriptorWrite;
    use crate::pipeline::ShaderStage;
    use crate::resource::ImageLayout;
    use crate::format::Format;

    fn device() -> (Arc<HeadlessBackend>, Device) {
        let backend = Arc::new(HeadlessBackend::new());
        let device = Device::new(backend.clone(), DeviceSettings::default()).unwrap();
        (backend, device)
    }

    #[test]
    fn command_pools_are_cached_per_queue() {
        let (backend, device) = device();
        let first = device.command_pool(QueueKind::Graphics).unwrap();
        let again = device.command_pool(QueueKind::Graphics).unwrap();
        let transfer = device.command_pool(QueueKind::Transfer).unwrap();
        assert_eq!(first, again);
        assert_ne!(first, transfer);
        assert_eq!(backend.counters().command_pools_created, 2);
    }

    #[test]
    fn samplers_and_layouts_are_cached() {
        let (backend, device) = device();
        let state = SamplerState::linear().with_anisotropy(4.0);
        assert_eq!(device.get_sampler(&state).unwrap(), device.get_sampler(&state).unwrap());
        device.get_sampler(&SamplerState::default()).unwrap();
        assert_eq!(backend.counters().samplers_created, 2);

        let layout = DescriptorSetLayout::new().uniform_buffer(ShaderStage::Vertex, 0, 1);
        let a = device.get_set_layout(&layout).unwrap();
        let b = device.get_set_layout(&layout.clone()).unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.counters().descriptor_set_layouts_created, 1);
    }

    #[test]
    fn submit_tags_primary_and_secondaries_with_one_fence() {
        let (backend, device) = device();
        let mut secondary = device
            .allocate_command_list(QueueKind::Graphics, CommandListLevel::Secondary)
            .unwrap();
        secondary.begin().unwrap();
        secondary.end().unwrap();

        let mut primary = device
            .allocate_command_list(QueueKind::Graphics, CommandListLevel::Primary)
            .unwrap();
        primary.begin().unwrap();
        primary.execute_secondary(&secondary).unwrap();
        primary.end().unwrap();

        device
            .queue_submit(QueueKind::Graphics, &mut [&mut primary], &[], None)
            .unwrap();

        let fence = primary.finished_fence().unwrap();
        assert_eq!(secondary.finished_fence(), Some(fence));
        assert!(!backend.fence_signaled(fence.raw()).unwrap());

        // Re-beginning the secondary waits on the shared fence
        secondary.begin().unwrap();
        assert!(backend.fence_signaled(fence.raw()).unwrap());
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn submit_rejects_lists_that_are_not_ended() {
        let (_backend, device) = device();
        let mut list = device
            .allocate_command_list(QueueKind::Graphics, CommandListLevel::Primary)
            .unwrap();
        list.begin().unwrap();
        assert!(matches!(
            device.queue_submit(QueueKind::Graphics, &mut [&mut list], &[], None),
            Err(GpuError::InvalidUsage(_))
        ));
    }

    #[test]
    fn failed_submit_returns_fence_to_pool() {
        let (backend, device) = device();
        let mut list = device
            .allocate_command_list(QueueKind::Graphics, CommandListLevel::Primary)
            .unwrap();
        list.begin().unwrap();
        list.end().unwrap();

        backend.fail_next_submit(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        assert!(device
            .queue_submit(QueueKind::Graphics, &mut [&mut list], &[], None)
            .is_err());
        assert!(list.finished_fence().is_none());
        assert_eq!(device.fence_pool_usage().1, 0);
    }

    #[test]
    fn blocking_single_use_list_completes_before_returning() {
        let (backend, device) = device();
        let texture = device
            .create_texture(&TextureDesc::new_2d(Format::RGBA8U, 4, 4))
            .unwrap();

        let slot = device
            .execute_single_usage_command_list(
                QueueKind::Graphics,
                |cmd| cmd.resource_barrier(&texture, ImageLayout::ShaderReadOnly),
                None,
            )
            .unwrap();

        let fence = slot.get().unwrap();
        assert!(backend.fence_signaled(fence.raw()).unwrap());
        assert_eq!(backend.counters().queue_wait_idle, 1);
        assert_eq!(texture.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        device.destroy_texture(texture);
    }

    #[test]
    fn signalled_single_use_list_is_freed_after_reclaim() {
        let (backend, device) = device();
        let semaphore = device.create_semaphore().unwrap();

        device
            .execute_single_usage_command_list(QueueKind::Graphics, |_| Ok(()), Some(&semaphore))
            .unwrap();
        assert!(backend.semaphore_signaled(semaphore.raw()));
        assert_eq!(backend.in_flight_submissions(), 1);

        let live_before = backend.live_objects();
        backend.complete_all();
        // Next submission reclaims the fence and frees the transient buffer
        device
            .execute_single_usage_command_list(QueueKind::Graphics, |_| Ok(()), None)
            .unwrap();
        assert_eq!(backend.live_objects(), live_before - 1);
        device.destroy_semaphore(semaphore);
    }

    #[test]
    fn failed_recording_frees_the_buffer() {
        let (backend, device) = device();
        let live_before = {
            device.command_pool(QueueKind::Graphics).unwrap();
            backend.live_objects()
        };
        let result = device.execute_single_usage_command_list(
            QueueKind::Graphics,
            |cmd| cmd.end_renderpass(),
            None,
        );
        assert!(matches!(result, Err(GpuError::InvalidUsage(_))));
        assert_eq!(backend.live_objects(), live_before);
    }

    #[test]
    fn descriptor_writes_reach_the_backend() {
        let (backend, device) = device();
        let layout = DescriptorSetLayout::new().uniform_buffer(ShaderStage::Vertex, 0, 1);
        let mut set = device.allocate_descriptor_set(&layout).unwrap();
        let buffer = device.create_buffer(&BufferDesc::uniform(64)).unwrap();

        set.bind_uniform_buffer(&buffer, 0, 0, 0, None);
        device.write_descriptor_set(&mut set);

        let writes = backend.descriptor_writes(set.raw());
        assert_eq!(writes.len(), 1);
        assert!(matches!(
            writes[0],
            DescriptorWrite::UniformBuffer { range: vk::WHOLE_SIZE, .. }
        ));
        assert!(set.pending_writes().is_empty());
        device.destroy_buffer(buffer);
    }

    #[test]
    fn wait_queue_drains_only_that_queue() {
        let (backend, device) = device();
        let mut lists = Vec::new();
        for queue in [QueueKind::Graphics, QueueKind::Transfer] {
            let mut list = device.allocate_command_list(queue, CommandListLevel::Primary).unwrap();
            list.begin().unwrap();
            list.end().unwrap();
            device.queue_submit(queue, &mut [&mut list], &[], None).unwrap();
            lists.push(list);
        }
        assert_eq!(device.fence_pool_usage(), (10, 2));

        device.wait_queue(QueueKind::Graphics).unwrap();
        assert_eq!(device.fence_pool_usage(), (11, 1));
        assert_eq!(backend.in_flight_submissions(), 1);
        assert_eq!(backend.counters().queue_wait_idle, 1);

        device.free_command_lists(lists).unwrap();
    }

    #[test]
    fn dispose_releases_device_owned_objects() {
        let (backend, device) = device();
        device.command_pool(QueueKind::Graphics).unwrap();
        device.get_sampler(&SamplerState::default()).unwrap();
        let layout = DescriptorSetLayout::new().texture_sampler(ShaderStage::Fragment, 0, 1);
        device.allocate_descriptor_set(&layout).unwrap();

        device.dispose().unwrap();
        assert_eq!(backend.live_objects(), 0);
        // Second dispose is a no-op
        device.dispose().unwrap();
    }
}
