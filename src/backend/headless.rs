// Simulated GPU
//
// Submissions are queued and only complete when the host waits on them
// (fence wait, queue or device idle) or when a test calls `complete_all`.
// Completion is in submission order. Binary semaphore and fence misuse is
// recorded as validation errors instead of being silently accepted, and
// buffer copies are replayed on completion so upload paths can be checked
// byte for byte.

use ash::vk;
use ash::vk::Handle;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use super::{
    AcquiredImage, AdapterInfo, Backend, QueueFamilies, QueueKind, RawPipeline, RawSwapchain,
    SubmitBatch, SurfaceSupport, SwapchainCreateDesc,
};
use crate::command::Command;
use crate::descriptor::{DescriptorWrite, LayoutBinding};
use crate::error::{GpuError, GpuResult};
use crate::pipeline::GraphicsPipelineDesc;
use crate::resource::TextureDesc;
use crate::sampler::SamplerState;
use crate::window::Window;

/// Call counts, for asserting on the frame lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeadlessCounters {
    pub acquire_calls: u32,
    pub present_calls: u32,
    pub submits: u32,
    pub fence_waits: u32,
    pub queue_wait_idle: u32,
    pub device_wait_idle: u32,
    pub swapchains_created: u32,
    pub swapchains_destroyed: u32,
    pub command_pools_created: u32,
    pub fences_created: u32,
    pub descriptor_pools_created: u32,
    pub descriptor_set_layouts_created: u32,
    pub samplers_created: u32,
    pub pipelines_created: u32,
}

/// Outcome forced on the next `acquire_next_image`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedAcquire {
    OutOfDate,
    Suboptimal,
    Timeout,
    Image(u32),
}

/// Outcome forced on the next `queue_present`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedPresent {
    OutOfDate,
    Suboptimal,
    DeviceLost,
}

struct SimCommandBuffer {
    pool: vk::CommandPool,
    commands: Option<Vec<Command>>,
}

struct SimSwapchain {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    next_image: u32,
}

struct SimBuffer {
    data: Vec<u8>,
    host_visible: bool,
}

struct SimDescriptorPool {
    capacity: u32,
    used: u32,
}

struct InFlight {
    queue: QueueKind,
    fence: vk::Fence,
    command_buffers: Vec<vk::CommandBuffer>,
}

struct SimState {
    next_handle: u64,
    counters: HeadlessCounters,
    validation_errors: Vec<String>,

    fences: HashMap<vk::Fence, bool>,
    semaphores: HashMap<vk::Semaphore, bool>,
    command_pools: HashSet<vk::CommandPool>,
    command_buffers: HashMap<vk::CommandBuffer, SimCommandBuffer>,
    in_flight: VecDeque<InFlight>,
    fail_next_submit: Option<vk::Result>,

    surface_support: SurfaceSupport,
    present_family: Option<u32>,
    surfaces: HashSet<vk::SurfaceKHR>,
    swapchains: HashMap<vk::SwapchainKHR, SimSwapchain>,
    last_swapchain: Option<SwapchainCreateDesc>,
    acquire_script: VecDeque<ScriptedAcquire>,
    present_script: VecDeque<ScriptedPresent>,
    presented: Vec<u32>,

    buffers: HashMap<vk::Buffer, SimBuffer>,
    textures: HashSet<vk::Image>,
    samplers: HashSet<vk::Sampler>,
    set_layouts: HashSet<vk::DescriptorSetLayout>,
    descriptor_pools: HashMap<vk::DescriptorPool, SimDescriptorPool>,
    descriptor_pool_capacity: Option<u32>,
    descriptor_writes: HashMap<vk::DescriptorSet, Vec<DescriptorWrite>>,
    pipelines: HashSet<vk::Pipeline>,
}

impl SimState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn validation(&mut self, message: String) {
        log::warn!("[headless] validation: {}", message);
        self.validation_errors.push(message);
    }

    fn retire(&mut self, entry: InFlight) {
        if entry.fence != vk::Fence::null() {
            self.fences.insert(entry.fence, true);
        }
        for buffer in &entry.command_buffers {
            self.replay(*buffer);
        }
    }

    /// Apply the memory effects of a completed command buffer.
    fn replay(&mut self, buffer: vk::CommandBuffer) {
        let commands = match self.command_buffers.get(&buffer).and_then(|cb| cb.commands.clone()) {
            Some(commands) => commands,
            None => return,
        };
        for command in commands {
            match command {
                Command::CopyBuffer { src, dst, region } => self.copy(src, dst, region),
                Command::ExecuteSecondary(secondary) => self.replay(secondary),
                _ => {}
            }
        }
    }

    fn copy(&mut self, src: vk::Buffer, dst: vk::Buffer, region: vk::BufferCopy) {
        let bytes = match self.buffers.get(&src) {
            Some(buffer) => {
                let start = region.src_offset as usize;
                buffer.data[start..start + region.size as usize].to_vec()
            }
            None => {
                self.validation(format!("copy from destroyed buffer {:#x}", src.as_raw()));
                return;
            }
        };
        match self.buffers.get_mut(&dst) {
            Some(buffer) => {
                let start = region.dst_offset as usize;
                buffer.data[start..start + bytes.len()].copy_from_slice(&bytes);
            }
            None => self.validation(format!("copy into destroyed buffer {:#x}", dst.as_raw())),
        }
    }

    fn retire_through(&mut self, position: usize) {
        for _ in 0..=position {
            if let Some(entry) = self.in_flight.pop_front() {
                self.retire(entry);
            }
        }
    }

    fn retire_queue(&mut self, queue: QueueKind) {
        let mut remaining = VecDeque::with_capacity(self.in_flight.len());
        while let Some(entry) = self.in_flight.pop_front() {
            if entry.queue == queue {
                self.retire(entry);
            } else {
                remaining.push_back(entry);
            }
        }
        self.in_flight = remaining;
    }

    fn retire_all(&mut self) {
        while let Some(entry) = self.in_flight.pop_front() {
            self.retire(entry);
        }
    }

    /// Submitted directly, or executed as a secondary by something that was.
    fn is_in_flight(&self, buffer: vk::CommandBuffer) -> bool {
        self.in_flight.iter().any(|entry| {
            entry
                .command_buffers
                .iter()
                .any(|submitted| self.executes(*submitted, buffer))
        })
    }

    fn executes(&self, root: vk::CommandBuffer, target: vk::CommandBuffer) -> bool {
        if root == target {
            return true;
        }
        let Some(commands) = self.command_buffers.get(&root).and_then(|cb| cb.commands.as_ref()) else {
            return false;
        };
        commands.iter().any(|command| match command {
            Command::ExecuteSecondary(secondary) => self.executes(*secondary, target),
            _ => false,
        })
    }
}

pub struct HeadlessBackend {
    adapter: AdapterInfo,
    sim: Mutex<SimState>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        let capabilities = vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 3,
            // Extent follows the window
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 16384,
                height: 16384,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
        };

        Self {
            adapter: AdapterInfo {
                name: "Headless GPU".to_string(),
                queue_families: QueueFamilies {
                    graphics: 0,
                    compute: 1,
                    transfer: 2,
                },
                sampler_anisotropy: true,
                max_sampler_anisotropy: 16.0,
            },
            sim: Mutex::new(SimState {
                next_handle: 0,
                counters: HeadlessCounters::default(),
                validation_errors: Vec::new(),
                fences: HashMap::new(),
                semaphores: HashMap::new(),
                command_pools: HashSet::new(),
                command_buffers: HashMap::new(),
                in_flight: VecDeque::new(),
                fail_next_submit: None,
                surface_support: SurfaceSupport {
                    capabilities,
                    formats: vec![
                        vk::SurfaceFormatKHR {
                            format: vk::Format::B8G8R8A8_UNORM,
                            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                        },
                        vk::SurfaceFormatKHR {
                            format: vk::Format::B8G8R8A8_SRGB,
                            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                        },
                    ],
                    present_modes: vec![
                        vk::PresentModeKHR::FIFO,
                        vk::PresentModeKHR::MAILBOX,
                        vk::PresentModeKHR::IMMEDIATE,
                    ],
                },
                present_family: Some(0),
                surfaces: HashSet::new(),
                swapchains: HashMap::new(),
                last_swapchain: None,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                presented: Vec::new(),
                buffers: HashMap::new(),
                textures: HashSet::new(),
                samplers: HashSet::new(),
                set_layouts: HashSet::new(),
                descriptor_pools: HashMap::new(),
                descriptor_pool_capacity: None,
                descriptor_writes: HashMap::new(),
                pipelines: HashSet::new(),
            }),
        }
    }

    // --- Test controls ---

    pub fn counters(&self) -> HeadlessCounters {
        self.sim.lock().counters
    }

    pub fn validation_errors(&self) -> Vec<String> {
        self.sim.lock().validation_errors.clone()
    }

    /// Finish every queued submission.
    pub fn complete_all(&self) {
        self.sim.lock().retire_all();
    }

    pub fn in_flight_submissions(&self) -> usize {
        self.sim.lock().in_flight.len()
    }

    pub fn fail_next_submit(&self, result: vk::Result) {
        self.sim.lock().fail_next_submit = Some(result);
    }

    pub fn script_acquire(&self, outcome: ScriptedAcquire) {
        self.sim.lock().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: ScriptedPresent) {
        self.sim.lock().present_script.push_back(outcome);
    }

    pub fn set_surface_capabilities(&self, capabilities: vk::SurfaceCapabilitiesKHR) {
        self.sim.lock().surface_support.capabilities = capabilities;
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.sim.lock().surface_support.formats = formats;
    }

    pub fn set_present_modes(&self, modes: Vec<vk::PresentModeKHR>) {
        self.sim.lock().surface_support.present_modes = modes;
    }

    /// `None` makes every surface unpresentable.
    pub fn set_present_family(&self, family: Option<u32>) {
        self.sim.lock().present_family = family;
    }

    /// Sets per descriptor pool. `None` uses the pool's requested size.
    pub fn set_descriptor_pool_capacity(&self, capacity: Option<u32>) {
        self.sim.lock().descriptor_pool_capacity = capacity;
    }

    pub fn last_swapchain(&self) -> Option<SwapchainCreateDesc> {
        self.sim.lock().last_swapchain.clone()
    }

    /// Image indices in the order they were presented.
    pub fn presented_images(&self) -> Vec<u32> {
        self.sim.lock().presented.clone()
    }

    pub fn recorded_commands(&self, buffer: vk::CommandBuffer) -> Option<Vec<Command>> {
        self.sim
            .lock()
            .command_buffers
            .get(&buffer)
            .and_then(|cb| cb.commands.clone())
    }

    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.sim.lock().buffers.get(&buffer).map(|b| b.data.clone())
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<DescriptorWrite> {
        self.sim
            .lock()
            .descriptor_writes
            .get(&set)
            .cloned()
            .unwrap_or_default()
    }

    pub fn semaphore_signaled(&self, semaphore: vk::Semaphore) -> bool {
        self.sim
            .lock()
            .semaphores
            .get(&semaphore)
            .copied()
            .unwrap_or(false)
    }

    /// Driver objects that have been created and not destroyed.
    pub fn live_objects(&self) -> usize {
        let sim = self.sim.lock();
        sim.fences.len()
            + sim.semaphores.len()
            + sim.command_pools.len()
            + sim.command_buffers.len()
            + sim.surfaces.len()
            + sim.swapchains.len()
            + sim.buffers.len()
            + sim.textures.len()
            + sim.samplers.len()
            + sim.set_layouts.len()
            + sim.descriptor_pools.len()
            + sim.pipelines.len()
    }
}

impl Backend for HeadlessBackend {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let mut sim = self.sim.lock();
        let fence = vk::Fence::from_raw(sim.handle());
        sim.fences.insert(fence, signaled);
        sim.counters.fences_created += 1;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut sim = self.sim.lock();
        if sim.in_flight.iter().any(|entry| entry.fence == fence) {
            sim.validation(format!("fence {:#x} destroyed while in flight", fence.as_raw()));
        }
        sim.fences.remove(&fence);
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool> {
        let sim = self.sim.lock();
        sim.fences
            .get(&fence)
            .copied()
            .ok_or_else(|| GpuError::invalid_usage("status of unknown fence"))
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        sim.counters.fence_waits += 1;

        match sim.fences.get(&fence) {
            None => return Err(GpuError::invalid_usage("wait on unknown fence")),
            Some(true) => return Ok(()),
            Some(false) => {}
        }
        if timeout_ns == 0 {
            return Err(GpuError::Timeout);
        }
        match sim.in_flight.iter().position(|entry| entry.fence == fence) {
            Some(position) => {
                sim.retire_through(position);
                Ok(())
            }
            // Unsignaled and never submitted: a real wait would never return
            None => Err(GpuError::Timeout),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        if sim.in_flight.iter().any(|entry| entry.fence == fence) {
            sim.validation(format!("fence {:#x} reset while in flight", fence.as_raw()));
        }
        match sim.fences.get_mut(&fence) {
            Some(state) => {
                *state = false;
                Ok(())
            }
            None => Err(GpuError::invalid_usage("reset of unknown fence")),
        }
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let mut sim = self.sim.lock();
        let semaphore = vk::Semaphore::from_raw(sim.handle());
        sim.semaphores.insert(semaphore, false);
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.sim.lock().semaphores.remove(&semaphore);
    }

    fn create_command_pool(&self, _queue: QueueKind) -> GpuResult<vk::CommandPool> {
        let mut sim = self.sim.lock();
        let pool = vk::CommandPool::from_raw(sim.handle());
        sim.command_pools.insert(pool);
        sim.counters.command_pools_created += 1;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let mut sim = self.sim.lock();
        let owned: Vec<_> = sim
            .command_buffers
            .iter()
            .filter(|(_, cb)| cb.pool == pool)
            .map(|(handle, _)| *handle)
            .collect();
        for buffer in owned {
            if sim.is_in_flight(buffer) {
                sim.validation("command pool destroyed with work in flight".to_string());
            }
            sim.command_buffers.remove(&buffer);
        }
        sim.command_pools.remove(&pool);
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        _level: vk::CommandBufferLevel,
        count: u32,
    ) -> GpuResult<Vec<vk::CommandBuffer>> {
        let mut sim = self.sim.lock();
        if !sim.command_pools.contains(&pool) {
            return Err(GpuError::invalid_usage("allocation from unknown command pool"));
        }
        let mut buffers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let buffer = vk::CommandBuffer::from_raw(sim.handle());
            sim.command_buffers.insert(
                buffer,
                SimCommandBuffer {
                    pool,
                    commands: None,
                },
            );
            buffers.push(buffer);
        }
        Ok(buffers)
    }

    fn free_command_buffers(&self, _pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let mut sim = self.sim.lock();
        for buffer in buffers {
            if sim.is_in_flight(*buffer) {
                sim.validation(format!("command buffer {:#x} freed while in flight", buffer.as_raw()));
            }
            sim.command_buffers.remove(buffer);
        }
    }

    fn encode_commands(
        &self,
        buffer: vk::CommandBuffer,
        _level: vk::CommandBufferLevel,
        _usage: vk::CommandBufferUsageFlags,
        commands: &[Command],
    ) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        if sim.is_in_flight(buffer) {
            sim.validation(format!(
                "command buffer {:#x} re-recorded while in flight",
                buffer.as_raw()
            ));
        }
        match sim.command_buffers.get_mut(&buffer) {
            Some(cb) => {
                cb.commands = Some(commands.to_vec());
                Ok(())
            }
            None => Err(GpuError::invalid_usage("recording into unknown command buffer")),
        }
    }

    fn queue_submit(&self, queue: QueueKind, batch: &SubmitBatch<'_>, fence: vk::Fence) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        if let Some(result) = sim.fail_next_submit.take() {
            return Err(result.into());
        }
        sim.counters.submits += 1;

        for buffer in batch.command_buffers {
            let recorded = sim
                .command_buffers
                .get(buffer)
                .map(|cb| cb.commands.is_some())
                .unwrap_or(false);
            if !recorded {
                sim.validation(format!("submitted unrecorded command buffer {:#x}", buffer.as_raw()));
            }
        }
        for semaphore in batch.wait_semaphores {
            if !sim.semaphores.get(semaphore).copied().unwrap_or(false) {
                sim.validation(format!("submit waits on unsignaled semaphore {:#x}", semaphore.as_raw()));
            }
            sim.semaphores.insert(*semaphore, false);
        }
        for semaphore in batch.signal_semaphores {
            if sim.semaphores.get(semaphore).copied().unwrap_or(false) {
                sim.validation(format!("submit signals semaphore {:#x} twice", semaphore.as_raw()));
            }
            sim.semaphores.insert(*semaphore, true);
        }
        if fence != vk::Fence::null() {
            if sim.fences.get(&fence).copied().unwrap_or(false) {
                sim.validation(format!("submitted with signaled fence {:#x}", fence.as_raw()));
            }
            if sim.in_flight.iter().any(|entry| entry.fence == fence) {
                sim.validation(format!("fence {:#x} used by two submissions", fence.as_raw()));
            }
        }

        sim.in_flight.push_back(InFlight {
            queue,
            fence,
            command_buffers: batch.command_buffers.to_vec(),
        });
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        sim.counters.queue_wait_idle += 1;
        sim.retire_queue(queue);
        Ok(())
    }

    fn device_wait_idle(&self) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        sim.counters.device_wait_idle += 1;
        sim.retire_all();
        Ok(())
    }

    fn create_surface(&self, _window: &dyn Window) -> GpuResult<vk::SurfaceKHR> {
        let mut sim = self.sim.lock();
        let surface = vk::SurfaceKHR::from_raw(sim.handle());
        sim.surfaces.insert(surface);
        Ok(surface)
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        self.sim.lock().surfaces.remove(&surface);
    }

    fn present_family(&self, _surface: vk::SurfaceKHR) -> GpuResult<Option<u32>> {
        Ok(self.sim.lock().present_family)
    }

    fn surface_support(&self, _surface: vk::SurfaceKHR) -> GpuResult<SurfaceSupport> {
        Ok(self.sim.lock().surface_support.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainCreateDesc) -> GpuResult<RawSwapchain> {
        let mut sim = self.sim.lock();
        if !sim.surfaces.contains(&desc.surface) {
            return Err(GpuError::invalid_usage("swapchain for unknown surface"));
        }
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }

        let handle = vk::SwapchainKHR::from_raw(sim.handle());
        let mut images = Vec::new();
        let mut views = Vec::new();
        for _ in 0..desc.min_image_count {
            images.push(vk::Image::from_raw(sim.handle()));
            views.push(vk::ImageView::from_raw(sim.handle()));
        }
        sim.swapchains.insert(
            handle,
            SimSwapchain {
                images: images.clone(),
                views: views.clone(),
                next_image: 0,
            },
        );
        sim.last_swapchain = Some(desc.clone());
        sim.counters.swapchains_created += 1;

        Ok(RawSwapchain {
            handle,
            images,
            views,
        })
    }

    fn destroy_swapchain(&self, swapchain: &RawSwapchain) {
        let mut sim = self.sim.lock();
        if let Some(removed) = sim.swapchains.remove(&swapchain.handle) {
            debug_assert_eq!(removed.views.len(), removed.images.len());
            sim.counters.swapchains_destroyed += 1;
        }
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> GpuResult<AcquiredImage> {
        let mut sim = self.sim.lock();
        sim.counters.acquire_calls += 1;

        let scripted = sim.acquire_script.pop_front();
        let (index, suboptimal) = {
            let chain = sim
                .swapchains
                .get_mut(&swapchain)
                .ok_or_else(|| GpuError::invalid_usage("acquire from unknown swapchain"))?;
            let count = chain.images.len() as u32;
            let round_robin = chain.next_image;

            match scripted {
                Some(ScriptedAcquire::OutOfDate) => return Err(GpuError::OutOfDate),
                Some(ScriptedAcquire::Timeout) => return Err(GpuError::Timeout),
                Some(ScriptedAcquire::Image(index)) => {
                    chain.next_image = (index + 1) % count;
                    (index % count, false)
                }
                Some(ScriptedAcquire::Suboptimal) => {
                    chain.next_image = (round_robin + 1) % count;
                    (round_robin, true)
                }
                None => {
                    chain.next_image = (round_robin + 1) % count;
                    (round_robin, false)
                }
            }
        };

        if sim.semaphores.get(&signal).copied().unwrap_or(false) {
            sim.validation(format!("acquire signals semaphore {:#x} twice", signal.as_raw()));
        }
        sim.semaphores.insert(signal, true);

        Ok(AcquiredImage { index, suboptimal })
    }

    fn queue_present(
        &self,
        _present_family: u32,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> GpuResult<bool> {
        let mut sim = self.sim.lock();
        sim.counters.present_calls += 1;

        if !sim.swapchains.contains_key(&swapchain) {
            return Err(GpuError::invalid_usage("present to unknown swapchain"));
        }
        if !sim.semaphores.get(&wait).copied().unwrap_or(false) {
            sim.validation(format!("present waits on unsignaled semaphore {:#x}", wait.as_raw()));
        }
        sim.semaphores.insert(wait, false);

        match sim.present_script.pop_front() {
            Some(ScriptedPresent::OutOfDate) => Err(GpuError::OutOfDate),
            Some(ScriptedPresent::DeviceLost) => Err(GpuError::DeviceLost),
            Some(ScriptedPresent::Suboptimal) => {
                sim.presented.push(image_index);
                Ok(true)
            }
            None => {
                sim.presented.push(image_index);
                Ok(false)
            }
        }
    }

    fn create_buffer(&self, size: u64, _usage: vk::BufferUsageFlags, host_visible: bool) -> GpuResult<vk::Buffer> {
        let mut sim = self.sim.lock();
        let buffer = vk::Buffer::from_raw(sim.handle());
        sim.buffers.insert(
            buffer,
            SimBuffer {
                data: vec![0; size as usize],
                host_visible,
            },
        );
        Ok(buffer)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.sim.lock().buffers.remove(&buffer);
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        let target = sim
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::invalid_usage("write to unknown buffer"))?;
        if !target.host_visible {
            return Err(GpuError::invalid_usage("host write to device-local buffer"));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(GpuError::invalid_usage("host write past end of buffer"));
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn create_texture(&self, _desc: &TextureDesc) -> GpuResult<(vk::Image, vk::ImageView)> {
        let mut sim = self.sim.lock();
        let image = vk::Image::from_raw(sim.handle());
        let view = vk::ImageView::from_raw(sim.handle());
        sim.textures.insert(image);
        Ok((image, view))
    }

    fn destroy_texture(&self, image: vk::Image, _view: vk::ImageView) {
        self.sim.lock().textures.remove(&image);
    }

    fn create_sampler(&self, _state: &SamplerState, _anisotropy: Option<f32>) -> GpuResult<vk::Sampler> {
        let mut sim = self.sim.lock();
        let sampler = vk::Sampler::from_raw(sim.handle());
        sim.samplers.insert(sampler);
        sim.counters.samplers_created += 1;
        Ok(sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.sim.lock().samplers.remove(&sampler);
    }

    fn create_descriptor_set_layout(&self, _bindings: &[LayoutBinding]) -> GpuResult<vk::DescriptorSetLayout> {
        let mut sim = self.sim.lock();
        let layout = vk::DescriptorSetLayout::from_raw(sim.handle());
        sim.set_layouts.insert(layout);
        sim.counters.descriptor_set_layouts_created += 1;
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.sim.lock().set_layouts.remove(&layout);
    }

    fn create_descriptor_pool(&self, _sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> GpuResult<vk::DescriptorPool> {
        let mut sim = self.sim.lock();
        let pool = vk::DescriptorPool::from_raw(sim.handle());
        let capacity = sim.descriptor_pool_capacity.unwrap_or(max_sets);
        sim.descriptor_pools
            .insert(pool, SimDescriptorPool { capacity, used: 0 });
        sim.counters.descriptor_pools_created += 1;
        Ok(pool)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> GpuResult<()> {
        let mut sim = self.sim.lock();
        let entry = sim
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::invalid_usage("reset of unknown descriptor pool"))?;
        entry.used = 0;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.sim.lock().descriptor_pools.remove(&pool);
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> GpuResult<vk::DescriptorSet> {
        let mut sim = self.sim.lock();
        if !sim.set_layouts.contains(&layout) {
            return Err(GpuError::invalid_usage("allocation with unknown set layout"));
        }
        let entry = sim
            .descriptor_pools
            .get_mut(&pool)
            .ok_or_else(|| GpuError::invalid_usage("allocation from unknown descriptor pool"))?;
        if entry.used >= entry.capacity {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY));
        }
        entry.used += 1;
        Ok(vk::DescriptorSet::from_raw(sim.handle()))
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.sim
            .lock()
            .descriptor_writes
            .entry(set)
            .or_default()
            .extend_from_slice(writes);
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> GpuResult<RawPipeline> {
        let mut sim = self.sim.lock();
        if set_layouts.len() != desc.set_layouts.len() {
            return Err(GpuError::invalid_usage("pipeline layout count mismatch"));
        }
        if desc.shaders.iter().any(|shader| shader.bytecode.len() % 4 != 0) {
            return Err(GpuError::Vulkan(vk::Result::ERROR_INITIALIZATION_FAILED));
        }
        let pipeline = vk::Pipeline::from_raw(sim.handle());
        let layout = vk::PipelineLayout::from_raw(sim.handle());
        sim.pipelines.insert(pipeline);
        sim.counters.pipelines_created += 1;
        Ok(RawPipeline { pipeline, layout })
    }

    fn destroy_graphics_pipeline(&self, pipeline: RawPipeline) {
        self.sim.lock().pipelines.remove(&pipeline.pipeline);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_wait_completes_submissions_in_order() {
        let backend = HeadlessBackend::new();
        let first = backend.create_fence(false).unwrap();
        let second = backend.create_fence(false).unwrap();
        let batch = SubmitBatch::default();
        backend.queue_submit(QueueKind::Graphics, &batch, first).unwrap();
        backend.queue_submit(QueueKind::Graphics, &batch, second).unwrap();

        backend.wait_for_fence(first, u64::MAX).unwrap();
        assert!(backend.fence_signaled(first).unwrap());
        assert!(!backend.fence_signaled(second).unwrap());
        assert_eq!(backend.in_flight_submissions(), 1);
    }

    #[test]
    fn zero_timeout_polls_without_progress() {
        let backend = HeadlessBackend::new();
        let fence = backend.create_fence(false).unwrap();
        backend
            .queue_submit(QueueKind::Graphics, &SubmitBatch::default(), fence)
            .unwrap();
        assert!(matches!(backend.wait_for_fence(fence, 0), Err(GpuError::Timeout)));
        assert_eq!(backend.in_flight_submissions(), 1);
    }

    #[test]
    fn waiting_on_unsignaled_semaphore_is_reported() {
        let backend = HeadlessBackend::new();
        let semaphore = backend.create_semaphore().unwrap();
        let waits = [semaphore];
        let stages = [vk::PipelineStageFlags::ALL_COMMANDS];
        let batch = SubmitBatch {
            wait_semaphores: &waits,
            wait_stages: &stages,
            ..SubmitBatch::default()
        };
        backend
            .queue_submit(QueueKind::Graphics, &batch, vk::Fence::null())
            .unwrap();
        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn queue_idle_leaves_other_queues_pending() {
        let backend = HeadlessBackend::new();
        let graphics = backend.create_fence(false).unwrap();
        let transfer = backend.create_fence(false).unwrap();
        let batch = SubmitBatch::default();
        backend.queue_submit(QueueKind::Graphics, &batch, graphics).unwrap();
        backend.queue_submit(QueueKind::Transfer, &batch, transfer).unwrap();

        backend.queue_wait_idle(QueueKind::Transfer).unwrap();
        assert!(backend.fence_signaled(transfer).unwrap());
        assert!(!backend.fence_signaled(graphics).unwrap());
    }

    #[test]
    fn secondary_of_an_in_flight_primary_counts_as_in_flight() {
        let backend = HeadlessBackend::new();
        let pool = backend.create_command_pool(QueueKind::Graphics).unwrap();
        let secondary = backend
            .allocate_command_buffers(pool, vk::CommandBufferLevel::SECONDARY, 1)
            .unwrap()[0];
        let primary = backend
            .allocate_command_buffers(pool, vk::CommandBufferLevel::PRIMARY, 1)
            .unwrap()[0];
        let usage = vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        backend
            .encode_commands(secondary, vk::CommandBufferLevel::SECONDARY, usage, &[])
            .unwrap();
        backend
            .encode_commands(
                primary,
                vk::CommandBufferLevel::PRIMARY,
                usage,
                &[Command::ExecuteSecondary(secondary)],
            )
            .unwrap();

        let fence = backend.create_fence(false).unwrap();
        let submitted = [primary];
        let batch = SubmitBatch {
            command_buffers: &submitted,
            ..SubmitBatch::default()
        };
        backend.queue_submit(QueueKind::Graphics, &batch, fence).unwrap();

        // Re-recorded without waiting on the primary's fence
        backend
            .encode_commands(secondary, vk::CommandBufferLevel::SECONDARY, usage, &[])
            .unwrap();
        let errors = backend.validation_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("re-recorded while in flight"));

        backend.wait_for_fence(fence, u64::MAX).unwrap();
        backend
            .encode_commands(secondary, vk::CommandBufferLevel::SECONDARY, usage, &[])
            .unwrap();
        assert_eq!(backend.validation_errors().len(), 1);
    }
}
