// Vulkan backend
//
// Responsibilities:
// - Instance creation with validation layers
// - Physical device selection (prefer discrete GPU)
// - Logical device + one queue per distinct family
// - Memory allocator setup
// - Translating the engine's recorded command stream into vkCmd* calls

mod descriptors;
mod encode;
mod instance;
mod memory;
mod pipeline;
mod present;

use ash::{vk, Entry};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::RawDisplayHandle;
use std::mem::ManuallyDrop;

use self::instance::DebugMessenger;
use self::memory::Allocations;
use super::{
    AcquiredImage, AdapterInfo, Backend, QueueKind, RawPipeline, RawSwapchain, SubmitBatch,
    SurfaceSupport, SwapchainCreateDesc,
};
use crate::command::Command;
use crate::descriptor::{DescriptorWrite, LayoutBinding};
use crate::error::{fatal, GpuError, GpuResult};
use crate::pipeline::GraphicsPipelineDesc;
use crate::resource::TextureDesc;
use crate::sampler::SamplerState;
use crate::window::Window;

pub struct VulkanBackend {
    adapter: AdapterInfo,
    // Dropped by hand before the device
    allocator: ManuallyDrop<Mutex<Allocator>>,
    allocations: Mutex<Allocations>,
    swapchain_loader: ash::khr::swapchain::Device,
    surface_loader: ash::khr::surface::Instance,
    /// Distinct queue families with a created queue, graphics first.
    families: Vec<u32>,
    /// Queues are externally synchronised: submit, present and idle waits
    /// all take this.
    queue_lock: Mutex<()>,
    /// Same for command pools and the buffers allocated from them.
    pool_lock: Mutex<()>,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    debug_utils: Option<DebugMessenger>,
    instance: ash::Instance,
    entry: Entry,
}

unsafe fn destroy_instance(instance: &ash::Instance, debug_utils: Option<DebugMessenger>) {
    if let Some((debug_utils, messenger)) = debug_utils {
        debug_utils.destroy_debug_utils_messenger(messenger, None);
    }
    instance.destroy_instance(None);
}

impl VulkanBackend {
    /// Create the backend
    ///
    /// # Arguments
    /// * `app_name` - Application name for debugging
    /// * `enable_validation` - Enable Vulkan validation layers
    /// * `display` - Display the windows will live on, for surface extensions
    pub fn new(app_name: &str, enable_validation: bool, display: RawDisplayHandle) -> GpuResult<Self> {
        log::info!("Creating Vulkan backend: {}", app_name);

        let entry = unsafe { Entry::load() }
            .map_err(|err| fatal("Vulkan loader", GpuError::Loading(err.to_string())))?;

        let instance = instance::create_instance(&entry, app_name, enable_validation, display)
            .map_err(|err| fatal("Vulkan instance", err))?;

        let debug_utils = if enable_validation {
            match instance::setup_debug_messenger(&entry, &instance) {
                Ok(messenger) => Some(messenger),
                Err(err) => {
                    log::warn!("Validation requested but debug messenger failed: {}", err);
                    None
                }
            }
        } else {
            None
        };

        let choice = match instance::pick_physical_device(&instance) {
            Ok(choice) => choice,
            Err(err) => {
                unsafe { destroy_instance(&instance, debug_utils) };
                return Err(fatal("physical device", err));
            }
        };

        let device = match instance::create_logical_device(&instance, &choice) {
            Ok(device) => device,
            Err(err) => {
                unsafe { destroy_instance(&instance, debug_utils) };
                return Err(fatal("logical device", err));
            }
        };

        let allocator = match Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device: choice.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        }) {
            Ok(allocator) => allocator,
            Err(err) => {
                unsafe {
                    device.destroy_device(None);
                    destroy_instance(&instance, debug_utils);
                }
                return Err(fatal("memory allocator", GpuError::Loading(err.to_string())));
            }
        };

        let properties = &choice.properties;
        let name = properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown GPU".to_string());
        log::info!("Selected GPU: {}", name);
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Queue families: {:?}", choice.queue_families);

        let adapter = AdapterInfo {
            name,
            queue_families: choice.queue_families,
            sampler_anisotropy: choice.features.sampler_anisotropy == vk::TRUE,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
        };

        Ok(Self {
            families: instance::unique_families(&choice.queue_families),
            swapchain_loader: ash::khr::swapchain::Device::new(&instance, &device),
            surface_loader: ash::khr::surface::Instance::new(&entry, &instance),
            allocator: ManuallyDrop::new(Mutex::new(allocator)),
            allocations: Mutex::new(Allocations::default()),
            queue_lock: Mutex::new(()),
            pool_lock: Mutex::new(()),
            physical_device: choice.physical_device,
            adapter,
            device,
            debug_utils,
            instance,
            entry,
        })
    }

    fn queue(&self, kind: QueueKind) -> vk::Queue {
        let family = self.adapter.queue_families.index(kind);
        unsafe { self.device.get_device_queue(family, 0) }
    }
}

impl Backend for VulkanBackend {
    fn adapter(&self) -> &AdapterInfo {
        &self.adapter
    }

    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
        }?;
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool> {
        let signaled = unsafe { self.device.get_fence_status(fence) }?;
        Ok(signaled)
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }?;
        Ok(())
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }?;
        Ok(())
    }

    fn create_semaphore(&self) -> GpuResult<vk::Semaphore> {
        let semaphore = unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }?;
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_command_pool(&self, queue: QueueKind) -> GpuResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.adapter.queue_families.index(queue));
        let pool = unsafe { self.device.create_command_pool(&create_info, None) }?;
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        let _guard = self.pool_lock.lock();
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> GpuResult<Vec<vk::CommandBuffer>> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(level)
            .command_buffer_count(count);
        let _guard = self.pool_lock.lock();
        let buffers = unsafe { self.device.allocate_command_buffers(&allocate_info) }?;
        Ok(buffers)
    }

    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]) {
        let _guard = self.pool_lock.lock();
        unsafe { self.device.free_command_buffers(pool, buffers) };
    }

    fn encode_commands(
        &self,
        buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
        usage: vk::CommandBufferUsageFlags,
        commands: &[Command],
    ) -> GpuResult<()> {
        self.encode(buffer, level, usage, commands)
    }

    fn queue_submit(&self, queue: QueueKind, batch: &SubmitBatch<'_>, fence: vk::Fence) -> GpuResult<()> {
        let submit = vk::SubmitInfo::default()
            .command_buffers(batch.command_buffers)
            .wait_semaphores(batch.wait_semaphores)
            .wait_dst_stage_mask(batch.wait_stages)
            .signal_semaphores(batch.signal_semaphores);

        let queue = self.queue(queue);
        let _guard = self.queue_lock.lock();
        unsafe { self.device.queue_submit(queue, &[submit], fence) }?;
        Ok(())
    }

    fn queue_wait_idle(&self, queue: QueueKind) -> GpuResult<()> {
        let queue = self.queue(queue);
        let _guard = self.queue_lock.lock();
        unsafe { self.device.queue_wait_idle(queue) }?;
        Ok(())
    }

    fn device_wait_idle(&self) -> GpuResult<()> {
        let _guard = self.queue_lock.lock();
        unsafe { self.device.device_wait_idle() }?;
        Ok(())
    }

    fn create_surface(&self, window: &dyn Window) -> GpuResult<vk::SurfaceKHR> {
        self.make_surface(window)
    }

    fn destroy_surface(&self, surface: vk::SurfaceKHR) {
        unsafe { self.surface_loader.destroy_surface(surface, None) };
    }

    fn present_family(&self, surface: vk::SurfaceKHR) -> GpuResult<Option<u32>> {
        self.find_present_family(surface)
    }

    fn surface_support(&self, surface: vk::SurfaceKHR) -> GpuResult<SurfaceSupport> {
        self.query_surface_support(surface)
    }

    fn create_swapchain(&self, desc: &SwapchainCreateDesc) -> GpuResult<RawSwapchain> {
        self.make_swapchain(desc)
    }

    fn destroy_swapchain(&self, swapchain: &RawSwapchain) {
        self.release_swapchain(swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> GpuResult<AcquiredImage> {
        self.acquire(swapchain, timeout_ns, signal)
    }

    fn queue_present(
        &self,
        present_family: u32,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> GpuResult<bool> {
        self.present(present_family, swapchain, image_index, wait)
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags, host_visible: bool) -> GpuResult<vk::Buffer> {
        self.make_buffer(size, usage, host_visible)
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        self.release_buffer(buffer);
    }

    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        self.write_mapped(buffer, offset, data)
    }

    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<(vk::Image, vk::ImageView)> {
        self.make_texture(desc)
    }

    fn destroy_texture(&self, image: vk::Image, view: vk::ImageView) {
        self.release_texture(image, view);
    }

    fn create_sampler(&self, state: &SamplerState, anisotropy: Option<f32>) -> GpuResult<vk::Sampler> {
        self.make_sampler(state, anisotropy)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        unsafe { self.device.destroy_sampler(sampler, None) };
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> GpuResult<vk::DescriptorSetLayout> {
        self.make_set_layout(bindings)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> GpuResult<vk::DescriptorPool> {
        self.make_descriptor_pool(sizes, max_sets)
    }

    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())
        }?;
        Ok(())
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> GpuResult<vk::DescriptorSet> {
        self.allocate_set(pool, layout)
    }

    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        self.write_set(set, writes);
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> GpuResult<RawPipeline> {
        self.make_graphics_pipeline(desc, set_layouts)
    }

    fn destroy_graphics_pipeline(&self, pipeline: RawPipeline) {
        self.release_graphics_pipeline(pipeline);
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan backend...");

        if let Err(err) = unsafe { self.device.device_wait_idle() } {
            log::error!("Device wait idle failed during teardown: {}", err);
        }

        // Anything still allocated here leaked past its owner
        let leaked = std::mem::take(&mut *self.allocations.lock());
        if !leaked.buffers.is_empty() || !leaked.images.is_empty() {
            log::warn!(
                "{} buffers and {} images still alive at teardown",
                leaked.buffers.len(),
                leaked.images.len()
            );
        }
        for (buffer, allocation) in leaked.buffers {
            unsafe { self.device.destroy_buffer(buffer, None) };
            let _ = self.allocator.lock().free(allocation);
        }
        for (image, allocation) in leaked.images {
            unsafe { self.device.destroy_image(image, None) };
            let _ = self.allocator.lock().free(allocation);
        }

        // Cleanup in reverse order
        unsafe {
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
            destroy_instance(&self.instance, self.debug_utils.take());
        }
    }
}
