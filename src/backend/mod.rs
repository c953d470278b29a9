// Backend seam between the engine GPU layer and the driver
//
// Everything above this trait (fence pool, command lists, swapchain state
// machine, descriptor allocation, renderer) is written once against it.
// `VulkanBackend` talks to a real driver through ash; `HeadlessBackend`
// simulates a GPU so the frame lifecycle can be exercised without one.

pub mod headless;
pub mod vulkan;

pub use headless::{HeadlessBackend, HeadlessCounters, ScriptedAcquire, ScriptedPresent};
pub use vulkan::VulkanBackend;

use ash::vk;

use crate::command::Command;
use crate::descriptor::{DescriptorWrite, LayoutBinding};
use crate::error::GpuResult;
use crate::pipeline::GraphicsPipelineDesc;
use crate::resource::TextureDesc;
use crate::sampler::SamplerState;
use crate::window::Window;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Graphics,
    Compute,
    Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

impl QueueFamilies {
    pub fn index(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.graphics,
            QueueKind::Compute => self.compute,
            QueueKind::Transfer => self.transfer,
        }
    }
}

/// What the selected physical device offers.
#[derive(Debug, Clone)]
pub struct AdapterInfo {
    pub name: String,
    pub queue_families: QueueFamilies,
    pub sampler_anisotropy: bool,
    pub max_sampler_anisotropy: f32,
}

#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

#[derive(Debug, Clone)]
pub struct SwapchainCreateDesc {
    pub surface: vk::SurfaceKHR,
    pub min_image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub graphics_family: u32,
    pub present_family: u32,
}

#[derive(Debug, Clone)]
pub struct RawSwapchain {
    pub handle: vk::SwapchainKHR,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

/// One queue submission: command buffers plus the semaphores it orders on.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitBatch<'a> {
    pub command_buffers: &'a [vk::CommandBuffer],
    pub wait_semaphores: &'a [vk::Semaphore],
    pub wait_stages: &'a [vk::PipelineStageFlags],
    pub signal_semaphores: &'a [vk::Semaphore],
}

#[derive(Debug, Clone, Copy)]
pub struct RawPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
}

pub trait Backend: Send + Sync {
    fn adapter(&self) -> &AdapterInfo;

    // Synchronisation primitives
    fn create_fence(&self, signaled: bool) -> GpuResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn fence_signaled(&self, fence: vk::Fence) -> GpuResult<bool>;
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> GpuResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;
    fn create_semaphore(&self) -> GpuResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // Command recording
    fn create_command_pool(&self, queue: QueueKind) -> GpuResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffers(
        &self,
        pool: vk::CommandPool,
        level: vk::CommandBufferLevel,
        count: u32,
    ) -> GpuResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, pool: vk::CommandPool, buffers: &[vk::CommandBuffer]);
    /// Begin, record `commands` and end `buffer` in one go.
    fn encode_commands(
        &self,
        buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
        usage: vk::CommandBufferUsageFlags,
        commands: &[Command],
    ) -> GpuResult<()>;

    // Queues
    fn queue_submit(&self, queue: QueueKind, batch: &SubmitBatch<'_>, fence: vk::Fence) -> GpuResult<()>;
    fn queue_wait_idle(&self, queue: QueueKind) -> GpuResult<()>;
    fn device_wait_idle(&self) -> GpuResult<()>;

    // Presentation
    fn create_surface(&self, window: &dyn Window) -> GpuResult<vk::SurfaceKHR>;
    fn destroy_surface(&self, surface: vk::SurfaceKHR);
    /// First queue family able to present to `surface`, if any.
    fn present_family(&self, surface: vk::SurfaceKHR) -> GpuResult<Option<u32>>;
    fn surface_support(&self, surface: vk::SurfaceKHR) -> GpuResult<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainCreateDesc) -> GpuResult<RawSwapchain>;
    fn destroy_swapchain(&self, swapchain: &RawSwapchain);
    /// `Err(GpuError::OutOfDate)` when the swapchain must be rebuilt.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> GpuResult<AcquiredImage>;
    /// Returns whether the swapchain is suboptimal.
    fn queue_present(
        &self,
        present_family: u32,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> GpuResult<bool>;

    // Memory resources
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags, host_visible: bool) -> GpuResult<vk::Buffer>;
    fn destroy_buffer(&self, buffer: vk::Buffer);
    /// Host write into a host-visible buffer.
    fn write_buffer(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()>;
    fn create_texture(&self, desc: &TextureDesc) -> GpuResult<(vk::Image, vk::ImageView)>;
    fn destroy_texture(&self, image: vk::Image, view: vk::ImageView);
    fn create_sampler(&self, state: &SamplerState, anisotropy: Option<f32>) -> GpuResult<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // Binding model
    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> GpuResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> GpuResult<vk::DescriptorPool>;
    fn reset_descriptor_pool(&self, pool: vk::DescriptorPool) -> GpuResult<()>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> GpuResult<vk::DescriptorSet>;
    fn update_descriptor_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]);

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> GpuResult<RawPipeline>;
    fn destroy_graphics_pipeline(&self, pipeline: RawPipeline);
}
