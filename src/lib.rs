// =============================================================================
// HF-GPU - Vulkan GPU abstraction layer
// =============================================================================
//
// LAYERS:
// ┌─────────────────────────────────────────────────────────────────┐
// │  Renderer (per-window frames, staging uploads, buffer table)    │
// │    └── Device (caches, fence pool, command lists, submission)   │
// │          └── Swapchain (Valid / Stale / Recreating)             │
// │                └── Backend (Vulkan through ash, or headless)    │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. begin_frame: rebuild a stale swapchain, wait the slot, acquire
// 2. record into the frame's command list
// 3. end_frame: submit (waits on image-available, signals work-finished)
// 4. present, waiting on work-finished
//
// =============================================================================

pub mod backend;
pub mod command;
pub mod config;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod format;
pub mod input;
pub mod pipeline;
pub mod renderer;
pub mod resource;
pub mod sampler;
pub mod staging;
pub mod swapchain;
pub mod sync;
pub mod window;

pub use backend::{Backend, HeadlessBackend, QueueKind, VulkanBackend};
pub use command::{Attachment, BufferImageCopy, ClearValue, CommandList, CommandListLevel, LoadOp, RenderpassInfo, StoreOp};
pub use descriptor::{DescriptorSet, DescriptorSetLayout};
pub use device::{Device, DeviceSettings, SupportedFeatures};
pub use error::{GpuError, GpuResult};
pub use format::Format;
pub use pipeline::{GraphicsPipeline, GraphicsPipelineDesc, IndexType, ShaderStage};
pub use renderer::{BufferId, FrameContext, Renderer, RendererSettings, WindowId};
pub use resource::{Buffer, BufferDesc, BufferUsage, BufferVisibility, ImageLayout, Texture, TextureDesc};
pub use sampler::{FilterMode, Sampler, SamplerState, WrapMode};
pub use swapchain::{PresentStatus, Surface, Swapchain, SwapchainSettings, SwapchainState};
pub use sync::{Fence, FencePool, FenceSlot, Semaphore};
pub use window::{HeadlessWindow, Window, WindowState};
