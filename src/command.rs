// Command lists and layout-driven barriers
//
// Recording is done on the host into a `Command` list which the backend
// encodes into its native command buffer when the list is ended. Image
// transitions are derived from the layout each texture is tracked in:
// layout -> access mask -> pipeline stages.

use ash::vk;
use std::sync::Arc;

use crate::backend::{Backend, QueueKind};
use crate::descriptor::DescriptorSet;
use crate::error::{GpuError, GpuResult};
use crate::pipeline::{GraphicsPipeline, IndexType};
use crate::resource::{range_fits, Buffer, ImageLayout, Texture};
use crate::sync::{Fence, FenceSlot, FenceTicket};

/// Buffer to texture copy region. A row length or image height of zero
/// means the texels are tightly packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferImageCopy {
    pub buffer_offset: u64,
    pub buffer_row_length: u32,
    pub buffer_image_height: u32,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub layer_count: u32,
    pub image_offset: vk::Offset3D,
    pub image_extent: vk::Extent3D,
}

impl BufferImageCopy {
    /// Tightly packed texels covering all of mip 0.
    pub fn whole(texture: &Texture) -> Self {
        Self {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: texture.array_layers,
            image_offset: vk::Offset3D::default(),
            image_extent: texture.extent,
        }
    }

    pub fn with_buffer_offset(mut self, offset: u64) -> Self {
        self.buffer_offset = offset;
        self
    }

    pub(crate) fn to_vk(self, aspect_mask: vk::ImageAspectFlags) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: self.buffer_offset,
            buffer_row_length: self.buffer_row_length,
            buffer_image_height: self.buffer_image_height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: self.mip_level,
                base_array_layer: self.base_array_layer,
                layer_count: self.layer_count,
            },
            image_offset: self.image_offset,
            image_extent: self.image_extent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Colour { r: f32, g: f32, b: f32, a: f32 },
    DepthStencil { depth: f32, stencil: u32 },
}

impl ClearValue {
    pub fn colour(r: f32, g: f32, b: f32, a: f32) -> Self {
        ClearValue::Colour { r, g, b, a }
    }

    pub fn depth(depth: f32) -> Self {
        ClearValue::DepthStencil { depth, stencil: 0 }
    }

    pub(crate) fn to_vk(self) -> vk::ClearValue {
        match self {
            ClearValue::Colour { r, g, b, a } => vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [r, g, b, a],
                },
            },
            ClearValue::DepthStencil { depth, stencil } => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

impl From<glam::Vec4> for ClearValue {
    fn from(colour: glam::Vec4) -> Self {
        ClearValue::colour(colour.x, colour.y, colour.z, colour.w)
    }
}

impl Default for ClearValue {
    fn default() -> Self {
        ClearValue::colour(0.0, 0.0, 0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadOp {
    Load,
    #[default]
    Clear,
    DontCare,
}

impl LoadOp {
    fn to_vk(self) -> vk::AttachmentLoadOp {
        match self {
            LoadOp::Load => vk::AttachmentLoadOp::LOAD,
            LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
            LoadOp::DontCare => vk::AttachmentLoadOp::DONT_CARE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StoreOp {
    #[default]
    Store,
    Discard,
}

impl StoreOp {
    fn to_vk(self) -> vk::AttachmentStoreOp {
        match self {
            StoreOp::Store => vk::AttachmentStoreOp::STORE,
            StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Attachment<'a> {
    pub texture: &'a Texture,
    pub load: LoadOp,
    pub store: StoreOp,
    pub clear: ClearValue,
}

impl<'a> Attachment<'a> {
    pub fn clear(texture: &'a Texture, clear: ClearValue) -> Self {
        Self {
            texture,
            load: LoadOp::Clear,
            store: StoreOp::Store,
            clear,
        }
    }

    pub fn load(texture: &'a Texture) -> Self {
        Self {
            texture,
            load: LoadOp::Load,
            store: StoreOp::Store,
            clear: ClearValue::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RenderpassInfo<'a> {
    pub colour: Vec<Attachment<'a>>,
    pub depth: Option<Attachment<'a>>,
}

impl<'a> RenderpassInfo<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn colour(mut self, attachment: Attachment<'a>) -> Self {
        self.colour.push(attachment);
        self
    }

    pub fn depth(mut self, attachment: Attachment<'a>) -> Self {
        self.depth = Some(attachment);
        self
    }
}

// --- Recorded commands ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderingAttachment {
    pub view: vk::ImageView,
    pub layout: vk::ImageLayout,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub clear: ClearValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderingInfo {
    pub area: vk::Extent2D,
    pub colour: Vec<RenderingAttachment>,
    pub depth: Option<RenderingAttachment>,
}

#[derive(Debug, Clone)]
pub enum Command {
    ImageBarrier(ImageBarrier),
    BeginRendering(RenderingInfo),
    EndRendering,
    SetViewport(vk::Viewport),
    SetScissor(vk::Rect2D),
    BindPipeline(vk::Pipeline),
    BindVertexBuffer {
        binding: u32,
        buffer: vk::Buffer,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: vk::Buffer,
        offset: u64,
        index_type: vk::IndexType,
    },
    BindDescriptorSets {
        layout: vk::PipelineLayout,
        first_set: u32,
        sets: Vec<vk::DescriptorSet>,
    },
    Draw {
        vertex_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        index_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        region: vk::BufferCopy,
    },
    CopyBufferToImage {
        buffer: vk::Buffer,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: vk::BufferImageCopy,
    },
    ExecuteSecondary(vk::CommandBuffer),
}

// --- Barrier tables ---

/// Accesses an image in `layout` may be subject to.
pub fn access_mask_for_layout(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::PREINITIALIZED => vk::AccessFlags::HOST_WRITE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags::MEMORY_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
        }
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

/// Pipeline stages that perform any of the accesses in `access`.
pub fn stages_for_access(access: vk::AccessFlags) -> vk::PipelineStageFlags {
    let shader_stages = vk::PipelineStageFlags::VERTEX_SHADER
        | vk::PipelineStageFlags::FRAGMENT_SHADER
        | vk::PipelineStageFlags::COMPUTE_SHADER;
    let fragment_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;

    let mut stages = vk::PipelineStageFlags::empty();
    let mut bits = access.as_raw();
    while bits != 0 {
        let bit = bits & bits.wrapping_neg();
        bits &= !bit;

        stages |= match vk::AccessFlags::from_raw(bit) {
            vk::AccessFlags::INDIRECT_COMMAND_READ => vk::PipelineStageFlags::DRAW_INDIRECT,
            vk::AccessFlags::INDEX_READ | vk::AccessFlags::VERTEX_ATTRIBUTE_READ => {
                vk::PipelineStageFlags::VERTEX_INPUT
            }
            vk::AccessFlags::UNIFORM_READ
            | vk::AccessFlags::SHADER_READ
            | vk::AccessFlags::SHADER_WRITE => shader_stages,
            vk::AccessFlags::INPUT_ATTACHMENT_READ => vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE => {
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
            }
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE => fragment_tests,
            vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE => {
                vk::PipelineStageFlags::TRANSFER
            }
            vk::AccessFlags::HOST_READ | vk::AccessFlags::HOST_WRITE => {
                vk::PipelineStageFlags::HOST
            }
            _ => vk::PipelineStageFlags::empty(),
        };
    }
    stages
}

/// Source and destination stages for an `old_layout -> new_layout` transition.
pub fn barrier_stages(
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) -> (vk::PipelineStageFlags, vk::PipelineStageFlags) {
    let src = match old_layout {
        vk::ImageLayout::UNDEFINED => vk::PipelineStageFlags::TOP_OF_PIPE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        layout => {
            let stages = stages_for_access(access_mask_for_layout(layout));
            if stages.is_empty() {
                vk::PipelineStageFlags::TOP_OF_PIPE
            } else {
                stages
            }
        }
    };

    let dst = match new_layout {
        vk::ImageLayout::PRESENT_SRC_KHR => vk::PipelineStageFlags::BOTTOM_OF_PIPE,
        layout => {
            let stages = stages_for_access(access_mask_for_layout(layout));
            if stages.is_empty() {
                vk::PipelineStageFlags::BOTTOM_OF_PIPE
            } else {
                stages
            }
        }
    };

    (src, dst)
}

fn transition_barrier(texture: &Texture, new_layout: vk::ImageLayout) -> ImageBarrier {
    let old_layout = texture.layout();
    let (src_stage, dst_stage) = barrier_stages(old_layout, new_layout);
    ImageBarrier {
        image: texture.image,
        aspect: texture.aspect(),
        mip_levels: texture.mip_levels,
        array_layers: texture.array_layers,
        old_layout,
        new_layout,
        src_access: access_mask_for_layout(old_layout),
        dst_access: access_mask_for_layout(new_layout),
        src_stage,
        dst_stage,
    }
}

// --- Command lists ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandListLevel {
    Primary,
    Secondary,
}

impl CommandListLevel {
    pub(crate) fn to_vk(self) -> vk::CommandBufferLevel {
        match self {
            CommandListLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandListLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Initial,
    Recording,
    Executable,
    /// Single-use list that has been submitted.
    Consumed,
}

pub struct CommandList {
    backend: Arc<dyn Backend>,
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) pool: vk::CommandPool,
    level: CommandListLevel,
    queue: QueueKind,
    single_use: bool,
    fence_timeout_ns: u64,
    state: RecordingState,
    commands: Vec<Command>,
    bound_pipeline: Option<GraphicsPipeline>,
    in_renderpass: bool,
    pub(crate) finished: FenceSlot,
    secondaries: Vec<FenceSlot>,
}

impl CommandList {
    pub(crate) fn new(
        backend: Arc<dyn Backend>,
        buffer: vk::CommandBuffer,
        pool: vk::CommandPool,
        level: CommandListLevel,
        queue: QueueKind,
        single_use: bool,
        fence_timeout_ns: u64,
    ) -> Self {
        Self {
            backend,
            buffer,
            pool,
            level,
            queue,
            single_use,
            fence_timeout_ns,
            state: RecordingState::Initial,
            commands: Vec::new(),
            bound_pipeline: None,
            in_renderpass: false,
            finished: FenceSlot::new(),
            secondaries: Vec::new(),
        }
    }

    pub fn raw(&self) -> vk::CommandBuffer {
        self.buffer
    }

    pub fn level(&self) -> CommandListLevel {
        self.level
    }

    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    pub fn state(&self) -> RecordingState {
        self.state
    }

    pub fn is_single_use(&self) -> bool {
        self.single_use
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Fence of the last submission this list was part of, until it is
    /// waited on by `begin`.
    pub fn finished_fence(&self) -> Option<Fence> {
        self.finished.get()
    }

    fn usage_flags(&self) -> vk::CommandBufferUsageFlags {
        if self.single_use {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
        }
    }

    fn push(&mut self, command: Command) -> GpuResult<()> {
        if self.state != RecordingState::Recording {
            return Err(GpuError::invalid_usage(format!(
                "command recorded while list is {:?}",
                self.state
            )));
        }
        self.commands.push(command);
        Ok(())
    }

    fn require_outside_renderpass(&self, what: &str) -> GpuResult<()> {
        if self.in_renderpass {
            return Err(GpuError::invalid_usage(format!("{what} inside a renderpass")));
        }
        Ok(())
    }

    /// Start recording. Blocks until the GPU has finished the previous
    /// submission of this list.
    pub fn begin(&mut self) -> GpuResult<()> {
        if self.state == RecordingState::Consumed {
            return Err(GpuError::invalid_usage("single-use command list reused after submission"));
        }

        self.finished.wait(self.backend.as_ref(), self.fence_timeout_ns)?;

        self.secondaries.clear();
        self.commands.clear();
        self.bound_pipeline = None;
        self.in_renderpass = false;
        self.state = RecordingState::Recording;
        Ok(())
    }

    pub fn end(&mut self) -> GpuResult<()> {
        if self.state != RecordingState::Recording {
            return Err(GpuError::invalid_usage("end called on a list that isn't recording"));
        }
        if self.in_renderpass {
            return Err(GpuError::invalid_usage("end called inside a renderpass"));
        }

        self.backend.encode_commands(
            self.buffer,
            self.level.to_vk(),
            self.usage_flags(),
            &self.commands,
        )?;
        self.state = RecordingState::Executable;
        Ok(())
    }

    /// Transition `texture` from its tracked layout to `new_layout`.
    pub fn resource_barrier(&mut self, texture: &Texture, new_layout: ImageLayout) -> GpuResult<()> {
        self.require_outside_renderpass("resource barrier")?;
        self.transition(texture, new_layout.to_vk())
    }

    fn transition(&mut self, texture: &Texture, new_layout: vk::ImageLayout) -> GpuResult<()> {
        let barrier = transition_barrier(texture, new_layout);
        self.push(Command::ImageBarrier(barrier))?;
        texture.set_tracked_layout(new_layout);
        Ok(())
    }

    /// Begin dynamic rendering, first moving each attachment into its
    /// attachment layout if it isn't there already.
    pub fn begin_renderpass(&mut self, info: &RenderpassInfo<'_>) -> GpuResult<()> {
        self.require_outside_renderpass("begin_renderpass")?;

        let area = info
            .colour
            .first()
            .or(info.depth.as_ref())
            .map(|a| a.texture.extent_2d())
            .ok_or_else(|| GpuError::invalid_usage("renderpass without attachments"))?;

        let mut colour = Vec::with_capacity(info.colour.len());
        for attachment in &info.colour {
            if attachment.texture.layout() != vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL {
                self.transition(attachment.texture, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)?;
            }
            colour.push(RenderingAttachment {
                view: attachment.texture.view,
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                load_op: attachment.load.to_vk(),
                store_op: attachment.store.to_vk(),
                clear: attachment.clear,
            });
        }

        let mut depth = None;
        if let Some(attachment) = &info.depth {
            if attachment.texture.layout() != vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL {
                self.transition(
                    attachment.texture,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                )?;
            }
            depth = Some(RenderingAttachment {
                view: attachment.texture.view,
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                load_op: attachment.load.to_vk(),
                store_op: attachment.store.to_vk(),
                clear: attachment.clear,
            });
        }

        self.push(Command::BeginRendering(RenderingInfo {
            area,
            colour,
            depth,
        }))?;
        self.in_renderpass = true;
        Ok(())
    }

    pub fn end_renderpass(&mut self) -> GpuResult<()> {
        if !self.in_renderpass {
            return Err(GpuError::invalid_usage("end_renderpass without begin_renderpass"));
        }
        self.push(Command::EndRendering)?;
        self.in_renderpass = false;
        Ok(())
    }

    pub fn set_viewport(&mut self, x: f32, y: f32, width: f32, height: f32) -> GpuResult<()> {
        self.push(Command::SetViewport(vk::Viewport {
            x,
            y,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }))
    }

    pub fn set_scissor(&mut self, x: i32, y: i32, width: u32, height: u32) -> GpuResult<()> {
        self.push(Command::SetScissor(vk::Rect2D {
            offset: vk::Offset2D { x, y },
            extent: vk::Extent2D { width, height },
        }))
    }

    pub fn bind_pipeline(&mut self, pipeline: &GraphicsPipeline) -> GpuResult<()> {
        self.push(Command::BindPipeline(pipeline.pipeline))?;
        self.bound_pipeline = Some(*pipeline);
        Ok(())
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: &Buffer, offset: u64) -> GpuResult<()> {
        self.push(Command::BindVertexBuffer {
            binding,
            buffer: buffer.handle,
            offset,
        })
    }

    pub fn bind_index_buffer(&mut self, buffer: &Buffer, offset: u64, index_type: IndexType) -> GpuResult<()> {
        self.push(Command::BindIndexBuffer {
            buffer: buffer.handle,
            offset,
            index_type: index_type.to_vk(),
        })
    }

    /// Bind `sets` starting at `first_set`, against the layout of the
    /// currently bound pipeline.
    pub fn bind_descriptor_sets(&mut self, sets: &[&DescriptorSet], first_set: u32) -> GpuResult<()> {
        let pipeline = self
            .bound_pipeline
            .ok_or_else(|| GpuError::invalid_usage("descriptor sets bound before a pipeline"))?;
        self.push(Command::BindDescriptorSets {
            layout: pipeline.layout,
            first_set,
            sets: sets.iter().map(|s| s.handle).collect(),
        })
    }

    fn require_draw_state(&self) -> GpuResult<()> {
        if !self.in_renderpass {
            return Err(GpuError::invalid_usage("draw outside a renderpass"));
        }
        if self.bound_pipeline.is_none() {
            return Err(GpuError::invalid_usage("draw without a bound pipeline"));
        }
        Ok(())
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) -> GpuResult<()> {
        self.require_draw_state()?;
        self.push(Command::Draw {
            vertex_count,
            first_vertex,
        })
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, vertex_offset: i32) -> GpuResult<()> {
        self.require_draw_state()?;
        self.push(Command::DrawIndexed {
            index_count,
            first_index,
            vertex_offset,
        })
    }

    pub fn copy_buffer(
        &mut self,
        src: &Buffer,
        src_offset: u64,
        dst: &Buffer,
        dst_offset: u64,
        size: u64,
    ) -> GpuResult<()> {
        self.require_outside_renderpass("copy_buffer")?;
        if !range_fits(src_offset, size, src.size) || !range_fits(dst_offset, size, dst.size) {
            return Err(GpuError::invalid_usage(format!(
                "copy of {size} bytes out of bounds (src {}/{}, dst {}/{})",
                src_offset, src.size, dst_offset, dst.size
            )));
        }
        self.push(Command::CopyBuffer {
            src: src.handle,
            dst: dst.handle,
            region: vk::BufferCopy {
                src_offset,
                dst_offset,
                size,
            },
        })
    }

    /// Copy texels from `src` into `texture` in whatever layout the texture
    /// is tracked in. No barrier is recorded.
    pub fn copy_buffer_to_texture(
        &mut self,
        src: &Buffer,
        texture: &Texture,
        region: &BufferImageCopy,
    ) -> GpuResult<()> {
        self.require_outside_renderpass("copy_buffer_to_texture")?;
        if region.buffer_offset >= src.size {
            return Err(GpuError::invalid_usage(format!(
                "texture copy starts at {} past the end of a {} byte buffer",
                region.buffer_offset, src.size
            )));
        }
        if region.mip_level >= texture.mip_levels {
            return Err(GpuError::invalid_usage(format!(
                "mip {} of a texture with {} levels",
                region.mip_level, texture.mip_levels
            )));
        }
        let last_layer = region.base_array_layer.checked_add(region.layer_count);
        if region.layer_count == 0 || last_layer.map_or(true, |end| end > texture.array_layers) {
            return Err(GpuError::invalid_usage(format!(
                "layers {}+{} of a texture with {}",
                region.base_array_layer, region.layer_count, texture.array_layers
            )));
        }
        self.push(Command::CopyBufferToImage {
            buffer: src.handle,
            image: texture.image,
            layout: texture.layout(),
            region: region.to_vk(texture.aspect()),
        })
    }

    /// Record execution of an ended secondary list. The secondary is
    /// tagged with this list's fence when this list is submitted.
    /// Secondaries run outside rendering scopes.
    pub fn execute_secondary(&mut self, secondary: &CommandList) -> GpuResult<()> {
        self.require_outside_renderpass("execute_secondary")?;
        if self.level != CommandListLevel::Primary {
            return Err(GpuError::invalid_usage("secondaries can only be executed from a primary"));
        }
        if secondary.level != CommandListLevel::Secondary {
            return Err(GpuError::invalid_usage("execute_secondary given a primary list"));
        }
        if secondary.state != RecordingState::Executable {
            return Err(GpuError::invalid_usage("secondary list executed before it was ended"));
        }
        self.push(Command::ExecuteSecondary(secondary.buffer))?;
        self.secondaries.push(secondary.finished.clone());
        Ok(())
    }

    pub(crate) fn check_submittable(&self, queue: QueueKind) -> GpuResult<()> {
        if self.level != CommandListLevel::Primary {
            return Err(GpuError::invalid_usage("only primary lists can be submitted"));
        }
        if self.queue != queue {
            return Err(GpuError::invalid_usage(format!(
                "list allocated for {:?} submitted to {:?}",
                self.queue, queue
            )));
        }
        if self.state != RecordingState::Executable {
            return Err(GpuError::invalid_usage(format!(
                "list submitted while {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Tag this list and every secondary it executed with `fence`.
    pub(crate) fn mark_submitted(&mut self, ticket: &FenceTicket) {
        self.finished.set(ticket);
        for secondary in &self.secondaries {
            secondary.set(ticket);
        }
        if self.single_use {
            self.state = RecordingState::Consumed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::format::Format;
    use crate::resource::TextureDesc;

    fn recording_list() -> CommandList {
        let mut list = CommandList::new(
            Arc::new(HeadlessBackend::new()),
            vk::CommandBuffer::null(),
            vk::CommandPool::null(),
            CommandListLevel::Primary,
            QueueKind::Graphics,
            false,
            1_000_000,
        );
        list.begin().unwrap();
        list
    }

    fn host_buffer(size: u64) -> Buffer {
        Buffer {
            handle: vk::Buffer::null(),
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            host_visible: true,
        }
    }

    #[test]
    fn layout_table_matches_attachment_usage() {
        assert_eq!(access_mask_for_layout(vk::ImageLayout::UNDEFINED), vk::AccessFlags::empty());
        assert_eq!(
            access_mask_for_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL),
            vk::AccessFlags::TRANSFER_WRITE
        );
        assert_eq!(
            access_mask_for_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL),
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
    }

    #[test]
    fn access_bits_expand_to_stages() {
        assert_eq!(
            stages_for_access(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::HOST_READ),
            vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::HOST
        );
        assert_eq!(
            stages_for_access(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE),
            vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
        );
        assert!(stages_for_access(vk::AccessFlags::empty()).is_empty());
    }

    #[test]
    fn present_and_undefined_use_pipe_endpoints() {
        let (src, dst) = barrier_stages(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(src, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(dst, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);

        let (src, dst) = barrier_stages(
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );
        assert_eq!(src, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(dst, vk::PipelineStageFlags::BOTTOM_OF_PIPE);

        let (src, _) = barrier_stages(
            vk::ImageLayout::PRESENT_SRC_KHR,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );
        assert_eq!(src, vk::PipelineStageFlags::BOTTOM_OF_PIPE);
    }

    #[test]
    fn transition_reads_tracked_layout() {
        let texture = Texture::new(
            vk::Image::null(),
            vk::ImageView::null(),
            &TextureDesc::new_2d(Format::RGBA8U, 16, 16),
        );
        texture.set_tracked_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let barrier = transition_barrier(&texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barrier.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barrier.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(barrier.aspect, vk::ImageAspectFlags::COLOR);
    }

    #[test]
    fn glam_colour_converts_to_clear_value() {
        let clear: ClearValue = glam::Vec4::new(0.1, 0.2, 0.3, 1.0).into();
        assert_eq!(clear, ClearValue::colour(0.1, 0.2, 0.3, 1.0));
    }

    #[test]
    fn texture_copy_records_only_the_copy() {
        let mut list = recording_list();
        let src = host_buffer(4096);
        let texture = Texture::new(
            vk::Image::null(),
            vk::ImageView::null(),
            &TextureDesc::new_2d(Format::RGBA8U, 16, 16),
        );
        texture.set_tracked_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        let region = BufferImageCopy {
            buffer_row_length: 32,
            ..BufferImageCopy::whole(&texture).with_buffer_offset(1024)
        };
        list.copy_buffer_to_texture(&src, &texture, &region).unwrap();

        assert_eq!(list.commands().len(), 1);
        match &list.commands()[0] {
            Command::CopyBufferToImage { layout, region, .. } => {
                assert_eq!(*layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(region.buffer_offset, 1024);
                assert_eq!(region.buffer_row_length, 32);
                assert_eq!(region.image_extent.width, 16);
                assert_eq!(region.image_subresource.layer_count, 1);
            }
            other => panic!("expected a texture copy, got {other:?}"),
        }
        assert_eq!(texture.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn texture_copy_leaves_an_undefined_layout_alone() {
        let mut list = recording_list();
        let texture = Texture::new(
            vk::Image::null(),
            vk::ImageView::null(),
            &TextureDesc::new_2d(Format::RGBA8U, 4, 4),
        );
        list.copy_buffer_to_texture(&host_buffer(64), &texture, &BufferImageCopy::whole(&texture))
            .unwrap();
        assert_eq!(list.commands().len(), 1);
        assert_eq!(texture.layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn texture_copy_rejects_missing_mips_and_layers() {
        let mut list = recording_list();
        let texture = Texture::new(
            vk::Image::null(),
            vk::ImageView::null(),
            &TextureDesc::new_2d(Format::RGBA8U, 4, 4),
        );
        let src = host_buffer(64);
        let whole = BufferImageCopy::whole(&texture);

        let mip = BufferImageCopy { mip_level: 1, ..whole };
        assert!(list.copy_buffer_to_texture(&src, &texture, &mip).is_err());
        let layers = BufferImageCopy {
            base_array_layer: u32::MAX,
            ..whole
        };
        assert!(list.copy_buffer_to_texture(&src, &texture, &layers).is_err());
        let past_end = whole.with_buffer_offset(64);
        assert!(list.copy_buffer_to_texture(&src, &texture, &past_end).is_err());
        assert!(list.commands().is_empty());
    }

    #[test]
    fn buffer_copy_with_huge_size_is_rejected() {
        let mut list = recording_list();
        let src = host_buffer(64);
        let dst = host_buffer(64);
        assert!(matches!(
            list.copy_buffer(&src, 8, &dst, 0, u64::MAX),
            Err(GpuError::InvalidUsage(_))
        ));
        assert!(matches!(
            list.copy_buffer(&src, 0, &dst, u64::MAX, 1),
            Err(GpuError::InvalidUsage(_))
        ));
        list.copy_buffer(&src, 0, &dst, 32, 32).unwrap();
        assert_eq!(list.commands().len(), 1);
    }
}
