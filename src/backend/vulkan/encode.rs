// Command stream -> vkCmd* encoding

use ash::vk;

use super::VulkanBackend;
use crate::command::{Command, ImageBarrier, RenderingAttachment, RenderingInfo};
use crate::error::GpuResult;

fn attachment_info(attachment: &RenderingAttachment) -> vk::RenderingAttachmentInfo<'static> {
    vk::RenderingAttachmentInfo::default()
        .image_view(attachment.view)
        .image_layout(attachment.layout)
        .load_op(attachment.load_op)
        .store_op(attachment.store_op)
        .clear_value(attachment.clear.to_vk())
}

impl VulkanBackend {
    pub(super) fn encode(
        &self,
        buffer: vk::CommandBuffer,
        level: vk::CommandBufferLevel,
        usage: vk::CommandBufferUsageFlags,
        commands: &[Command],
    ) -> GpuResult<()> {
        // Pools are shared between threads; Vulkan wants them externally synchronised
        let _guard = self.pool_lock.lock();

        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info = vk::CommandBufferBeginInfo::default().flags(usage);
        if level == vk::CommandBufferLevel::SECONDARY {
            begin_info = begin_info.inheritance_info(&inheritance);
        }

        unsafe {
            self.device
                .reset_command_buffer(buffer, vk::CommandBufferResetFlags::empty())?;
            self.device.begin_command_buffer(buffer, &begin_info)?;
            for command in commands {
                self.encode_one(buffer, command);
            }
            self.device.end_command_buffer(buffer)?;
        }
        Ok(())
    }

    unsafe fn encode_one(&self, cb: vk::CommandBuffer, command: &Command) {
        let device = &self.device;
        match command {
            Command::ImageBarrier(barrier) => self.encode_barrier(cb, barrier),
            Command::BeginRendering(info) => self.encode_begin_rendering(cb, info),
            Command::EndRendering => device.cmd_end_rendering(cb),
            Command::SetViewport(viewport) => device.cmd_set_viewport(cb, 0, std::slice::from_ref(viewport)),
            Command::SetScissor(scissor) => device.cmd_set_scissor(cb, 0, std::slice::from_ref(scissor)),
            Command::BindPipeline(pipeline) => {
                device.cmd_bind_pipeline(cb, vk::PipelineBindPoint::GRAPHICS, *pipeline)
            }
            Command::BindVertexBuffer {
                binding,
                buffer,
                offset,
            } => device.cmd_bind_vertex_buffers(cb, *binding, &[*buffer], &[*offset]),
            Command::BindIndexBuffer {
                buffer,
                offset,
                index_type,
            } => device.cmd_bind_index_buffer(cb, *buffer, *offset, *index_type),
            Command::BindDescriptorSets {
                layout,
                first_set,
                sets,
            } => device.cmd_bind_descriptor_sets(
                cb,
                vk::PipelineBindPoint::GRAPHICS,
                *layout,
                *first_set,
                sets,
                &[],
            ),
            Command::Draw {
                vertex_count,
                first_vertex,
            } => device.cmd_draw(cb, *vertex_count, 1, *first_vertex, 0),
            Command::DrawIndexed {
                index_count,
                first_index,
                vertex_offset,
            } => device.cmd_draw_indexed(cb, *index_count, 1, *first_index, *vertex_offset, 0),
            Command::CopyBuffer { src, dst, region } => {
                device.cmd_copy_buffer(cb, *src, *dst, std::slice::from_ref(region))
            }
            Command::CopyBufferToImage {
                buffer,
                image,
                layout,
                region,
            } => device.cmd_copy_buffer_to_image(cb, *buffer, *image, *layout, std::slice::from_ref(region)),
            Command::ExecuteSecondary(secondary) => device.cmd_execute_commands(cb, &[*secondary]),
        }
    }

    unsafe fn encode_barrier(&self, cb: vk::CommandBuffer, barrier: &ImageBarrier) {
        let image_barrier = vk::ImageMemoryBarrier::default()
            .old_layout(barrier.old_layout)
            .new_layout(barrier.new_layout)
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(barrier.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: barrier.aspect,
                base_mip_level: 0,
                level_count: barrier.mip_levels,
                base_array_layer: 0,
                layer_count: barrier.array_layers,
            });

        self.device.cmd_pipeline_barrier(
            cb,
            barrier.src_stage,
            barrier.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[image_barrier],
        );
    }

    unsafe fn encode_begin_rendering(&self, cb: vk::CommandBuffer, info: &RenderingInfo) {
        let colour: Vec<_> = info.colour.iter().map(attachment_info).collect();
        let depth = info.depth.as_ref().map(attachment_info);

        let mut rendering = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: info.area,
            })
            .layer_count(1)
            .color_attachments(&colour);
        if let Some(depth) = depth.as_ref() {
            rendering = rendering.depth_attachment(depth);
        }

        self.device.cmd_begin_rendering(cb, &rendering);
    }
}
