// Graphics pipelines for dynamic rendering
//
// No render pass objects: attachment formats are given through
// VkPipelineRenderingCreateInfo. Viewport and scissor are dynamic.

use ash::vk;
use std::ffi::CString;
use std::io::Cursor;

use super::VulkanBackend;
use crate::backend::RawPipeline;
use crate::error::{GpuError, GpuResult};
use crate::format::Format;
use crate::pipeline::{CullMode, GraphicsPipelineDesc, InputRate, ShaderDesc, Topology};

fn topology(topology: Topology) -> vk::PrimitiveTopology {
    match topology {
        Topology::Triangles => vk::PrimitiveTopology::TRIANGLE_LIST,
        Topology::Lines => vk::PrimitiveTopology::LINE_LIST,
    }
}

fn cull_mode(cull: CullMode) -> vk::CullModeFlags {
    match cull {
        CullMode::None => vk::CullModeFlags::NONE,
        CullMode::Front => vk::CullModeFlags::FRONT,
        CullMode::Back => vk::CullModeFlags::BACK,
    }
}

impl VulkanBackend {
    fn create_shader_module(&self, shader: &ShaderDesc) -> GpuResult<vk::ShaderModule> {
        // read_spv copies into aligned u32 words and checks the length
        let words = ash::util::read_spv(&mut Cursor::new(&shader.bytecode))
            .map_err(|err| GpuError::Loading(format!("invalid SPIR-V for {:?} shader: {}", shader.stage, err)))?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let module = unsafe { self.device.create_shader_module(&create_info, None) }?;
        Ok(module)
    }

    pub(super) fn make_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
    ) -> GpuResult<RawPipeline> {
        let mut modules = Vec::with_capacity(desc.shaders.len());
        for shader in &desc.shaders {
            match self.create_shader_module(shader) {
                Ok(module) => modules.push(module),
                Err(err) => {
                    self.destroy_modules(&modules);
                    return Err(err);
                }
            }
        }
        let result = self.build_pipeline(desc, set_layouts, &modules);
        // Modules are only needed while the pipeline is built
        self.destroy_modules(&modules);
        result
    }

    fn destroy_modules(&self, modules: &[vk::ShaderModule]) {
        for &module in modules {
            unsafe { self.device.destroy_shader_module(module, None) };
        }
    }

    fn build_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
        set_layouts: &[vk::DescriptorSetLayout],
        modules: &[vk::ShaderModule],
    ) -> GpuResult<RawPipeline> {
        let entry_points = desc
            .shaders
            .iter()
            .map(|shader| CString::new(shader.entry_point.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| GpuError::invalid_usage("shader entry point contains a NUL byte"))?;

        let stages: Vec<_> = desc
            .shaders
            .iter()
            .zip(modules)
            .zip(&entry_points)
            .map(|((shader, &module), name)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(shader.stage.to_vk())
                    .module(module)
                    .name(name)
            })
            .collect();

        let bindings: Vec<_> = desc
            .vertex_layout
            .iter()
            .map(|input| vk::VertexInputBindingDescription {
                binding: input.binding,
                stride: input.stride,
                input_rate: match input.rate {
                    InputRate::Vertex => vk::VertexInputRate::VERTEX,
                    InputRate::Instance => vk::VertexInputRate::INSTANCE,
                },
            })
            .collect();
        let attributes: Vec<_> = desc
            .vertex_layout
            .iter()
            .flat_map(|input| {
                input.attributes.iter().map(move |attr| vk::VertexInputAttributeDescription {
                    location: attr.location,
                    binding: input.binding,
                    format: attr.format.to_vk(),
                    offset: attr.offset,
                })
            })
            .collect();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::default()
            .vertex_binding_descriptions(&bindings)
            .vertex_attribute_descriptions(&attributes);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(topology(desc.topology))
            .primitive_restart_enable(false);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let rasterizer = vk::PipelineRasterizationStateCreateInfo::default()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(cull_mode(desc.cull))
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisampling = vk::PipelineMultisampleStateCreateInfo::default()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let has_depth = desc.depth_format != Format::None;
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(has_depth && desc.depth_test)
            .depth_write_enable(has_depth && desc.depth_write)
            .depth_compare_op(vk::CompareOp::LESS)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let blend_attachments: Vec<_> = desc
            .colour_formats
            .iter()
            .map(|_| {
                vk::PipelineColorBlendAttachmentState::default()
                    .color_write_mask(vk::ColorComponentFlags::RGBA)
                    .blend_enable(false)
            })
            .collect();
        let colour_blending = vk::PipelineColorBlendStateCreateInfo::default()
            .logic_op_enable(false)
            .attachments(&blend_attachments);

        let push_constant_ranges: Vec<_> = desc
            .push_constants
            .iter()
            .map(|range| vk::PushConstantRange {
                stage_flags: range.stage.to_vk(),
                offset: range.offset,
                size: range.size,
            })
            .collect();
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(set_layouts)
            .push_constant_ranges(&push_constant_ranges);
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None) }?;

        let colour_formats: Vec<_> = desc.colour_formats.iter().map(|f| f.to_vk()).collect();
        let depth_format = desc.depth_format.to_vk();
        let stencil_format = if desc.depth_format.has_stencil() {
            depth_format
        } else {
            vk::Format::UNDEFINED
        };
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
            .color_attachment_formats(&colour_formats)
            .depth_attachment_format(depth_format)
            .stencil_attachment_format(stencil_format);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterizer)
            .multisample_state(&multisampling)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&colour_blending)
            .dynamic_state(&dynamic_state)
            .layout(layout)
            .push_next(&mut rendering_info);

        let pipelines = unsafe {
            self.device
                .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        };
        match pipelines {
            Ok(pipelines) => Ok(RawPipeline {
                pipeline: pipelines[0],
                layout,
            }),
            Err((_, err)) => {
                unsafe { self.device.destroy_pipeline_layout(layout, None) };
                Err(err.into())
            }
        }
    }

    pub(super) fn release_graphics_pipeline(&self, pipeline: RawPipeline) {
        unsafe {
            self.device.destroy_pipeline(pipeline.pipeline, None);
            self.device.destroy_pipeline_layout(pipeline.layout, None);
        }
    }
}
