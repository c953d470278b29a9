use ash::vk;

use crate::descriptor::DescriptorSetLayout;
use crate::format::Format;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub(crate) fn to_vk(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndexType {
    Uint16,
    #[default]
    Uint32,
}

impl IndexType {
    pub(crate) fn to_vk(self) -> vk::IndexType {
        match self {
            IndexType::Uint16 => vk::IndexType::UINT16,
            IndexType::Uint32 => vk::IndexType::UINT32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Topology {
    #[default]
    Triangles,
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CullMode {
    #[default]
    None,
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputRate {
    #[default]
    Vertex,
    Instance,
}

#[derive(Debug, Clone)]
pub struct ShaderDesc {
    pub stage: ShaderStage,
    /// SPIR-V words as bytes.
    pub bytecode: Vec<u8>,
    pub entry_point: String,
}

impl ShaderDesc {
    pub fn new(stage: ShaderStage, bytecode: Vec<u8>) -> Self {
        Self {
            stage,
            bytecode,
            entry_point: "main".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: Format,
    pub offset: u32,
}

#[derive(Debug, Clone, Default)]
pub struct VertexInput {
    pub binding: u32,
    pub stride: u32,
    pub rate: InputRate,
    pub attributes: Vec<VertexAttribute>,
}

impl VertexInput {
    pub fn new(binding: u32, stride: u32) -> Self {
        Self {
            binding,
            stride,
            ..Self::default()
        }
    }

    pub fn per_instance(mut self) -> Self {
        self.rate = InputRate::Instance;
        self
    }

    pub fn attribute(mut self, location: u32, format: Format, offset: u32) -> Self {
        self.attributes.push(VertexAttribute {
            location,
            format,
            offset,
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stage: ShaderStage,
    pub offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc {
    pub shaders: Vec<ShaderDesc>,
    pub vertex_layout: Vec<VertexInput>,
    pub set_layouts: Vec<DescriptorSetLayout>,
    pub push_constants: Vec<PushConstantRange>,
    pub colour_formats: Vec<Format>,
    pub depth_format: Format,
    pub topology: Topology,
    pub cull: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
}

impl Default for GraphicsPipelineDesc {
    fn default() -> Self {
        Self {
            shaders: Vec::new(),
            vertex_layout: Vec::new(),
            set_layouts: Vec::new(),
            push_constants: Vec::new(),
            colour_formats: Vec::new(),
            depth_format: Format::None,
            topology: Topology::Triangles,
            cull: CullMode::None,
            depth_test: true,
            depth_write: true,
        }
    }
}

impl GraphicsPipelineDesc {
    pub fn shader(&self, stage: ShaderStage) -> Option<&ShaderDesc> {
        self.shaders.iter().find(|s| s.stage == stage)
    }
}

/// Compiled graphics pipeline and its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GraphicsPipeline {
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) layout: vk::PipelineLayout,
}

impl GraphicsPipeline {
    pub fn raw(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}
