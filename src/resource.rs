// Buffers and textures
//
// Both are plain handle bundles. Creation and destruction go through
// `Device`, which owns the backend; resources are disposed explicitly and
// never outlive the device that made them.

use ash::vk;
use std::sync::atomic::{AtomicI32, Ordering};

use crate::format::{self, Format};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferUsage {
    Vertex,
    Index,
    Uniform,
    Storage,
    Indirect,
    TransferSrc,
    TransferDst,
}

impl BufferUsage {
    pub(crate) fn flags(usages: &[BufferUsage]) -> vk::BufferUsageFlags {
        usages.iter().fold(vk::BufferUsageFlags::empty(), |acc, usage| {
            acc | match usage {
                BufferUsage::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER,
                BufferUsage::Index => vk::BufferUsageFlags::INDEX_BUFFER,
                BufferUsage::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER,
                BufferUsage::Storage => vk::BufferUsageFlags::STORAGE_BUFFER,
                BufferUsage::Indirect => vk::BufferUsageFlags::INDIRECT_BUFFER,
                BufferUsage::TransferSrc => vk::BufferUsageFlags::TRANSFER_SRC,
                BufferUsage::TransferDst => vk::BufferUsageFlags::TRANSFER_DST,
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferVisibility {
    /// Mapped and writable from the host.
    HostVisible,
    /// Device-local. Filled through the staging buffer.
    Device,
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub usage: Vec<BufferUsage>,
    pub visibility: BufferVisibility,
    pub size: u64,
}

impl BufferDesc {
    pub fn vertex(size: u64) -> Self {
        Self {
            usage: vec![BufferUsage::Vertex],
            visibility: BufferVisibility::Device,
            size,
        }
    }

    pub fn index(size: u64) -> Self {
        Self {
            usage: vec![BufferUsage::Index],
            visibility: BufferVisibility::Device,
            size,
        }
    }

    pub fn uniform(size: u64) -> Self {
        Self {
            usage: vec![BufferUsage::Uniform],
            visibility: BufferVisibility::HostVisible,
            size,
        }
    }

    pub fn staging(size: u64) -> Self {
        Self {
            usage: vec![BufferUsage::TransferSrc],
            visibility: BufferVisibility::HostVisible,
            size,
        }
    }
}

/// True when `size` bytes starting at `offset` lie inside `limit` bytes.
pub(crate) fn range_fits(offset: u64, size: u64, limit: u64) -> bool {
    offset.checked_add(size).is_some_and(|end| end <= limit)
}

#[derive(Debug, Clone)]
pub struct Buffer {
    pub(crate) handle: vk::Buffer,
    pub(crate) size: u64,
    pub(crate) usage: vk::BufferUsageFlags,
    pub(crate) host_visible: bool,
}

impl Buffer {
    pub fn raw(&self) -> vk::Buffer {
        self.handle
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }
}

/// Layouts an engine texture can be transitioned into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageLayout {
    Undefined,
    General,
    ColourAttachment,
    DepthStencilAttachment,
    ShaderReadOnly,
    TransferSrc,
    TransferDst,
    PresentSrc,
}

impl ImageLayout {
    pub fn to_vk(self) -> vk::ImageLayout {
        match self {
            ImageLayout::Undefined => vk::ImageLayout::UNDEFINED,
            ImageLayout::General => vk::ImageLayout::GENERAL,
            ImageLayout::ColourAttachment => vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            ImageLayout::DepthStencilAttachment => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ImageLayout::ShaderReadOnly => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ImageLayout::TransferSrc => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            ImageLayout::TransferDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ImageLayout::PresentSrc => vk::ImageLayout::PRESENT_SRC_KHR,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextureDesc {
    pub format: Format,
    pub width: u32,
    pub height: u32,
    pub depth: u32,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub render_target: bool,
}

impl TextureDesc {
    pub fn new_2d(format: Format, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
            depth: 1,
            mip_levels: 1,
            array_layers: 1,
            render_target: false,
        }
    }

    pub fn render_target(mut self) -> Self {
        self.render_target = true;
        self
    }

    pub(crate) fn usage_flags(&self) -> vk::ImageUsageFlags {
        let mut usage = vk::ImageUsageFlags::SAMPLED;
        if self.render_target {
            if self.format.is_depth() {
                usage |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
            } else {
                usage |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
            }
        } else {
            usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }
        usage
    }
}

/// Image plus default view, with its layout tracked on the host.
///
/// Every barrier recorded through a `CommandList` updates the tracked
/// layout, so the next transition knows its source layout.
#[derive(Debug)]
pub struct Texture {
    pub(crate) image: vk::Image,
    pub(crate) view: vk::ImageView,
    pub(crate) format: vk::Format,
    pub(crate) extent: vk::Extent3D,
    pub(crate) mip_levels: u32,
    pub(crate) array_layers: u32,
    pub(crate) swapchain_image: bool,
    layout: AtomicI32,
}

impl Texture {
    pub(crate) fn new(
        image: vk::Image,
        view: vk::ImageView,
        desc: &TextureDesc,
    ) -> Self {
        Self {
            image,
            view,
            format: desc.format.to_vk(),
            extent: vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth.max(1),
            },
            mip_levels: desc.mip_levels.max(1),
            array_layers: desc.array_layers.max(1),
            swapchain_image: false,
            layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
        }
    }

    /// Wrap an image owned by a swapchain.
    pub(crate) fn from_swapchain(
        image: vk::Image,
        view: vk::ImageView,
        format: vk::Format,
        extent: vk::Extent2D,
    ) -> Self {
        Self {
            image,
            view,
            format,
            extent: vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            swapchain_image: true,
            layout: AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()),
        }
    }

    pub fn raw_image(&self) -> vk::Image {
        self.image
    }

    pub fn raw_view(&self) -> vk::ImageView {
        self.view
    }

    pub fn format(&self) -> Format {
        Format::from_vk(self.format)
    }

    pub fn vk_format(&self) -> vk::Format {
        self.format
    }

    pub fn width(&self) -> u32 {
        self.extent.width
    }

    pub fn height(&self) -> u32 {
        self.extent.height
    }

    pub fn extent_2d(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.extent.width,
            height: self.extent.height,
        }
    }

    pub fn is_swapchain_image(&self) -> bool {
        self.swapchain_image
    }

    pub fn is_depth(&self) -> bool {
        format::is_depth_vk(self.format)
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        format::aspect_mask(self.format)
    }

    /// Layout the image is believed to be in after all recorded barriers.
    pub fn layout(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.layout.load(Ordering::Acquire))
    }

    /// Override the tracked layout after an out-of-band transition.
    pub fn set_tracked_layout(&self, layout: vk::ImageLayout) {
        self.layout.store(layout.as_raw(), Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_target_usage_depends_on_format() {
        let colour = TextureDesc::new_2d(Format::RGBA8U, 4, 4).render_target();
        assert!(colour.usage_flags().contains(vk::ImageUsageFlags::COLOR_ATTACHMENT));

        let depth = TextureDesc::new_2d(Format::D32, 4, 4).render_target();
        assert!(depth
            .usage_flags()
            .contains(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT));

        let sampled = TextureDesc::new_2d(Format::RGBA8Srgb, 4, 4);
        assert!(sampled.usage_flags().contains(vk::ImageUsageFlags::TRANSFER_DST));
    }

    #[test]
    fn new_textures_start_undefined() {
        let texture = Texture::new(
            vk::Image::null(),
            vk::ImageView::null(),
            &TextureDesc::new_2d(Format::RGBA8U, 8, 8),
        );
        assert_eq!(texture.layout(), vk::ImageLayout::UNDEFINED);
        texture.set_tracked_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(texture.layout(), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
    }

    #[test]
    fn usage_flags_combine() {
        let flags = BufferUsage::flags(&[BufferUsage::Vertex, BufferUsage::TransferDst]);
        assert_eq!(
            flags,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
    }

    #[test]
    fn range_check_survives_huge_offsets() {
        assert!(range_fits(0, 16, 16));
        assert!(range_fits(16, 0, 16));
        assert!(!range_fits(8, 9, 16));
        assert!(!range_fits(8, u64::MAX, 16));
        assert!(!range_fits(u64::MAX, 1, u64::MAX));
    }
}
