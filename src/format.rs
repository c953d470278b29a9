use ash::vk;

/// Engine-side pixel and vertex attribute formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Format {
    #[default]
    None,

    R8U,
    RG8U,
    RGB8U,
    RGBA8U,

    R8S,
    RG8S,
    RGB8S,
    RGBA8S,

    R16F,
    RG16F,
    RGB16F,
    RGBA16F,

    R32F,
    RG32F,
    RGB32F,
    RGBA32F,

    D32,
    D24S8,

    R8Srgb,
    RG8Srgb,
    RGB8Srgb,
    RGBA8Srgb,

    BGRA8Srgb,
    BGRA8U,
}

impl Format {
    pub fn to_vk(self) -> vk::Format {
        match self {
            Format::None => vk::Format::UNDEFINED,
            Format::R8U => vk::Format::R8_UNORM,
            Format::RG8U => vk::Format::R8G8_UNORM,
            Format::RGB8U => vk::Format::R8G8B8_UNORM,
            Format::RGBA8U => vk::Format::R8G8B8A8_UNORM,
            Format::R8S => vk::Format::R8_SNORM,
            Format::RG8S => vk::Format::R8G8_SNORM,
            Format::RGB8S => vk::Format::R8G8B8_SNORM,
            Format::RGBA8S => vk::Format::R8G8B8A8_SNORM,
            Format::R16F => vk::Format::R16_SFLOAT,
            Format::RG16F => vk::Format::R16G16_SFLOAT,
            Format::RGB16F => vk::Format::R16G16B16_SFLOAT,
            Format::RGBA16F => vk::Format::R16G16B16A16_SFLOAT,
            Format::R32F => vk::Format::R32_SFLOAT,
            Format::RG32F => vk::Format::R32G32_SFLOAT,
            Format::RGB32F => vk::Format::R32G32B32_SFLOAT,
            Format::RGBA32F => vk::Format::R32G32B32A32_SFLOAT,
            Format::D32 => vk::Format::D32_SFLOAT,
            Format::D24S8 => vk::Format::D24_UNORM_S8_UINT,
            Format::R8Srgb => vk::Format::R8_SRGB,
            Format::RG8Srgb => vk::Format::R8G8_SRGB,
            Format::RGB8Srgb => vk::Format::R8G8B8_SRGB,
            Format::RGBA8Srgb => vk::Format::R8G8B8A8_SRGB,
            Format::BGRA8Srgb => vk::Format::B8G8R8A8_SRGB,
            Format::BGRA8U => vk::Format::B8G8R8A8_UNORM,
        }
    }

    /// Formats outside the engine table map to `None`.
    pub fn from_vk(format: vk::Format) -> Format {
        match format {
            vk::Format::R8_UNORM => Format::R8U,
            vk::Format::R8G8_UNORM => Format::RG8U,
            vk::Format::R8G8B8_UNORM => Format::RGB8U,
            vk::Format::R8G8B8A8_UNORM => Format::RGBA8U,
            vk::Format::R8_SNORM => Format::R8S,
            vk::Format::R8G8_SNORM => Format::RG8S,
            vk::Format::R8G8B8_SNORM => Format::RGB8S,
            vk::Format::R8G8B8A8_SNORM => Format::RGBA8S,
            vk::Format::R16_SFLOAT => Format::R16F,
            vk::Format::R16G16_SFLOAT => Format::RG16F,
            vk::Format::R16G16B16_SFLOAT => Format::RGB16F,
            vk::Format::R16G16B16A16_SFLOAT => Format::RGBA16F,
            vk::Format::R32_SFLOAT => Format::R32F,
            vk::Format::R32G32_SFLOAT => Format::RG32F,
            vk::Format::R32G32B32_SFLOAT => Format::RGB32F,
            vk::Format::R32G32B32A32_SFLOAT => Format::RGBA32F,
            vk::Format::D32_SFLOAT => Format::D32,
            vk::Format::D24_UNORM_S8_UINT => Format::D24S8,
            vk::Format::R8_SRGB => Format::R8Srgb,
            vk::Format::R8G8_SRGB => Format::RG8Srgb,
            vk::Format::R8G8B8_SRGB => Format::RGB8Srgb,
            vk::Format::R8G8B8A8_SRGB => Format::RGBA8Srgb,
            vk::Format::B8G8R8A8_SRGB => Format::BGRA8Srgb,
            vk::Format::B8G8R8A8_UNORM => Format::BGRA8U,
            _ => Format::None,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, Format::D32 | Format::D24S8)
    }

    pub fn has_stencil(self) -> bool {
        matches!(self, Format::D24S8)
    }

    pub fn is_colour(self) -> bool {
        self != Format::None && !self.is_depth()
    }
}

pub(crate) fn is_depth_vk(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

pub(crate) fn has_stencil_vk(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect mask for views and barriers on an image of `format`.
pub(crate) fn aspect_mask(format: vk::Format) -> vk::ImageAspectFlags {
    let mut aspect = vk::ImageAspectFlags::empty();
    if is_depth_vk(format) {
        aspect |= vk::ImageAspectFlags::DEPTH;
    }
    if has_stencil_vk(format) {
        aspect |= vk::ImageAspectFlags::STENCIL;
    }
    if aspect.is_empty() {
        aspect = vk::ImageAspectFlags::COLOR;
    }
    aspect
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_formats_survive_conversion() {
        for format in [Format::RGBA8U, Format::BGRA8Srgb, Format::D24S8, Format::RG32F] {
            assert_eq!(Format::from_vk(format.to_vk()), format);
        }
        assert_eq!(Format::from_vk(vk::Format::BC7_SRGB_BLOCK), Format::None);
    }

    #[test]
    fn aspect_mask_follows_format_class() {
        assert_eq!(aspect_mask(vk::Format::B8G8R8A8_SRGB), vk::ImageAspectFlags::COLOR);
        assert_eq!(aspect_mask(vk::Format::D32_SFLOAT), vk::ImageAspectFlags::DEPTH);
        assert_eq!(
            aspect_mask(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }
}
