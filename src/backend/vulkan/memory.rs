// Buffers, textures and samplers backed by gpu-allocator

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::collections::HashMap;

use super::VulkanBackend;
use crate::error::{GpuError, GpuResult};
use crate::format;
use crate::resource::TextureDesc;
use crate::sampler::SamplerState;

#[derive(Default)]
pub(super) struct Allocations {
    pub buffers: HashMap<vk::Buffer, Allocation>,
    pub images: HashMap<vk::Image, Allocation>,
}

fn allocation_error(err: gpu_allocator::AllocationError) -> GpuError {
    log::error!("GPU memory allocation failed: {}", err);
    GpuError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
}

impl VulkanBackend {
    fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
    ) -> GpuResult<Allocation> {
        self.allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location,
                linear,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .map_err(allocation_error)
    }

    fn free(&self, allocation: Allocation) {
        if let Err(err) = self.allocator.lock().free(allocation) {
            log::error!("Failed to free GPU allocation: {}", err);
        }
    }

    pub(super) fn make_buffer(
        &self,
        size: u64,
        usage: vk::BufferUsageFlags,
        host_visible: bool,
    ) -> GpuResult<vk::Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None) }?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };

        let location = if host_visible {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation = match self.allocate("buffer", requirements, location, true) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(err.into());
        }

        self.allocations.lock().buffers.insert(buffer, allocation);
        Ok(buffer)
    }

    pub(super) fn release_buffer(&self, buffer: vk::Buffer) {
        let allocation = self.allocations.lock().buffers.remove(&buffer);
        unsafe { self.device.destroy_buffer(buffer, None) };
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
    }

    pub(super) fn write_mapped(&self, buffer: vk::Buffer, offset: u64, data: &[u8]) -> GpuResult<()> {
        let mut allocations = self.allocations.lock();
        let allocation = allocations
            .buffers
            .get_mut(&buffer)
            .ok_or_else(|| GpuError::invalid_usage("write to unknown buffer"))?;
        let mapped = allocation
            .mapped_slice_mut()
            .ok_or_else(|| GpuError::invalid_usage("write to a buffer that isn't host visible"))?;

        let start = offset as usize;
        let end = start + data.len();
        if end > mapped.len() {
            return Err(GpuError::invalid_usage("mapped write out of bounds"));
        }
        mapped[start..end].copy_from_slice(data);
        Ok(())
    }

    pub(super) fn make_texture(&self, desc: &TextureDesc) -> GpuResult<(vk::Image, vk::ImageView)> {
        let format = desc.format.to_vk();
        let (image_type, view_type) = if desc.depth > 1 {
            (vk::ImageType::TYPE_3D, vk::ImageViewType::TYPE_3D)
        } else if desc.array_layers > 1 {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D_ARRAY)
        } else {
            (vk::ImageType::TYPE_2D, vk::ImageViewType::TYPE_2D)
        };

        let image_info = vk::ImageCreateInfo::default()
            .image_type(image_type)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: desc.depth.max(1),
            })
            .mip_levels(desc.mip_levels.max(1))
            .array_layers(desc.array_layers.max(1))
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage_flags())
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { self.device.create_image(&image_info, None) }?;
        let requirements = unsafe { self.device.get_image_memory_requirements(image) };
        let allocation = match self.allocate("texture", requirements, MemoryLocation::GpuOnly, false) {
            Ok(allocation) => allocation,
            Err(err) => {
                unsafe { self.device.destroy_image(image, None) };
                return Err(err);
            }
        };

        if let Err(err) = unsafe {
            self.device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        } {
            self.free(allocation);
            unsafe { self.device.destroy_image(image, None) };
            return Err(err.into());
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(view_type)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: format::aspect_mask(format),
                base_mip_level: 0,
                level_count: desc.mip_levels.max(1),
                base_array_layer: 0,
                layer_count: desc.array_layers.max(1),
            });

        let view = match unsafe { self.device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(err) => {
                self.free(allocation);
                unsafe { self.device.destroy_image(image, None) };
                return Err(err.into());
            }
        };

        self.allocations.lock().images.insert(image, allocation);
        Ok((image, view))
    }

    pub(super) fn release_texture(&self, image: vk::Image, view: vk::ImageView) {
        let allocation = self.allocations.lock().images.remove(&image);
        unsafe {
            self.device.destroy_image_view(view, None);
            self.device.destroy_image(image, None);
        }
        if let Some(allocation) = allocation {
            self.free(allocation);
        }
    }

    pub(super) fn make_sampler(&self, state: &SamplerState, anisotropy: Option<f32>) -> GpuResult<vk::Sampler> {
        let info = vk::SamplerCreateInfo::default()
            .mag_filter(state.mag_filter.to_vk())
            .min_filter(state.min_filter.to_vk())
            .mipmap_mode(state.min_filter.mipmap_mode())
            .address_mode_u(state.wrap_u.to_vk())
            .address_mode_v(state.wrap_v.to_vk())
            .address_mode_w(state.wrap_w.to_vk())
            .anisotropy_enable(anisotropy.is_some())
            .max_anisotropy(anisotropy.unwrap_or(1.0))
            .min_lod(0.0)
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe { self.device.create_sampler(&info, None) }?;
        Ok(sampler)
    }
}
