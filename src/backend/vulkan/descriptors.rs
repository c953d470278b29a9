use ash::vk;

use super::VulkanBackend;
use crate::descriptor::{DescriptorWrite, LayoutBinding};
use crate::error::GpuResult;

impl VulkanBackend {
    pub(super) fn make_set_layout(&self, bindings: &[LayoutBinding]) -> GpuResult<vk::DescriptorSetLayout> {
        let bindings: Vec<_> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stage.to_vk())
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let layout = unsafe { self.device.create_descriptor_set_layout(&create_info, None) }?;
        Ok(layout)
    }

    pub(super) fn make_descriptor_pool(
        &self,
        sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> GpuResult<vk::DescriptorPool> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&create_info, None) }?;
        Ok(pool)
    }

    pub(super) fn allocate_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> GpuResult<vk::DescriptorSet> {
        let layouts = [layout];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&allocate_info) }?;
        sets.into_iter()
            .next()
            .ok_or(crate::error::GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY))
    }

    pub(super) fn write_set(&self, set: vk::DescriptorSet, writes: &[DescriptorWrite]) {
        let mut buffer_infos = Vec::new();
        let mut image_infos = Vec::new();
        for write in writes {
            match *write {
                DescriptorWrite::UniformBuffer {
                    buffer, offset, range, ..
                } => buffer_infos.push(vk::DescriptorBufferInfo { buffer, offset, range }),
                DescriptorWrite::CombinedImageSampler {
                    view, sampler, layout, ..
                } => image_infos.push(vk::DescriptorImageInfo {
                    sampler,
                    image_view: view,
                    image_layout: layout,
                }),
            }
        }

        let (mut next_buffer, mut next_image) = (0, 0);
        let vk_writes: Vec<_> = writes
            .iter()
            .map(|write| match *write {
                DescriptorWrite::UniformBuffer {
                    binding,
                    array_element,
                    ..
                } => {
                    let info = std::slice::from_ref(&buffer_infos[next_buffer]);
                    next_buffer += 1;
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .dst_array_element(array_element)
                        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                        .buffer_info(info)
                }
                DescriptorWrite::CombinedImageSampler {
                    binding,
                    array_element,
                    ..
                } => {
                    let info = std::slice::from_ref(&image_infos[next_image]);
                    next_image += 1;
                    vk::WriteDescriptorSet::default()
                        .dst_set(set)
                        .dst_binding(binding)
                        .dst_array_element(array_element)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(info)
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }
}
