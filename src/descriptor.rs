// Descriptor set layouts, sets and the pool-of-pools allocator

use ash::vk;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::backend::Backend;
use crate::error::{GpuError, GpuResult};
use crate::pipeline::ShaderStage;
use crate::resource::{Buffer, Texture};
use crate::sampler::Sampler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stage: ShaderStage,
}

/// Ordered binding list. Structural equality is the layout cache key, so
/// two layouts built the same way share one driver object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayout {
    bindings: Vec<LayoutBinding>,
}

impl DescriptorSetLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn uniform_buffer(mut self, stage: ShaderStage, binding: u32, count: u32) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count,
            stage,
        });
        self
    }

    pub fn texture_sampler(mut self, stage: ShaderStage, binding: u32, count: u32) -> Self {
        self.bindings.push(LayoutBinding {
            binding,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stage,
        });
        self
    }

    pub fn bindings(&self) -> &[LayoutBinding] {
        &self.bindings
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DescriptorWrite {
    UniformBuffer {
        binding: u32,
        array_element: u32,
        buffer: vk::Buffer,
        offset: u64,
        range: u64,
    },
    CombinedImageSampler {
        binding: u32,
        array_element: u32,
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

/// Allocated set plus the writes queued for its next update.
#[derive(Debug)]
pub struct DescriptorSet {
    pub(crate) handle: vk::DescriptorSet,
    pub(crate) layout: vk::DescriptorSetLayout,
    writes: Vec<DescriptorWrite>,
}

impl DescriptorSet {
    pub(crate) fn new(handle: vk::DescriptorSet, layout: vk::DescriptorSetLayout) -> Self {
        Self {
            handle,
            layout,
            writes: Vec::new(),
        }
    }

    pub fn raw(&self) -> vk::DescriptorSet {
        self.handle
    }

    /// A `range` of `None` binds the rest of the buffer from `offset`.
    pub fn bind_uniform_buffer(
        &mut self,
        buffer: &Buffer,
        binding: u32,
        array_element: u32,
        offset: u64,
        range: Option<u64>,
    ) {
        self.writes.push(DescriptorWrite::UniformBuffer {
            binding,
            array_element,
            buffer: buffer.handle,
            offset,
            range: range.unwrap_or(vk::WHOLE_SIZE),
        });
    }

    pub fn bind_texture_sampler(
        &mut self,
        texture: &Texture,
        sampler: Sampler,
        binding: u32,
        array_element: u32,
    ) {
        self.writes.push(DescriptorWrite::CombinedImageSampler {
            binding,
            array_element,
            view: texture.view,
            sampler: sampler.0,
            layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        });
    }

    pub fn pending_writes(&self) -> &[DescriptorWrite] {
        &self.writes
    }

    pub(crate) fn take_writes(&mut self) -> Vec<DescriptorWrite> {
        std::mem::take(&mut self.writes)
    }
}

/// Per-pool descriptor counts, as multiples of the pool's set count.
#[derive(Debug, Clone)]
pub struct PoolSizes {
    pub ratios: Vec<(vk::DescriptorType, f32)>,
}

impl Default for PoolSizes {
    fn default() -> Self {
        Self {
            ratios: vec![
                (vk::DescriptorType::SAMPLER, 0.5),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 4.0),
                (vk::DescriptorType::SAMPLED_IMAGE, 4.0),
                (vk::DescriptorType::STORAGE_IMAGE, 1.0),
                (vk::DescriptorType::UNIFORM_TEXEL_BUFFER, 1.0),
                (vk::DescriptorType::STORAGE_TEXEL_BUFFER, 1.0),
                (vk::DescriptorType::UNIFORM_BUFFER, 2.0),
                (vk::DescriptorType::STORAGE_BUFFER, 2.0),
                (vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC, 1.0),
                (vk::DescriptorType::STORAGE_BUFFER_DYNAMIC, 1.0),
                (vk::DescriptorType::INPUT_ATTACHMENT, 0.5),
            ],
        }
    }
}

impl PoolSizes {
    fn for_sets(&self, sets: u32) -> Vec<vk::DescriptorPoolSize> {
        self.ratios
            .iter()
            .map(|&(ty, ratio)| vk::DescriptorPoolSize {
                ty,
                descriptor_count: ((ratio * sets as f32) as u32).max(1),
            })
            .collect()
    }
}

/// Hands out sets from a current pool, rolling over to a fresh pool when
/// the current one fills up or fragments.
pub struct DescriptorSetAllocator {
    backend: Arc<dyn Backend>,
    sizes: PoolSizes,
    sets_per_pool: u32,
    current: Option<vk::DescriptorPool>,
    used: Vec<vk::DescriptorPool>,
    free: VecDeque<vk::DescriptorPool>,
}

impl DescriptorSetAllocator {
    pub fn new(backend: Arc<dyn Backend>, sizes: PoolSizes, sets_per_pool: u32) -> Self {
        Self {
            backend,
            sizes,
            sets_per_pool: sets_per_pool.max(1),
            current: None,
            used: Vec::new(),
            free: VecDeque::new(),
        }
    }

    fn grab_pool(&mut self) -> GpuResult<vk::DescriptorPool> {
        let pool = match self.free.pop_front() {
            Some(pool) => pool,
            None => {
                let pool = self.backend.create_descriptor_pool(
                    &self.sizes.for_sets(self.sets_per_pool),
                    self.sets_per_pool,
                )?;
                log::info!("Created descriptor pool ({} sets)", self.sets_per_pool);
                pool
            }
        };
        self.used.push(pool);
        self.current = Some(pool);
        Ok(pool)
    }

    pub fn allocate(&mut self, layout: vk::DescriptorSetLayout) -> GpuResult<vk::DescriptorSet> {
        let pool = match self.current {
            Some(pool) => pool,
            None => self.grab_pool()?,
        };

        match self.backend.allocate_descriptor_set(pool, layout) {
            Ok(set) => return Ok(set),
            Err(GpuError::Vulkan(vk::Result::ERROR_FRAGMENTED_POOL))
            | Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_POOL_MEMORY)) => {}
            Err(err) => return Err(err),
        }

        // Current pool is spent: retry exactly once in a fresh one
        let pool = self.grab_pool()?;
        match self.backend.allocate_descriptor_set(pool, layout) {
            Ok(set) => Ok(set),
            Err(err) => {
                log::error!("Descriptor set allocation failed in a fresh pool: {}", err);
                Err(GpuError::PoolExhausted)
            }
        }
    }

    /// Reset every used pool and make them all available again. Sets
    /// allocated before the reset must not be used afterwards.
    pub fn reset(&mut self) -> GpuResult<()> {
        for pool in self.used.drain(..) {
            self.backend.reset_descriptor_pool(pool)?;
            self.free.push_back(pool);
        }
        self.current = None;
        Ok(())
    }

    pub fn used_pools(&self) -> usize {
        self.used.len()
    }

    pub fn free_pools(&self) -> usize {
        self.free.len()
    }

    pub fn destroy(&mut self) {
        for pool in self.used.drain(..).chain(self.free.drain(..)) {
            self.backend.destroy_descriptor_pool(pool);
        }
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    fn layout(backend: &HeadlessBackend) -> vk::DescriptorSetLayout {
        let desc = DescriptorSetLayout::new().uniform_buffer(ShaderStage::Vertex, 0, 1);
        backend.create_descriptor_set_layout(desc.bindings()).unwrap()
    }

    #[test]
    fn full_pool_rolls_over_to_a_new_one() {
        let backend = Arc::new(HeadlessBackend::new());
        let layout = layout(&backend);
        let mut allocator = DescriptorSetAllocator::new(backend.clone(), PoolSizes::default(), 2);

        for _ in 0..5 {
            allocator.allocate(layout).unwrap();
        }
        assert_eq!(allocator.used_pools(), 3);
        assert_eq!(backend.counters().descriptor_pools_created, 3);
    }

    #[test]
    fn reset_recycles_every_used_pool() {
        let backend = Arc::new(HeadlessBackend::new());
        let layout = layout(&backend);
        let mut allocator = DescriptorSetAllocator::new(backend.clone(), PoolSizes::default(), 1);

        for _ in 0..4 {
            allocator.allocate(layout).unwrap();
        }
        allocator.reset().unwrap();
        assert_eq!(allocator.used_pools(), 0);
        assert_eq!(allocator.free_pools(), 4);

        // Reused pools satisfy the next allocations without creating more
        for _ in 0..4 {
            allocator.allocate(layout).unwrap();
        }
        assert_eq!(backend.counters().descriptor_pools_created, 4);
    }

    #[test]
    fn fresh_pool_failure_is_pool_exhausted() {
        let backend = Arc::new(HeadlessBackend::new());
        let layout = layout(&backend);
        let mut allocator = DescriptorSetAllocator::new(backend.clone(), PoolSizes::default(), 4);
        backend.set_descriptor_pool_capacity(Some(0));

        assert!(matches!(allocator.allocate(layout), Err(GpuError::PoolExhausted)));
    }

    #[test]
    fn equal_layouts_compare_equal() {
        let a = DescriptorSetLayout::new()
            .uniform_buffer(ShaderStage::Vertex, 0, 1)
            .texture_sampler(ShaderStage::Fragment, 1, 1);
        let b = DescriptorSetLayout::new()
            .uniform_buffer(ShaderStage::Vertex, 0, 1)
            .texture_sampler(ShaderStage::Fragment, 1, 1);
        let c = DescriptorSetLayout::new().uniform_buffer(ShaderStage::Fragment, 0, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
