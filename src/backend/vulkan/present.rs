// Surfaces and swapchains
//
// Present runs on one of the queue families the device was created with,
// so the present-family search is limited to those.

use ash::vk;

use super::VulkanBackend;
use crate::backend::{AcquiredImage, RawSwapchain, SurfaceSupport, SwapchainCreateDesc};
use crate::error::{GpuError, GpuResult};
use crate::window::Window;

fn handle_error(err: raw_window_handle::HandleError) -> GpuError {
    GpuError::Loading(format!("window handle unavailable: {}", err))
}

impl VulkanBackend {
    pub(super) fn make_surface(&self, window: &dyn Window) -> GpuResult<vk::SurfaceKHR> {
        let display = window.display_handle().map_err(handle_error)?.as_raw();
        let handle = window.window_handle().map_err(handle_error)?.as_raw();

        let surface = unsafe { ash_window::create_surface(&self.entry, &self.instance, display, handle, None) }?;
        log::info!("Created window surface");
        Ok(surface)
    }

    pub(super) fn find_present_family(&self, surface: vk::SurfaceKHR) -> GpuResult<Option<u32>> {
        for family in &self.families {
            let supported = unsafe {
                self.surface_loader
                    .get_physical_device_surface_support(self.physical_device, *family, surface)
            }?;
            if supported {
                return Ok(Some(*family));
            }
        }
        Ok(None)
    }

    pub(super) fn query_surface_support(&self, surface: vk::SurfaceKHR) -> GpuResult<SurfaceSupport> {
        unsafe {
            Ok(SurfaceSupport {
                capabilities: self
                    .surface_loader
                    .get_physical_device_surface_capabilities(self.physical_device, surface)?,
                formats: self
                    .surface_loader
                    .get_physical_device_surface_formats(self.physical_device, surface)?,
                present_modes: self
                    .surface_loader
                    .get_physical_device_surface_present_modes(self.physical_device, surface)?,
            })
        }
    }

    pub(super) fn make_swapchain(&self, desc: &SwapchainCreateDesc) -> GpuResult<RawSwapchain> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, desc.surface)
        }?;
        let composite_alpha = [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::INHERIT,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        ]
        .into_iter()
        .find(|mode| caps.supported_composite_alpha.contains(*mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

        let families = [desc.graphics_family, desc.present_family];
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .pre_transform(desc.pre_transform)
            .composite_alpha(composite_alpha)
            .present_mode(desc.present_mode)
            .clipped(true);
        let create_info = if desc.graphics_family != desc.present_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let handle = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }?;
        let images = match unsafe { self.swapchain_loader.get_swapchain_images(handle) } {
            Ok(images) => images,
            Err(err) => {
                unsafe { self.swapchain_loader.destroy_swapchain(handle, None) };
                return Err(err.into());
            }
        };

        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(desc.format.format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });

            match unsafe { self.device.create_image_view(&view_info, None) } {
                Ok(view) => views.push(view),
                Err(err) => {
                    unsafe {
                        for view in views {
                            self.device.destroy_image_view(view, None);
                        }
                        self.swapchain_loader.destroy_swapchain(handle, None);
                    }
                    return Err(err.into());
                }
            }
        }

        Ok(RawSwapchain { handle, images, views })
    }

    pub(super) fn release_swapchain(&self, swapchain: &RawSwapchain) {
        unsafe {
            for &view in &swapchain.views {
                self.device.destroy_image_view(view, None);
            }
            self.swapchain_loader.destroy_swapchain(swapchain.handle, None);
        }
    }

    pub(super) fn acquire(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> GpuResult<AcquiredImage> {
        let (index, suboptimal) = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, signal, vk::Fence::null())
        }?;
        Ok(AcquiredImage { index, suboptimal })
    }

    pub(super) fn present(
        &self,
        present_family: u32,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> GpuResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let queue = unsafe { self.device.get_device_queue(present_family, 0) };
        let _guard = self.queue_lock.lock();
        let suboptimal = unsafe { self.swapchain_loader.queue_present(queue, &present_info) }?;
        Ok(suboptimal)
    }
}
