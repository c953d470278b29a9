// Instance, debug messenger, physical device selection and logical device

use ash::{vk, Entry};
use raw_window_handle::RawDisplayHandle;
use std::ffi::{c_char, CStr, CString};

use crate::backend::QueueFamilies;
use crate::error::{GpuError, GpuResult};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

pub(super) type DebugMessenger = (ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT);

pub(super) fn create_instance(
    entry: &Entry,
    app_name: &str,
    enable_validation: bool,
    display: RawDisplayHandle,
) -> GpuResult<ash::Instance> {
    let app_name_cstr =
        CString::new(app_name).map_err(|_| GpuError::invalid_usage("application name contains a NUL byte"))?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name_cstr)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"hf-gpu")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    // Surface extensions for whatever platform the display lives on
    let mut extensions: Vec<*const c_char> = ash_window::enumerate_required_extensions(display)?.to_vec();
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    let layer_names = if enable_validation {
        vec![VALIDATION_LAYER.as_ptr()]
    } else {
        vec![]
    };

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names);

    let instance = unsafe { entry.create_instance(&create_info, None) }?;
    Ok(instance)
}

pub(super) fn setup_debug_messenger(entry: &Entry, instance: &ash::Instance) -> GpuResult<DebugMessenger> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;
    Ok((debug_utils, messenger))
}

pub(super) struct PhysicalDeviceChoice {
    pub physical_device: vk::PhysicalDevice,
    pub properties: vk::PhysicalDeviceProperties,
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: QueueFamilies,
}

/// Graphics is the first family with graphics support. Compute and
/// transfer prefer dedicated families and otherwise alias graphics.
pub(super) fn find_queue_families(families: &[vk::QueueFamilyProperties]) -> Option<QueueFamilies> {
    let find = |wanted: vk::QueueFlags, excluded: vk::QueueFlags| {
        families
            .iter()
            .position(|f| f.queue_count > 0 && f.queue_flags.contains(wanted) && !f.queue_flags.intersects(excluded))
            .map(|i| i as u32)
    };

    let graphics = find(vk::QueueFlags::GRAPHICS, vk::QueueFlags::empty())?;
    let compute = find(vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS).unwrap_or(graphics);
    let transfer = find(
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .unwrap_or(graphics);

    Some(QueueFamilies {
        graphics,
        compute,
        transfer,
    })
}

fn supports_swapchain(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let extensions = match unsafe { instance.enumerate_device_extension_properties(device) } {
        Ok(extensions) => extensions,
        Err(_) => return false,
    };
    extensions
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(ash::khr::swapchain::NAME))
}

pub(super) fn pick_physical_device(instance: &ash::Instance) -> GpuResult<PhysicalDeviceChoice> {
    let devices = unsafe { instance.enumerate_physical_devices() }?;
    if devices.is_empty() {
        return Err(GpuError::NoSuitableGpu);
    }

    let mut best: Option<(u32, PhysicalDeviceChoice)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_3 || !supports_swapchain(instance, device) {
            continue;
        }

        let families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let Some(queue_families) = find_queue_families(&families) else {
            continue;
        };

        // Prefer discrete GPU
        let score = match properties.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
            _ => 1,
        };

        if best.as_ref().map_or(true, |(best_score, _)| score > *best_score) {
            let features = unsafe { instance.get_physical_device_features(device) };
            best = Some((
                score,
                PhysicalDeviceChoice {
                    physical_device: device,
                    properties,
                    features,
                    queue_families,
                },
            ));
        }
    }

    best.map(|(_, choice)| choice).ok_or(GpuError::NoSuitableGpu)
}

/// Distinct families, graphics first. One queue is created per family.
pub(super) fn unique_families(families: &QueueFamilies) -> Vec<u32> {
    let mut unique = vec![families.graphics];
    for family in [families.compute, families.transfer] {
        if !unique.contains(&family) {
            unique.push(family);
        }
    }
    unique
}

pub(super) fn create_logical_device(instance: &ash::Instance, choice: &PhysicalDeviceChoice) -> GpuResult<ash::Device> {
    let priorities = [1.0];
    let queue_infos: Vec<_> = unique_families(&choice.queue_families)
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&priorities)
        })
        .collect();

    let extensions = [ash::khr::swapchain::NAME.as_ptr()];
    let features = vk::PhysicalDeviceFeatures::default()
        .sampler_anisotropy(choice.features.sampler_anisotropy == vk::TRUE);
    // Vulkan 1.3 dynamic rendering
    let mut features13 = vk::PhysicalDeviceVulkan13Features::default().dynamic_rendering(true);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_infos)
        .enabled_extension_names(&extensions)
        .enabled_features(&features)
        .push_next(&mut features13);

    let device = unsafe { instance.create_device(choice.physical_device, &create_info, None) }?;
    Ok(device)
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message).to_string_lossy();

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => log::error!("[Vulkan] {}", message),
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => log::warn!("[Vulkan] {}", message),
        _ => log::debug!("[Vulkan] {}", message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn dedicated_families_are_preferred() {
        let families = [
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::TRANSFER),
        ];
        let found = find_queue_families(&families).unwrap();
        assert_eq!((found.graphics, found.compute, found.transfer), (0, 1, 2));
        assert_eq!(unique_families(&found), vec![0, 1, 2]);
    }

    #[test]
    fn single_family_aliases_everything() {
        let families = [family(
            vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER,
        )];
        let found = find_queue_families(&families).unwrap();
        assert_eq!((found.graphics, found.compute, found.transfer), (0, 0, 0));
        assert_eq!(unique_families(&found), vec![0]);
    }

    #[test]
    fn no_graphics_family_is_rejected() {
        assert!(find_queue_families(&[family(vk::QueueFlags::TRANSFER)]).is_none());
    }
}
