//! Vulkan context: instance, physical device, logical device, and queue.
//!
//! The context may be headless (no display handle) or presentable. In both
//! cases the device is created with the acceleration structure and ray tracing
//! pipeline extensions when the selected GPU supports them.

use ash::{vk, Entry, Instance, Device};
use ash::khr::{acceleration_structure, ray_tracing_pipeline, deferred_host_operations, swapchain};
use std::ffi::{CStr, CString};
use std::os::raw::c_char;

use super::error::{RtError, RtResult};
use super::raytracing::DeviceRayTracingCapabilities;
use super::{APP_NAME, ENGINE_NAME, ENGINE_VERSION, REQUIRED_VK_VERSION};

/// Queue family indices.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
}

impl QueueFamilyIndices {
    pub fn is_complete(&self) -> bool {
        self.graphics.is_some()
    }
}

/// Main Vulkan context holding all core Vulkan objects.
pub struct VulkanContext {
    pub entry: Entry,
    pub instance: Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: Device,
    pub queue_families: QueueFamilyIndices,
    pub graphics_queue: vk::Queue,

    /// Whether the device was created with the ray tracing extensions enabled.
    pub ray_tracing_enabled: bool,
    pub rt_capabilities: DeviceRayTracingCapabilities,

    #[cfg(debug_assertions)]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    #[cfg(debug_assertions)]
    debug_utils_loader: Option<ash::ext::debug_utils::Instance>,
}

impl VulkanContext {
    /// Create a new Vulkan context.
    ///
    /// # Arguments
    /// * `display_handle` - Display to enable surface extensions for, or `None` for headless
    /// * `enable_validation` - Whether to enable validation layers
    pub unsafe fn new(
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        enable_validation: bool,
    ) -> RtResult<Self> {
        let entry = Entry::linked();

        let api_version = match entry.try_enumerate_instance_version()
            .map_err(RtError::vk("vkEnumerateInstanceVersion"))?
        {
            Some(version) => version,
            None => vk::API_VERSION_1_0,
        };

        if api_version < REQUIRED_VK_VERSION {
            return Err(RtError::CapabilityMissing(format!(
                "Vulkan 1.2 required, but only {}.{}.{} available",
                vk::api_version_major(api_version),
                vk::api_version_minor(api_version),
                vk::api_version_patch(api_version)
            )));
        }

        let instance = Self::create_instance(&entry, display_handle, enable_validation)?;

        #[cfg(debug_assertions)]
        let (debug_utils_loader, debug_messenger) = if enable_validation {
            Self::setup_debug_messenger(&entry, &instance)?
        } else {
            (None, None)
        };

        let (physical_device, queue_families, rt_caps) = Self::pick_physical_device(&instance)?;

        let ray_tracing_enabled = rt_caps.is_supported();
        let (device, graphics_queue) = Self::create_logical_device(
            &instance,
            physical_device,
            &queue_families,
            ray_tracing_enabled,
            display_handle.is_some(),
        )?;

        Ok(Self {
            entry,
            instance,
            physical_device,
            device,
            queue_families,
            graphics_queue,
            ray_tracing_enabled,
            rt_capabilities: rt_caps,
            #[cfg(debug_assertions)]
            debug_messenger,
            #[cfg(debug_assertions)]
            debug_utils_loader,
        })
    }

    /// Create Vulkan instance with required extensions.
    unsafe fn create_instance(
        entry: &Entry,
        display_handle: Option<raw_window_handle::RawDisplayHandle>,
        enable_validation: bool,
    ) -> RtResult<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(APP_NAME)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(ENGINE_NAME)
            .engine_version(ENGINE_VERSION)
            .api_version(REQUIRED_VK_VERSION);

        let mut extensions = match display_handle {
            Some(handle) => ash_window::enumerate_required_extensions(handle)
                .map_err(RtError::vk("vkEnumerateInstanceExtensionProperties"))?
                .to_vec(),
            None => Vec::new(),
        };

        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let layer_names: Vec<CString> = if enable_validation {
            vec![CString::from(c"VK_LAYER_KHRONOS_validation")]
        } else {
            vec![]
        };
        let layer_name_ptrs: Vec<*const c_char> = layer_names.iter()
            .map(|n| n.as_ptr())
            .collect();

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_name_ptrs);

        entry.create_instance(&create_info, None)
            .map_err(RtError::vk("vkCreateInstance"))
    }

    /// Setup debug messenger for validation layers.
    #[cfg(debug_assertions)]
    unsafe fn setup_debug_messenger(
        entry: &Entry,
        instance: &Instance,
    ) -> RtResult<(Option<ash::ext::debug_utils::Instance>, Option<vk::DebugUtilsMessengerEXT>)> {
        let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR |
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL |
                vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION |
                vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = debug_utils
            .create_debug_utils_messenger(&create_info, None)
            .map_err(RtError::vk("vkCreateDebugUtilsMessengerEXT"))?;

        Ok((Some(debug_utils), Some(messenger)))
    }

    /// Select the best physical device.
    unsafe fn pick_physical_device(
        instance: &Instance,
    ) -> RtResult<(vk::PhysicalDevice, QueueFamilyIndices, DeviceRayTracingCapabilities)> {
        let devices = instance.enumerate_physical_devices()
            .map_err(RtError::vk("vkEnumeratePhysicalDevices"))?;

        if devices.is_empty() {
            return Err(RtError::CapabilityMissing("No Vulkan-capable GPU found".to_string()));
        }

        let mut scored_devices: Vec<_> = devices.iter()
            .filter_map(|&device| {
                let score = Self::rate_device(instance, device);
                if score > 0 {
                    Some((device, score))
                } else {
                    None
                }
            })
            .collect();

        scored_devices.sort_by(|a, b| b.1.cmp(&a.1));

        let physical_device = scored_devices.first()
            .map(|&(device, _)| device)
            .ok_or_else(|| RtError::CapabilityMissing("No suitable GPU found".to_string()))?;
        let queue_families = Self::find_queue_families(instance, physical_device);
        let rt_caps = DeviceRayTracingCapabilities::query(instance, physical_device);

        let props = instance.get_physical_device_properties(physical_device);
        let name = CStr::from_ptr(props.device_name.as_ptr()).to_string_lossy();
        log::info!("Selected GPU: {} (RT: {})", name, if rt_caps.is_supported() { "yes" } else { "no" });

        Ok((physical_device, queue_families, rt_caps))
    }

    /// Rate a physical device (higher is better).
    unsafe fn rate_device(instance: &Instance, device: vk::PhysicalDevice) -> u32 {
        let props = instance.get_physical_device_properties(device);

        if props.api_version < REQUIRED_VK_VERSION {
            return 0;
        }

        let queue_families = Self::find_queue_families(instance, device);
        if !queue_families.is_complete() {
            return 0;
        }

        let mut score = 1u32;

        if props.device_type == vk::PhysicalDeviceType::DISCRETE_GPU {
            score += 10000;
        } else if props.device_type == vk::PhysicalDeviceType::INTEGRATED_GPU {
            score += 1000;
        }

        // Ray tracing is the point of this context; weight it above device type.
        if DeviceRayTracingCapabilities::query(instance, device).is_supported() {
            score += 20000;
        }

        let memory_props = instance.get_physical_device_memory_properties(device);
        for i in 0..memory_props.memory_heap_count as usize {
            let heap = memory_props.memory_heaps[i];
            if heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL) {
                score += (heap.size / (1024 * 1024)) as u32; // MB of VRAM
            }
        }

        score
    }

    /// Find queue family indices for a physical device.
    unsafe fn find_queue_families(instance: &Instance, device: vk::PhysicalDevice) -> QueueFamilyIndices {
        let queue_families = instance.get_physical_device_queue_family_properties(device);

        let mut indices = QueueFamilyIndices::default();

        for (i, family) in queue_families.iter().enumerate() {
            let i = i as u32;

            if family.queue_flags.contains(vk::QueueFlags::GRAPHICS) && indices.graphics.is_none() {
                indices.graphics = Some(i);
            }
        }

        indices
    }

    /// Create logical device with required features and extensions.
    unsafe fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
        queue_families: &QueueFamilyIndices,
        enable_rt: bool,
        presentable: bool,
    ) -> RtResult<(Device, vk::Queue)> {
        let graphics_family = queue_families.graphics
            .ok_or_else(|| RtError::CapabilityMissing("No graphics queue family".to_string()))?;

        let queue_priorities = [1.0f32];
        let queue_create_infos = [
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(graphics_family)
                .queue_priorities(&queue_priorities),
        ];

        let mut extensions: Vec<*const c_char> = Vec::new();
        if presentable {
            extensions.push(swapchain::NAME.as_ptr());
        }
        if enable_rt {
            extensions.push(acceleration_structure::NAME.as_ptr());
            extensions.push(ray_tracing_pipeline::NAME.as_ptr());
            extensions.push(deferred_host_operations::NAME.as_ptr());
        }

        let mut vulkan_12_features = vk::PhysicalDeviceVulkan12Features::default()
            .buffer_device_address(enable_rt);

        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default()
            .acceleration_structure(enable_rt);

        let mut rt_features = vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default()
            .ray_tracing_pipeline(enable_rt);

        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vulkan_12_features);

        if enable_rt {
            features2 = features2
                .push_next(&mut accel_features)
                .push_next(&mut rt_features);
        }

        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features2);

        let device = instance.create_device(physical_device, &create_info, None)
            .map_err(RtError::vk("vkCreateDevice"))?;

        let graphics_queue = device.get_device_queue(graphics_family, 0);

        Ok((device, graphics_queue))
    }

    /// Wait for all device operations to complete.
    pub fn wait_idle(&self) {
        unsafe {
            let _ = self.device.device_wait_idle();
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.wait_idle();

            #[cfg(debug_assertions)]
            if let (Some(loader), Some(messenger)) = (&self.debug_utils_loader, self.debug_messenger) {
                loader.destroy_debug_utils_messenger(messenger, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Debug callback for validation layers.
#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("[VK] {}", message);
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("[VK] {}", message);
    }

    vk::FALSE
}
