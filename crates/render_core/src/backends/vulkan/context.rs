//! Vulkan instance, physical device and logical device ownership
//!
//! No surface is created: the backbuffer is offscreen, so any device with a
//! queue family supporting both graphics and compute qualifies.

#[cfg(debug_assertions)]
use ash::extensions::ext::DebugUtils;
use ash::vk;
use ash::{Device, Entry, Instance};
use std::ffi::{CStr, CString};

use super::{VulkanError, VulkanResult};

/// Vulkan instance wrapper with RAII cleanup
pub struct VulkanInstance {
    /// Vulkan entry point
    pub entry: Entry,
    /// Vulkan instance handle
    pub instance: Instance,
    #[cfg(debug_assertions)]
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    /// Create an instance, with the validation layer when requested
    pub fn new(app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanError::InitializationFailed(format!("Failed to load Vulkan: {e:?}")))?;

        let app_name_cstr = CString::new(app_name)
            .map_err(|e| VulkanError::InitializationFailed(format!("Invalid application name: {e}")))?;
        let engine_name_cstr = c"render_core";
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(engine_name_cstr)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_3);

        #[allow(unused_mut)]
        let mut extensions: Vec<*const std::ffi::c_char> = Vec::new();
        #[cfg(debug_assertions)]
        if enable_validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let validation_layer = c"VK_LAYER_KHRONOS_validation";
        let layers: Vec<*const std::ffi::c_char> = if enable_validation {
            vec![validation_layer.as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);

        let instance = unsafe { entry.create_instance(&create_info, None).map_err(VulkanError::Api)? };

        #[cfg(debug_assertions)]
        let debug_utils = if enable_validation {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger = Self::setup_debug_messenger(&loader)?;
            Some((loader, messenger))
        } else {
            None
        };

        log::debug!("Created Vulkan instance for '{}' (validation: {})", app_name, enable_validation);

        Ok(Self {
            entry,
            instance,
            #[cfg(debug_assertions)]
            debug_utils,
        })
    }

    #[cfg(debug_assertions)]
    fn setup_debug_messenger(debug_utils: &DebugUtils) -> VulkanResult<vk::DebugUtilsMessengerEXT> {
        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        unsafe {
            debug_utils
                .create_debug_utils_messenger(&create_info, None)
                .map_err(VulkanError::Api)
        }
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            #[cfg(debug_assertions)]
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(debug_assertions)]
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}

/// Physical device selection and capabilities
pub struct PhysicalDeviceInfo {
    /// Vulkan physical device handle
    pub device: vk::PhysicalDevice,
    /// Device properties and limits
    pub properties: vk::PhysicalDeviceProperties,
    /// Supported core features
    pub features: vk::PhysicalDeviceFeatures,
    /// Memory heaps and types
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    /// Queue family supporting graphics and compute
    pub queue_family: u32,
}

impl PhysicalDeviceInfo {
    /// Select the first device that supports Vulkan 1.3 with dynamic rendering
    pub fn select_suitable_device(instance: &Instance) -> VulkanResult<Self> {
        let devices = unsafe { instance.enumerate_physical_devices().map_err(VulkanError::Api)? };

        for device in devices {
            match Self::evaluate_device(instance, device) {
                Ok(info) => {
                    log::info!("Selected GPU: {}", info.device_name());
                    return Ok(info);
                }
                Err(reason) => log::debug!("Skipping physical device: {}", reason),
            }
        }

        Err(VulkanError::InitializationFailed("No suitable GPU found".to_string()))
    }

    fn evaluate_device(instance: &Instance, device: vk::PhysicalDevice) -> VulkanResult<Self> {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        if properties.api_version < vk::API_VERSION_1_3 {
            return Err(VulkanError::InitializationFailed("Vulkan 1.3 not supported".to_string()));
        }

        let mut features13 = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::builder().push_next(&mut features13);
        unsafe { instance.get_physical_device_features2(device, &mut features2) };
        let features = features2.features;
        if features13.dynamic_rendering != vk::TRUE {
            return Err(VulkanError::InitializationFailed("Dynamic rendering not supported".to_string()));
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let queue_family = queue_families
            .iter()
            .position(|family| family.queue_flags.contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE))
            .ok_or_else(|| VulkanError::InitializationFailed("No graphics/compute queue family found".to_string()))?;

        let memory_properties = unsafe { instance.get_physical_device_memory_properties(device) };

        Ok(Self {
            device,
            properties,
            features,
            memory_properties,
            queue_family: queue_family as u32,
        })
    }

    /// Human-readable device name
    pub fn device_name(&self) -> String {
        unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }
}

/// Logical device wrapper with RAII cleanup
pub struct LogicalDevice {
    /// Vulkan logical device handle
    pub device: Device,
    /// Queue used for every submission
    pub queue: vk::Queue,
}

impl LogicalDevice {
    /// Create a logical device with one graphics/compute queue
    pub fn new(instance: &Instance, physical_device: &PhysicalDeviceInfo) -> VulkanResult<Self> {
        let priorities = [1.0];
        let queue_infos = [vk::DeviceQueueCreateInfo::builder()
            .queue_family_index(physical_device.queue_family)
            .queue_priorities(&priorities)
            .build()];

        let device_features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(physical_device.features.sampler_anisotropy == vk::TRUE)
            .fill_mode_non_solid(physical_device.features.fill_mode_non_solid == vk::TRUE)
            .build();
        let mut features13 = vk::PhysicalDeviceVulkan13Features::builder().dynamic_rendering(true);

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_features(&device_features)
            .push_next(&mut features13);

        let device = unsafe {
            instance
                .create_device(physical_device.device, &create_info, None)
                .map_err(VulkanError::Api)?
        };
        let queue = unsafe { device.get_device_queue(physical_device.queue_family, 0) };

        Ok(Self { device, queue })
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
        }
    }
}

/// Owns the core Vulkan objects; fields drop device first, instance last
pub struct VulkanContext {
    /// Logical device and queue
    pub device: LogicalDevice,
    /// Selected physical device
    pub physical_device: PhysicalDeviceInfo,
    /// Instance
    pub instance: VulkanInstance,
}

impl VulkanContext {
    /// Create the instance, pick a device and open it
    pub fn new(app_name: &str, enable_validation: bool) -> VulkanResult<Self> {
        log::debug!("Creating Vulkan context...");
        let instance = VulkanInstance::new(app_name, enable_validation)?;
        let physical_device = PhysicalDeviceInfo::select_suitable_device(&instance.instance)?;
        let device = LogicalDevice::new(&instance.instance, &physical_device)?;
        log::info!(
            "Vulkan context ready on {} (queue family {})",
            physical_device.device_name(),
            physical_device.queue_family
        );

        Ok(Self {
            device,
            physical_device,
            instance,
        })
    }

    /// Raw device handle
    pub fn raw(&self) -> &Device {
        &self.device.device
    }

    /// Whether `format` supports `features` with optimal tiling
    pub fn supports_format(&self, format: vk::Format, features: vk::FormatFeatureFlags) -> bool {
        let properties = unsafe {
            self.instance
                .instance
                .get_physical_device_format_properties(self.physical_device.device, format)
        };
        properties.optimal_tiling_features.contains(features)
    }

    /// Alignment for flushing and invalidating non-coherent memory
    pub fn non_coherent_atom_size(&self) -> u64 {
        self.physical_device.properties.limits.non_coherent_atom_size.max(1)
    }

    /// Push constant bytes every pipeline layout reserves
    pub fn push_constant_size(&self) -> u32 {
        self.physical_device.properties.limits.max_push_constants_size.min(256)
    }

    /// Whether wireframe rasterization can be used
    pub fn supports_wireframe(&self) -> bool {
        self.physical_device.features.fill_mode_non_solid == vk::TRUE
    }

    /// Highest anisotropy the device samples with, 1 when unsupported
    pub fn max_anisotropy(&self) -> f32 {
        if self.physical_device.features.sampler_anisotropy == vk::TRUE {
            self.physical_device.properties.limits.max_sampler_anisotropy
        } else {
            1.0
        }
    }
}
