use std::ffi::{c_char, CStr, CString};

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr::Surface;
use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};

use super::{VulkanDevice, ENGINE_NAME, VALIDATION_LAYER};
use crate::backend::{GpuInstance, SurfaceSupport};
use crate::config::RendererConfig;
use crate::device::{AdapterInfo, DeviceRequirements, QueueFamilyCaps, QueueFamilyIndices};
use crate::error::{creation, RenderError, RenderResult};
use crate::window::VulkanSurfaceSource;

/// Vulkan instance, debug messenger and window surface
pub struct VulkanInstance {
    entry: Entry,
    instance: Instance,
    debug: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    surface_loader: Surface,
    surface: vk::SurfaceKHR,
}

impl VulkanInstance {
    /// Create an instance able to present to `window`
    pub fn new(config: &RendererConfig, window: &mut dyn VulkanSurfaceSource) -> RenderResult<Self> {
        let entry = unsafe { Entry::load() }.map_err(|e| RenderError::DeviceSelection {
            reason: format!("failed to load Vulkan: {e}"),
        })?;

        let app_name = c_string(&config.application_name)?;
        let engine_name = c_string(ENGINE_NAME)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_0);

        let validation = config.validation_enabled();
        let extension_names = window
            .required_instance_extensions()?
            .iter()
            .map(|name| c_string(name))
            .collect::<RenderResult<Vec<_>>>()?;
        let mut extensions: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }

        let layer_names = if validation {
            vec![c_string(VALIDATION_LAYER)?]
        } else {
            Vec::new()
        };
        let layers: Vec<*const c_char> = layer_names.iter().map(|name| name.as_ptr()).collect();

        let enabled_features = [
            vk::ValidationFeatureEnableEXT::SYNCHRONIZATION_VALIDATION,
            vk::ValidationFeatureEnableEXT::BEST_PRACTICES,
        ];
        let mut validation_features =
            vk::ValidationFeaturesEXT::builder().enabled_validation_features(&enabled_features);
        let mut create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        if validation {
            create_info = create_info.push_next(&mut validation_features);
        }

        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(creation("Vulkan instance"))?;

        let debug = if validation {
            let debug_utils = DebugUtils::new(&entry, &instance);
            match setup_debug_messenger(&debug_utils) {
                Ok(messenger) => Some((debug_utils, messenger)),
                Err(result) => {
                    log::warn!("Debug messenger unavailable: {:?}", result);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        let mut this = Self {
            entry,
            instance,
            debug,
            surface_loader,
            surface: vk::SurfaceKHR::null(),
        };
        // on error `this` drops and tears down the instance
        this.surface = window.create_surface(this.instance.handle())?;
        log::info!(
            "Created Vulkan instance for {:?} (validation {})",
            config.application_name,
            if validation { "on" } else { "off" }
        );
        Ok(this)
    }

    /// Loader entry points
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Raw instance
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// Window surface rendered to
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    fn describe(&self, physical_device: vk::PhysicalDevice) -> VkResult<AdapterInfo> {
        let properties = unsafe { self.instance.get_physical_device_properties(physical_device) };
        let features = unsafe { self.instance.get_physical_device_features(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let extensions = unsafe {
            self.instance
                .enumerate_device_extension_properties(physical_device)?
        }
        .iter()
        .map(|ext| {
            unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                .to_string_lossy()
                .into_owned()
        })
        .collect();

        let family_properties = unsafe {
            self.instance
                .get_physical_device_queue_family_properties(physical_device)
        };
        let mut queue_families = Vec::with_capacity(family_properties.len());
        for (index, family) in family_properties.iter().enumerate() {
            let supports_present = unsafe {
                self.surface_loader.get_physical_device_surface_support(
                    physical_device,
                    index as u32,
                    self.surface,
                )?
            };
            queue_families.push(QueueFamilyCaps {
                flags: family.queue_flags,
                queue_count: family.queue_count,
                supports_present,
            });
        }

        let surface = query_surface_support(&self.surface_loader, physical_device, self.surface)?;

        Ok(AdapterInfo {
            name,
            handle: physical_device,
            device_type: properties.device_type,
            extensions,
            sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
            max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
            max_image_dimension_2d: properties.limits.max_image_dimension2_d,
            queue_families,
            surface,
        })
    }
}

impl GpuInstance for VulkanInstance {
    type Device = VulkanDevice;

    fn enumerate_adapters(&self) -> VkResult<Vec<AdapterInfo>> {
        let physical_devices = unsafe { self.instance.enumerate_physical_devices()? };
        physical_devices
            .into_iter()
            .map(|physical_device| self.describe(physical_device))
            .collect()
    }

    fn create_device(
        &self,
        adapter: &AdapterInfo,
        families: &QueueFamilyIndices,
        requirements: &DeviceRequirements,
    ) -> VkResult<VulkanDevice> {
        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extension_names = requirements
            .extensions
            .iter()
            .map(|name| CString::new(name.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| vk::Result::ERROR_EXTENSION_NOT_PRESENT)?;
        let extensions: Vec<*const c_char> =
            extension_names.iter().map(|name| name.as_ptr()).collect();

        let features = vk::PhysicalDeviceFeatures::builder()
            .sampler_anisotropy(requirements.sampler_anisotropy && adapter.sampler_anisotropy)
            .build();

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe {
            self.instance
                .create_device(adapter.handle, &create_info, None)?
        };
        VulkanDevice::new(
            &self.instance,
            device,
            self.surface_loader.clone(),
            self.surface,
            adapter.handle,
        )
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if self.surface != vk::SurfaceKHR::null() {
                self.surface_loader.destroy_surface(self.surface, None);
            }
            if let Some((debug_utils, messenger)) = self.debug.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Capabilities, formats and present modes of `surface` on `physical_device`
pub(super) fn query_surface_support(
    loader: &Surface,
    physical_device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> VkResult<SurfaceSupport> {
    unsafe {
        Ok(SurfaceSupport {
            capabilities: loader
                .get_physical_device_surface_capabilities(physical_device, surface)?,
            formats: loader.get_physical_device_surface_formats(physical_device, surface)?,
            present_modes: loader
                .get_physical_device_surface_present_modes(physical_device, surface)?,
        })
    }
}

fn c_string(value: &str) -> RenderResult<CString> {
    CString::new(value).map_err(|_| RenderError::Window(format!("name {value:?} contains a NUL byte")))
}

fn setup_debug_messenger(debug_utils: &DebugUtils) -> VkResult<vk::DebugUtilsMessengerEXT> {
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));

    unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
}

/// Forward validation messages to `log`
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if callback_data.is_null() || (*callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*callback_data).p_message).to_string_lossy();

    if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::ERROR {
        log::error!("[Vulkan] {:?} - {}", message_type, message);
    } else if message_severity >= vk::DebugUtilsMessageSeverityFlagsEXT::WARNING {
        log::warn!("[Vulkan] {:?} - {}", message_type, message);
    } else {
        log::debug!("[Vulkan] {:?} - {}", message_type, message);
    }

    vk::FALSE
}
