// Instance and device enumeration
//
// Vulkan list queries return VK_INCOMPLETE when the list grew between the
// count query and the fill query. ash's enumerate wrappers re-run the
// two-call sequence until the list is complete, so VK_INCOMPLETE never
// surfaces here as an error.

use ash::vk;
use std::ffi::CStr;

use crate::error::{GpuResult, VkResultExt};

pub fn instance_extensions(entry: &ash::Entry) -> GpuResult<Vec<vk::ExtensionProperties>> {
    unsafe { entry.enumerate_instance_extension_properties(None) }
        .check("vkEnumerateInstanceExtensionProperties")
}

pub fn instance_layers(entry: &ash::Entry) -> GpuResult<Vec<vk::LayerProperties>> {
    unsafe { entry.enumerate_instance_layer_properties() }
        .check("vkEnumerateInstanceLayerProperties")
}

pub fn physical_devices(instance: &ash::Instance) -> GpuResult<Vec<vk::PhysicalDevice>> {
    unsafe { instance.enumerate_physical_devices() }.check("vkEnumeratePhysicalDevices")
}

pub fn device_extensions(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> GpuResult<Vec<vk::ExtensionProperties>> {
    unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .check("vkEnumerateDeviceExtensionProperties")
}

pub fn has_extension(available: &[vk::ExtensionProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|ext| ext.extension_name_as_c_str() == Ok(name))
}

pub fn has_layer(available: &[vk::LayerProperties], name: &CStr) -> bool {
    available
        .iter()
        .any(|layer| layer.layer_name_as_c_str() == Ok(name))
}
