// Vulkan Device - Core GPU interface
//
// Responsibilities:
// - Instance creation (validation layers only when asked for and present)
// - Surface creation from the window's raw handles
// - Physical device selection (discrete GPU first, then anything) with one
//   queue family doing both graphics and present
// - Logical device + queue creation
// - Memory allocator setup
//
// Bootstrap walks the stages in `lifecycle::BootStage`; `destroy` walks them
// back down and refuses (debug) while a swapchain or frame synchronizer is
// still registered.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};

use super::enumerate;
use super::lifecycle::{BootStage, Lifecycle};
use super::memory::MemoryAllocator;
use crate::error::{GpuError, GpuResult, VkResultExt};

const VALIDATION_LAYER_NAME: &CStr = c"VK_LAYER_KHRONOS_validation";

/// What to present to, if anything.
#[derive(Debug, Clone, Copy)]
pub enum SurfaceTarget {
    Window {
        display: RawDisplayHandle,
        window: RawWindowHandle,
    },
    /// No presentation. Uploads, compute and tests only.
    Headless,
}

impl SurfaceTarget {
    pub fn from_window(window: &(impl HasDisplayHandle + HasWindowHandle)) -> GpuResult<Self> {
        Ok(SurfaceTarget::Window {
            display: window.display_handle()?.as_raw(),
            window: window.window_handle()?.as_raw(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DeviceDesc {
    pub app_name: String,
    pub enable_validation: bool,
}

impl Default for DeviceDesc {
    fn default() -> Self {
        Self {
            app_name: "etna".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// Per-family capability record used by device selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueFamilySupport {
    pub graphics: bool,
    pub present: bool,
}

/// Read-only capability record for one physical device.
#[derive(Debug, Clone)]
pub struct DeviceCandidate {
    pub handle: vk::PhysicalDevice,
    pub device_type: vk::PhysicalDeviceType,
    pub queue_families: Vec<QueueFamilySupport>,
    /// Has every device extension the target needs (swapchain when presenting).
    pub has_required_extensions: bool,
}

impl DeviceCandidate {
    /// First queue family that can do both graphics and present.
    pub fn graphics_present_family(&self) -> Option<u32> {
        if !self.has_required_extensions {
            return None;
        }
        self.queue_families
            .iter()
            .position(|family| family.graphics && family.present)
            .map(|index| index as u32)
    }
}

/// Pick a device and its graphics+present queue family.
///
/// Discrete GPUs are scanned first; if none qualifies every device type is
/// scanned with the same requirement.
pub fn select_physical_device(candidates: &[DeviceCandidate]) -> Option<(vk::PhysicalDevice, u32)> {
    let usable = |c: &DeviceCandidate| c.graphics_present_family().map(|family| (c.handle, family));

    candidates
        .iter()
        .filter(|c| c.device_type == vk::PhysicalDeviceType::DISCRETE_GPU)
        .find_map(usable)
        .or_else(|| candidates.iter().find_map(usable))
}

/// Surface loader plus the surface it created.
#[derive(Clone)]
pub struct PresentSurface {
    pub loader: ash::khr::surface::Instance,
    pub handle: vk::SurfaceKHR,
}

#[derive(Clone)]
struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Destroys instance-level objects if bootstrap bails out part way.
struct InstanceGuard {
    instance: ash::Instance,
    debug_utils: Option<DebugMessenger>,
    surface: Option<PresentSurface>,
    armed: bool,
}

impl InstanceGuard {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::warn!("Bootstrap failed, destroying partially created instance");
        unsafe {
            if let Some(surface) = &self.surface {
                surface.loader.destroy_surface(surface.handle, None);
            }
            if let Some(debug) = &self.debug_utils {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// Vulkan device wrapper. Owns every object below the swapchain.
pub struct VulkanDevice {
    // Vulkan handles
    pub allocator: MemoryAllocator,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub instance: ash::Instance,
    _entry: ash::Entry,

    // Queue handle
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,

    surface: Option<PresentSurface>,
    debug_utils: Option<DebugMessenger>,

    // Device properties (cached)
    pub properties: vk::PhysicalDeviceProperties,

    lifecycle: Lifecycle,
}

impl std::fmt::Debug for VulkanDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanDevice")
            .field("device", &self.device.handle())
            .field("stage", &self.lifecycle.stage())
            .finish_non_exhaustive()
    }
}

impl VulkanDevice {
    /// Bootstrap the device, presenting to `target` when it is a window.
    pub fn new(desc: &DeviceDesc, target: SurfaceTarget) -> GpuResult<Self> {
        log::info!("Creating Vulkan device: {}", desc.app_name);
        let mut lifecycle = Lifecycle::new();

        // Step 1: Load Vulkan library
        let entry = unsafe { ash::Entry::load() }?;
        lifecycle.advance(BootStage::LoaderReady);

        // Step 2: What does this loader offer?
        let available_extensions = enumerate::instance_extensions(&entry)?;
        lifecycle.advance(BootStage::ExtensionsEnumerated);

        let available_layers = enumerate::instance_layers(&entry).unwrap_or_else(|e| {
            log::warn!("Could not enumerate instance layers: {}", e);
            Vec::new()
        });
        lifecycle.advance(BootStage::LayersEnumerated);

        // Step 3: Create instance (+ debug messenger when possible)
        let validation = desc.enable_validation
            && enumerate::has_layer(&available_layers, VALIDATION_LAYER_NAME)
            && enumerate::has_extension(&available_extensions, ash::ext::debug_utils::NAME);
        if desc.enable_validation && !validation {
            log::warn!("Validation requested but not available, continuing without it");
        }

        let instance =
            Self::create_instance(&entry, desc, target, &available_extensions, validation)?;
        lifecycle.advance(BootStage::InstanceCreated);

        let mut guard = InstanceGuard {
            instance: instance.clone(),
            debug_utils: None,
            surface: None,
            armed: true,
        };
        if validation {
            guard.debug_utils = Self::setup_debug_messenger(&entry, &instance);
        }

        // Step 4: Surface
        if let SurfaceTarget::Window { display, window } = target {
            let handle = unsafe { ash_window::create_surface(&entry, &instance, display, window, None) }
                .check("vkCreateSurfaceKHR")?;
            guard.surface = Some(PresentSurface {
                loader: ash::khr::surface::Instance::new(&entry, &instance),
                handle,
            });
        } else {
            log::info!("Headless bootstrap, no presentation surface");
        }
        lifecycle.advance(BootStage::SurfaceCreated);

        // Step 5: Pick physical device (GPU)
        let candidates = enumerate::physical_devices(&instance)?
            .into_iter()
            .map(|pd| Self::describe_candidate(&instance, pd, guard.surface.as_ref()))
            .collect::<GpuResult<Vec<_>>>()?;
        let (physical_device, graphics_queue_family) =
            select_physical_device(&candidates).ok_or(GpuError::NoSuitableDevice)?;
        lifecycle.advance(BootStage::PhysicalDeviceChosen);

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        log::info!(
            "Selected GPU: {} ({:?}), queue family {}",
            properties
                .device_name_as_c_str()
                .map(CStr::to_string_lossy)
                .unwrap_or_default(),
            properties.device_type,
            graphics_queue_family
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        // Step 6: Create logical device
        let device = Self::create_logical_device(
            &instance,
            physical_device,
            graphics_queue_family,
            guard.surface.is_some(),
        )?;
        lifecycle.advance(BootStage::LogicalDeviceCreated);

        let graphics_queue = unsafe { device.get_device_queue(graphics_queue_family, 0) };
        lifecycle.advance(BootStage::QueueReady);

        // Step 7: Memory allocator
        let allocator = MemoryAllocator::new(memory_properties);
        lifecycle.advance(BootStage::Ready);

        let surface = guard.surface.clone();
        let debug_utils = guard.debug_utils.clone();
        guard.disarm();

        Ok(Self {
            allocator,
            device,
            physical_device,
            instance,
            _entry: entry,
            graphics_queue,
            graphics_queue_family,
            surface,
            debug_utils,
            properties,
            lifecycle,
        })
    }

    fn create_instance(
        entry: &ash::Entry,
        desc: &DeviceDesc,
        target: SurfaceTarget,
        available: &[vk::ExtensionProperties],
        validation: bool,
    ) -> GpuResult<ash::Instance> {
        let app_name = CString::new(desc.app_name.replace('\0', "")).unwrap_or_default();

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"etna")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_3);

        // Required extensions: whatever the window system needs
        let mut extensions: Vec<*const c_char> = match target {
            SurfaceTarget::Window { display, .. } => {
                ash_window::enumerate_required_extensions(display)
                    .check("vkEnumerateRequiredExtensions")?
                    .to_vec()
            }
            SurfaceTarget::Headless => Vec::new(),
        };
        for &name in &extensions {
            let name = unsafe { CStr::from_ptr(name) };
            if !enumerate::has_extension(available, name) {
                return Err(GpuError::MissingExtension(name.to_string_lossy().into_owned()));
            }
        }

        if validation {
            extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        }

        let mut flags = vk::InstanceCreateFlags::empty();
        if enumerate::has_extension(available, ash::khr::portability_enumeration::NAME) {
            extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
            flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
        }

        let layer_names = if validation {
            vec![VALIDATION_LAYER_NAME.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .flags(flags)
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.check("vkCreateInstance")
    }

    /// Never fails bootstrap: a missing messenger only costs diagnostics.
    fn setup_debug_messenger(
        entry: &ash::Entry,
        instance: &ash::Instance,
    ) -> Option<DebugMessenger> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
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

        match unsafe { loader.create_debug_utils_messenger(&create_info, None) } {
            Ok(messenger) => Some(DebugMessenger { loader, messenger }),
            Err(e) => {
                log::warn!("Debug messenger unavailable: {:?}", e);
                None
            }
        }
    }

    fn describe_candidate(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        surface: Option<&PresentSurface>,
    ) -> GpuResult<DeviceCandidate> {
        let props = unsafe { instance.get_physical_device_properties(physical_device) };
        let families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let mut queue_families = Vec::with_capacity(families.len());
        for (index, family) in families.iter().enumerate() {
            let present = match surface {
                Some(surface) => unsafe {
                    surface
                        .loader
                        .get_physical_device_surface_support(
                            physical_device,
                            index as u32,
                            surface.handle,
                        )
                        .check("vkGetPhysicalDeviceSurfaceSupportKHR")?
                },
                None => true,
            };
            queue_families.push(QueueFamilySupport {
                graphics: family.queue_flags.contains(vk::QueueFlags::GRAPHICS),
                present,
            });
        }

        let has_required_extensions = match surface {
            Some(_) => enumerate::has_extension(
                &enumerate::device_extensions(instance, physical_device)?,
                ash::khr::swapchain::NAME,
            ),
            None => true,
        };

        log::debug!(
            "Found GPU: {:?} (type: {:?})",
            props.device_name_as_c_str().unwrap_or_default(),
            props.device_type
        );

        Ok(DeviceCandidate {
            handle: physical_device,
            device_type: props.device_type,
            queue_families,
            has_required_extensions,
        })
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        graphics_queue_family: u32,
        presenting: bool,
    ) -> GpuResult<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(graphics_queue_family)
            .queue_priorities(&queue_priorities);

        let available = enumerate::device_extensions(instance, physical_device)?;
        let mut extensions = Vec::new();
        if presenting {
            extensions.push(ash::khr::swapchain::NAME.as_ptr());
        }
        if enumerate::has_extension(&available, ash::khr::portability_subset::NAME) {
            extensions.push(ash::khr::portability_subset::NAME.as_ptr());
        }

        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info))
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        unsafe { instance.create_device(physical_device, &create_info, None) }
            .check("vkCreateDevice")
    }

    pub fn stage(&self) -> BootStage {
        self.lifecycle.stage()
    }

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn surface(&self) -> GpuResult<&PresentSurface> {
        self.surface.as_ref().ok_or(GpuError::SurfaceUnavailable)
    }

    pub fn is_headless(&self) -> bool {
        self.surface.is_none()
    }

    pub fn surface_capabilities(&self) -> GpuResult<vk::SurfaceCapabilitiesKHR> {
        let surface = self.surface()?;
        unsafe {
            surface
                .loader
                .get_physical_device_surface_capabilities(self.physical_device, surface.handle)
        }
        .check("vkGetPhysicalDeviceSurfaceCapabilitiesKHR")
    }

    pub fn surface_formats(&self) -> GpuResult<Vec<vk::SurfaceFormatKHR>> {
        let surface = self.surface()?;
        unsafe {
            surface
                .loader
                .get_physical_device_surface_formats(self.physical_device, surface.handle)
        }
        .check("vkGetPhysicalDeviceSurfaceFormatsKHR")
    }

    pub fn surface_present_modes(&self) -> GpuResult<Vec<vk::PresentModeKHR>> {
        let surface = self.surface()?;
        unsafe {
            surface
                .loader
                .get_physical_device_surface_present_modes(self.physical_device, surface.handle)
        }
        .check("vkGetPhysicalDeviceSurfacePresentModesKHR")
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> GpuResult<()> {
        unsafe { self.device.device_wait_idle() }.check("vkDeviceWaitIdle")
    }

    /// Tear down in exact reverse of bootstrap. Safe to call twice.
    pub fn destroy(&mut self) {
        if self.lifecycle.stage() == BootStage::Uninitialized {
            return;
        }
        log::info!("Destroying Vulkan device...");

        if let Err(e) = self.wait_idle() {
            log::error!("Device not idle at teardown: {}", e);
        }

        self.lifecycle.retreat(BootStage::Ready);
        let leaked = self.allocator.live_blocks();
        if leaked > 0 {
            log::warn!("{} memory block(s) still allocated at device teardown", leaked);
        }
        self.lifecycle.retreat(BootStage::QueueReady);

        unsafe {
            self.device.destroy_device(None);
            self.lifecycle.retreat(BootStage::LogicalDeviceCreated);
            self.lifecycle.retreat(BootStage::PhysicalDeviceChosen);

            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.handle, None);
            }
            self.lifecycle.retreat(BootStage::SurfaceCreated);

            if let Some(debug) = self.debug_utils.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }
            self.instance.destroy_instance(None);
            self.lifecycle.retreat(BootStage::InstanceCreated);
        }

        self.lifecycle.retreat(BootStage::LayersEnumerated);
        self.lifecycle.retreat(BootStage::ExtensionsEnumerated);
        self.lifecycle.retreat(BootStage::LoaderReady);
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        if std::thread::panicking() {
            log::error!("Panicking with a live device, skipping teardown");
            return;
        }
        self.destroy();
    }
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
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    const BOTH: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: true,
    };
    const GRAPHICS_ONLY: QueueFamilySupport = QueueFamilySupport {
        graphics: true,
        present: false,
    };
    const PRESENT_ONLY: QueueFamilySupport = QueueFamilySupport {
        graphics: false,
        present: true,
    };

    fn candidate(
        raw: u64,
        device_type: vk::PhysicalDeviceType,
        queue_families: Vec<QueueFamilySupport>,
    ) -> DeviceCandidate {
        DeviceCandidate {
            handle: vk::PhysicalDevice::from_raw(raw),
            device_type,
            queue_families,
            has_required_extensions: true,
        }
    }

    #[test]
    fn discrete_gpu_wins_over_earlier_integrated() {
        let candidates = [
            candidate(1, vk::PhysicalDeviceType::INTEGRATED_GPU, vec![BOTH]),
            candidate(2, vk::PhysicalDeviceType::DISCRETE_GPU, vec![GRAPHICS_ONLY, BOTH]),
        ];
        let (device, family) = select_physical_device(&candidates).unwrap();
        assert_eq!(device.as_raw(), 2);
        assert_eq!(family, 1);
    }

    #[test]
    fn falls_back_to_any_device_type() {
        let candidates = [
            candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, vec![GRAPHICS_ONLY, PRESENT_ONLY]),
            candidate(2, vk::PhysicalDeviceType::CPU, vec![BOTH]),
        ];
        let (device, family) = select_physical_device(&candidates).unwrap();
        assert_eq!(device.as_raw(), 2);
        assert_eq!(family, 0);
    }

    #[test]
    fn split_graphics_and_present_families_do_not_qualify() {
        let candidates = [candidate(
            1,
            vk::PhysicalDeviceType::INTEGRATED_GPU,
            vec![GRAPHICS_ONLY, PRESENT_ONLY],
        )];
        assert_eq!(select_physical_device(&candidates), None);
        assert_eq!(select_physical_device(&[]), None);
    }

    #[test]
    fn devices_missing_the_swapchain_extension_are_skipped() {
        let mut discrete = candidate(1, vk::PhysicalDeviceType::DISCRETE_GPU, vec![BOTH]);
        discrete.has_required_extensions = false;
        let integrated = candidate(2, vk::PhysicalDeviceType::INTEGRATED_GPU, vec![BOTH]);

        let (device, _) = select_physical_device(&[discrete, integrated]).unwrap();
        assert_eq!(device.as_raw(), 2);
    }

    #[test]
    fn default_desc_follows_build_profile() {
        let desc = DeviceDesc::default();
        assert_eq!(desc.enable_validation, cfg!(debug_assertions));
    }
}
