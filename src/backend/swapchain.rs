// Swapchain - Window presentation
//
// Owns the chain of presentable images plus everything sized to them: one
// view, framebuffer and render-finished semaphore per image, the depth target
// and the render pass. Resizing is destroy-then-recreate; nothing here is
// resized in place.

use ash::vk;

use super::buffer::DepthTarget;
use super::lifecycle::Dependent;
use super::pipeline;
use super::VulkanDevice;
use crate::error::{GpuError, GpuResult, VkResultExt};

/// Present modes in order of preference. FIFO is always supported.
pub const PRESENT_MODE_PREFERENCE: [vk::PresentModeKHR; 3] = [
    vk::PresentModeKHR::MAILBOX,
    vk::PresentModeKHR::FIFO_RELAXED,
    vk::PresentModeKHR::FIFO,
];

/// Surface extent for a requested size, always inside the surface limits.
///
/// A defined `current_extent` wins over the request (the window system has
/// already decided); either way the result is clamped.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    let target = if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        desired
    };
    vk::Extent2D {
        width: target
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: target
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let max = if caps.max_image_count > 0 {
        caps.max_image_count
    } else {
        u32::MAX
    };
    (caps.min_image_count + 1).min(max)
}

pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: Option<vk::PresentModeKHR>,
) -> vk::PresentModeKHR {
    preferred
        .into_iter()
        .chain(PRESENT_MODE_PREFERENCE)
        .find(|mode| available.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Prefer SRGB BGRA8, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Result of asking the swapchain for the next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquiredImage {
    Ready { index: u32, suboptimal: bool },
    /// The surface changed under us; rebuild before rendering again.
    OutOfDate,
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::khr::swapchain::Device,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    /// Signaled by the frame's submit, waited on by present. Indexed by image.
    render_finished: Vec<vk::Semaphore>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    depth: Option<DepthTarget>,
    preferred_present_mode: Option<vk::PresentModeKHR>,
}

impl Swapchain {
    pub fn new(
        device: &VulkanDevice,
        desired_extent: vk::Extent2D,
        preferred_present_mode: Option<vk::PresentModeKHR>,
    ) -> GpuResult<Self> {
        let surface = device.surface()?.handle;

        // Query surface capabilities
        let caps = device.surface_capabilities()?;
        let formats = device.surface_formats()?;
        let present_modes = device.surface_present_modes()?;

        let surface_format = choose_surface_format(&formats).ok_or(GpuError::Vulkan {
            call: "vkGetPhysicalDeviceSurfaceFormatsKHR",
            result: vk::Result::ERROR_FORMAT_NOT_SUPPORTED,
        })?;
        let present_mode = choose_present_mode(&present_modes, preferred_present_mode);
        if let Some(preferred) = preferred_present_mode {
            if preferred != present_mode {
                log::warn!("Present mode {:?} unavailable, using {:?}", preferred, present_mode);
            }
        }
        let extent = choose_extent(&caps, desired_extent);
        let image_count = choose_image_count(&caps);

        log::info!(
            "Creating swapchain: {}x{} (requested {}x{}), {:?}",
            extent.width,
            extent.height,
            desired_extent.width,
            desired_extent.height,
            present_mode
        );

        let swapchain_loader = ash::khr::swapchain::Device::new(&device.instance, &device.device);

        let create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(surface)
            .min_image_count(image_count)
            .image_format(surface_format.format)
            .image_color_space(surface_format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true);

        let swapchain = unsafe { swapchain_loader.create_swapchain(&create_info, None) }
            .check("vkCreateSwapchainKHR")?;
        device.lifecycle().attach(Dependent::Swapchain);

        // From here on `destroy` can unwind whatever got built.
        let mut this = Self {
            swapchain,
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            render_finished: Vec::new(),
            format: surface_format.format,
            extent,
            present_mode,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            depth: None,
            preferred_present_mode,
        };

        if let Err(e) = this.build_attachments(device) {
            this.destroy(device);
            return Err(e);
        }

        log::info!("Created swapchain with {} images", this.images.len());
        Ok(this)
    }

    fn build_attachments(&mut self, device: &VulkanDevice) -> GpuResult<()> {
        self.images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }
            .check("vkGetSwapchainImagesKHR")?;

        for &image in &self.images {
            let view =
                device.create_image_view(image, self.format, vk::ImageAspectFlags::COLOR)?;
            self.image_views.push(view);
        }

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        for _ in &self.images {
            let semaphore = unsafe { device.device.create_semaphore(&semaphore_info, None) }
                .check("vkCreateSemaphore")?;
            self.render_finished.push(semaphore);
        }

        let depth = self.depth.insert(DepthTarget::new(device, self.extent)?);
        let depth_view = depth.view;

        self.render_pass = pipeline::create_render_pass(device, self.format)?;
        self.framebuffers = pipeline::create_framebuffers(
            device,
            &self.image_views,
            depth_view,
            self.render_pass,
            self.extent,
        )?;
        Ok(())
    }

    pub fn is_destroyed(&self) -> bool {
        self.swapchain == vk::SwapchainKHR::null()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    /// Semaphore the submit rendering into `image_index` signals for present.
    pub fn render_finished(&self, image_index: u32) -> vk::Semaphore {
        self.render_finished[image_index as usize]
    }

    /// Framebuffers, render pass, depth target, semaphores, image views, swapchain.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if self.is_destroyed() {
            return;
        }
        unsafe {
            pipeline::destroy_framebuffers(device, &mut self.framebuffers);
            if self.render_pass != vk::RenderPass::null() {
                device.device.destroy_render_pass(self.render_pass, None);
                self.render_pass = vk::RenderPass::null();
            }
            if let Some(depth) = self.depth.take() {
                depth.destroy(device);
            }
            for semaphore in self.render_finished.drain(..) {
                device.device.destroy_semaphore(semaphore, None);
            }
            for view in self.image_views.drain(..) {
                device.destroy_image_view(view);
            }
            self.images.clear();
            self.swapchain_loader.destroy_swapchain(self.swapchain, None);
        }
        self.swapchain = vk::SwapchainKHR::null();
        device.lifecycle().detach(Dependent::Swapchain);
    }

    /// Full teardown and rebuild at the new size.
    ///
    /// On error the old swapchain is already destroyed.
    pub fn recreate(&mut self, device: &VulkanDevice, desired_extent: vk::Extent2D) -> GpuResult<()> {
        let idle = device.wait_idle();
        self.destroy(device);
        idle?;
        *self = Self::new(device, desired_extent, self.preferred_present_mode)?;
        Ok(())
    }

    /// Acquire next image for rendering
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> GpuResult<AcquiredImage> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(AcquiredImage::Ready { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquiredImage::OutOfDate),
            Err(e) => Err(e).check("vkAcquireNextImageKHR"),
        }
    }

    /// Present rendered image to screen. Returns true when a rebuild is due.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> GpuResult<bool> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.swapchain_loader.queue_present(queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(e).check("vkQueuePresentKHR"),
        }
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        if !self.is_destroyed() && !std::thread::panicking() {
            log::error!("Swapchain dropped without destroy(), leaking it");
            debug_assert!(false, "Swapchain dropped without destroy()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn caps(min: (u32, u32), max: (u32, u32), current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            min_image_extent: vk::Extent2D {
                width: min.0,
                height: min.1,
            },
            max_image_extent: vk::Extent2D {
                width: max.0,
                height: max.1,
            },
            ..Default::default()
        }
    }

    const UNDEFINED: (u32, u32) = (u32::MAX, u32::MAX);

    #[rstest]
    #[case((800, 600), (800, 600))]
    #[case((10, 10), (64, 64))]
    #[case((5000, 100), (4096, 100))]
    #[case((0, 0), (64, 64))]
    #[case((u32::MAX, 300), (4096, 300))]
    fn extent_is_clamped_into_surface_limits(
        #[case] requested: (u32, u32),
        #[case] expected: (u32, u32),
    ) {
        let caps = caps((64, 64), (4096, 4096), UNDEFINED);
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: requested.0,
                height: requested.1,
            },
        );
        assert_eq!((extent.width, extent.height), expected);
        assert!(extent.width >= caps.min_image_extent.width);
        assert!(extent.width <= caps.max_image_extent.width);
        assert!(extent.height >= caps.min_image_extent.height);
        assert!(extent.height <= caps.max_image_extent.height);
    }

    #[test]
    fn defined_current_extent_wins() {
        let caps = caps((1, 1), (4096, 4096), (1024, 768));
        let extent = choose_extent(
            &caps,
            vk::Extent2D {
                width: 800,
                height: 600,
            },
        );
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[rstest]
    #[case(2, 0, 3)]
    #[case(2, 8, 3)]
    #[case(3, 3, 3)]
    #[case(1, 2, 2)]
    fn image_count_is_min_plus_one_capped(#[case] min: u32, #[case] max: u32, #[case] expected: u32) {
        let caps = vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        };
        assert_eq!(choose_image_count(&caps), expected);
    }

    #[rstest]
    #[case(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX], vk::PresentModeKHR::MAILBOX)]
    #[case(&[vk::PresentModeKHR::FIFO, vk::PresentModeKHR::FIFO_RELAXED], vk::PresentModeKHR::FIFO_RELAXED)]
    #[case(&[vk::PresentModeKHR::IMMEDIATE, vk::PresentModeKHR::FIFO], vk::PresentModeKHR::FIFO)]
    #[case(&[], vk::PresentModeKHR::FIFO)]
    fn present_mode_follows_preference_order(
        #[case] available: &[vk::PresentModeKHR],
        #[case] expected: vk::PresentModeKHR,
    ) {
        assert_eq!(choose_present_mode(available, None), expected);
    }

    #[test]
    fn configured_present_mode_goes_first_when_available() {
        let available = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO,
        ];
        assert_eq!(
            choose_present_mode(&available, Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&available[1..], Some(vk::PresentModeKHR::IMMEDIATE)),
            vk::PresentModeKHR::MAILBOX
        );
    }

    #[test]
    fn surface_format_prefers_srgb() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let srgb = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        let pick = |formats: &[vk::SurfaceFormatKHR]| choose_surface_format(formats).map(|f| f.format);
        assert_eq!(pick(&[unorm, srgb]), Some(vk::Format::B8G8R8A8_SRGB));
        assert_eq!(pick(&[unorm]), Some(vk::Format::B8G8R8A8_UNORM));
        assert_eq!(pick(&[]), None);
    }
}
