// GPU context - the handle every caller passes around
//
// Construction order: device, swapchain, frame synchronizer.
// `shutdown` releases them in reverse. There is no global instance.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

use crate::backend::{
    pipeline, shader, staging, AcquiredImage, AllocatedBuffer, Buffer, DeviceDesc, FenceWait,
    FrameSynchronizer, Image, MemoryBlock, MemoryUsage, SurfaceTarget, Swapchain, VulkanDevice,
    DEFAULT_FRAMES_IN_FLIGHT,
};
use crate::config::Config;
use crate::error::{GpuError, GpuResult};

#[derive(Debug, Clone)]
pub struct ContextDesc {
    pub app_name: String,
    pub enable_validation: bool,
    pub frames_in_flight: usize,
    pub present_mode: Option<vk::PresentModeKHR>,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            app_name: "etna".to_string(),
            enable_validation: cfg!(debug_assertions),
            frames_in_flight: DEFAULT_FRAMES_IN_FLIGHT,
            present_mode: None,
        }
    }
}

impl From<&Config> for ContextDesc {
    fn from(config: &Config) -> Self {
        Self {
            app_name: config.window.title.clone(),
            enable_validation: config.debug.validation_layers,
            frames_in_flight: config.frames_in_flight(),
            present_mode: config.present_mode(),
        }
    }
}

/// What the draw callback gets to know about the frame it records.
#[derive(Debug, Clone, Copy)]
pub struct FrameInfo {
    pub image_index: u32,
    /// Frame slot the commands are recorded into.
    pub frame_slot: usize,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub framebuffer: vk::Framebuffer,
}

pub struct GpuContext {
    frames: FrameSynchronizer,
    swapchain: Option<Swapchain>,
    device: VulkanDevice,
    present_mode: Option<vk::PresentModeKHR>,
    drawable_extent: vk::Extent2D,
    needs_rebuild: bool,
    shut_down: bool,
}

impl GpuContext {
    /// Bring up device, swapchain and frame slots for a window.
    ///
    /// A zero `drawable_extent` (minimized) defers the swapchain to the
    /// next non-zero [`GpuContext::resize`].
    pub fn startup(
        desc: &ContextDesc,
        window: &(impl HasDisplayHandle + HasWindowHandle),
        drawable_extent: vk::Extent2D,
    ) -> GpuResult<Self> {
        Self::build(desc, SurfaceTarget::from_window(window)?, drawable_extent)
    }

    /// Device and frame slots only. Uploads and readback work, drawing does not.
    pub fn startup_headless(desc: &ContextDesc) -> GpuResult<Self> {
        Self::build(desc, SurfaceTarget::Headless, vk::Extent2D::default())
    }

    fn build(
        desc: &ContextDesc,
        target: SurfaceTarget,
        drawable_extent: vk::Extent2D,
    ) -> GpuResult<Self> {
        let device = VulkanDevice::new(
            &DeviceDesc {
                app_name: desc.app_name.clone(),
                enable_validation: desc.enable_validation,
            },
            target,
        )?;

        let mut swapchain = None;
        if !device.is_headless() && !is_zero(drawable_extent) {
            swapchain = Some(Swapchain::new(&device, drawable_extent, desc.present_mode)?);
        }

        let frames = match FrameSynchronizer::new(&device, desc.frames_in_flight) {
            Ok(frames) => frames,
            Err(e) => {
                if let Some(mut swapchain) = swapchain {
                    swapchain.destroy(&device);
                }
                return Err(e);
            }
        };

        log::info!(
            "GPU context ready ({} frames in flight)",
            frames.frames_in_flight()
        );
        Ok(Self {
            frames,
            swapchain,
            device,
            present_mode: desc.present_mode,
            drawable_extent,
            needs_rebuild: false,
            shut_down: false,
        })
    }

    /// Wait for the GPU, then release frame slots, swapchain and device.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        log::info!("Shutting down GPU context...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Device not idle at shutdown: {}", e);
        }

        self.frames.destroy(&self.device);
        if let Some(mut swapchain) = self.swapchain.take() {
            swapchain.destroy(&self.device);
        }
        self.device.destroy();
        self.shut_down = true;
        log::info!("Cleanup complete");
    }

    pub fn device(&self) -> &VulkanDevice {
        &self.device
    }

    pub fn swapchain(&self) -> Option<&Swapchain> {
        self.swapchain.as_ref()
    }

    pub fn frames(&self) -> &FrameSynchronizer {
        &self.frames
    }

    pub fn is_minimized(&self) -> bool {
        !self.device.is_headless() && is_zero(self.drawable_extent)
    }

    // ---------------------------------------------------------------------
    // Frame protocol
    // ---------------------------------------------------------------------

    pub fn begin_frame(&mut self) -> GpuResult<vk::CommandBuffer> {
        self.frames.begin_frame(&self.device)
    }

    pub fn submit_cmds(&mut self, wait: FenceWait) -> GpuResult<()> {
        self.frames.submit_cmds(&self.device, wait)
    }

    pub fn advance_frame(&mut self) {
        self.frames.advance_frame();
    }

    /// Acquire, record one render pass, submit, present, advance.
    ///
    /// Returns `Ok(false)` when nothing was drawn (minimized, or the
    /// swapchain went out of date and is rebuilt on the next call).
    pub fn draw_frame(
        &mut self,
        clear_color: [f32; 4],
        record: impl FnOnce(&VulkanDevice, vk::CommandBuffer, &FrameInfo),
    ) -> GpuResult<bool> {
        if self.device.is_headless() {
            return Err(GpuError::SurfaceUnavailable);
        }
        if self.needs_rebuild {
            self.rebuild_swapchain()?;
        }
        let Some(swapchain) = self.swapchain.as_ref() else {
            return Ok(false);
        };

        // The slot's semaphores are free once its last submission is done.
        self.frames.wait_current(&self.device)?;
        let image_available = self.frames.current_slot().image_available;
        let (image_index, suboptimal) = match swapchain.acquire_next_image(image_available)? {
            AcquiredImage::Ready { index, suboptimal } => (index, suboptimal),
            AcquiredImage::OutOfDate => {
                log::debug!("Swapchain out of date at acquire");
                self.needs_rebuild = true;
                return Ok(false);
            }
        };

        let cmd = self.frames.begin_frame(&self.device)?;
        let info = FrameInfo {
            image_index,
            frame_slot: self.frames.current_index(),
            extent: swapchain.extent,
            render_pass: swapchain.render_pass,
            framebuffer: swapchain.framebuffer(image_index),
        };

        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];
        let render_pass_begin = vk::RenderPassBeginInfo::default()
            .render_pass(info.render_pass)
            .framebuffer(info.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: info.extent,
            })
            .clear_values(&clear_values);

        unsafe {
            self.device.device.cmd_begin_render_pass(
                cmd,
                &render_pass_begin,
                vk::SubpassContents::INLINE,
            );
        }
        record(&self.device, cmd, &info);
        unsafe { self.device.device.cmd_end_render_pass(cmd) };

        let render_finished = swapchain.render_finished(image_index);
        self.frames.submit_for_present(&self.device, render_finished)?;

        let present_wants_rebuild =
            swapchain.present(self.device.graphics_queue, image_index, &[render_finished])?;
        if suboptimal || present_wants_rebuild {
            self.needs_rebuild = true;
        }

        self.frames.advance_frame();
        Ok(true)
    }

    /// Record the new drawable size. The swapchain is rebuilt lazily.
    pub fn resize(&mut self, drawable_extent: vk::Extent2D) {
        if drawable_extent == self.drawable_extent && self.swapchain.is_some() {
            return;
        }
        log::debug!(
            "Drawable area now {}x{}",
            drawable_extent.width,
            drawable_extent.height
        );
        self.drawable_extent = drawable_extent;
        self.needs_rebuild = true;
    }

    fn rebuild_swapchain(&mut self) -> GpuResult<()> {
        if is_zero(self.drawable_extent) {
            // Stay flagged until a non-zero size arrives.
            return Ok(());
        }
        self.needs_rebuild = false;

        let device = &self.device;
        let extent = self.drawable_extent;
        let present_mode = self.present_mode;
        rebuild_or_release(
            &mut self.swapchain,
            |slot| {
                if let Some(swapchain) = slot.as_mut() {
                    return swapchain.recreate(device, extent);
                }
                device.wait_idle()?;
                *slot = Some(Swapchain::new(device, extent, present_mode)?);
                Ok(())
            },
            |mut stale| stale.destroy(device),
        )
    }

    // ---------------------------------------------------------------------
    // Resource factory
    // ---------------------------------------------------------------------

    pub fn allocate_memory(
        &self,
        requirements: vk::MemoryRequirements,
        properties: vk::MemoryPropertyFlags,
    ) -> GpuResult<MemoryBlock> {
        self.device
            .allocator
            .allocate(&self.device.device, requirements, properties)
    }

    pub fn free_memory(&self, block: MemoryBlock) {
        self.device.allocator.free(&self.device.device, block);
    }

    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> GpuResult<Buffer> {
        self.device.create_buffer(size, usage)
    }

    pub fn create_image_2d(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> GpuResult<Image> {
        self.device.create_image_2d(extent, format, usage)
    }

    pub fn create_allocated_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
    ) -> GpuResult<AllocatedBuffer> {
        self.device.create_allocated_buffer(size, usage, memory_usage)
    }

    /// Device-local storage buffer, writable through the staging path and
    /// readable back.
    pub fn create_ssbo(&self, size: vk::DeviceSize) -> GpuResult<AllocatedBuffer> {
        self.device.create_allocated_buffer(
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_DST
                | vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryUsage::GpuOnly,
        )
    }

    pub fn destroy_buffer(&self, buffer: AllocatedBuffer) {
        buffer.destroy(&self.device);
    }

    pub fn create_shader_module(&self, spirv: &[u8]) -> GpuResult<vk::ShaderModule> {
        shader::create_shader_module(&self.device, spirv)
    }

    pub fn destroy_shader_module(&self, module: vk::ShaderModule) {
        shader::destroy_shader_module(&self.device, module);
    }

    pub fn create_descriptor_set_layout(
        &self,
        bindings: &[vk::DescriptorSetLayoutBinding<'_>],
    ) -> GpuResult<vk::DescriptorSetLayout> {
        pipeline::create_descriptor_set_layout(&self.device, bindings)
    }

    pub fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        pipeline::destroy_descriptor_set_layout(&self.device, layout);
    }

    pub fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constant_ranges: &[vk::PushConstantRange],
    ) -> GpuResult<vk::PipelineLayout> {
        pipeline::create_pipeline_layout(&self.device, set_layouts, push_constant_ranges)
    }

    pub fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        pipeline::destroy_pipeline_layout(&self.device, layout);
    }

    // ---------------------------------------------------------------------
    // Staging
    // ---------------------------------------------------------------------

    pub fn upload_to_device_local(&mut self, target: &AllocatedBuffer, data: &[u8]) -> GpuResult<()> {
        staging::upload_to_device_local(&self.device, &mut self.frames, target, data)
    }

    pub fn upload_slice<T: bytemuck::Pod>(
        &mut self,
        target: &AllocatedBuffer,
        items: &[T],
    ) -> GpuResult<()> {
        staging::upload_slice(&self.device, &mut self.frames, target, items)
    }

    pub fn read_back(&mut self, source: &AllocatedBuffer, len: usize) -> GpuResult<Vec<u8>> {
        staging::read_back(&self.device, &mut self.frames, source, len)
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        self.shutdown();
    }
}

/// Run `rebuild` on `slot`; if it fails, take whatever is left and release it.
fn rebuild_or_release<T>(
    slot: &mut Option<T>,
    rebuild: impl FnOnce(&mut Option<T>) -> GpuResult<()>,
    release: impl FnOnce(T),
) -> GpuResult<()> {
    let result = rebuild(slot);
    if result.is_err() {
        if let Some(stale) = slot.take() {
            release(stale);
        }
    }
    result
}

fn is_zero(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}
