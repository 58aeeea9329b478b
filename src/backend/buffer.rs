// Buffers and images
//
// Resources are created unbound and must be bound to a MemoryBlock exactly
// once before use. Destroying a resource releases its handle and its binding
// but never the memory: freeing memory is the owner's separate step.

use ash::vk;

use super::memory::{BindingToken, MemoryBlock, MemoryUsage};
use super::VulkanDevice;
use crate::error::{GpuResult, VkResultExt};

/// Depth format used by every depth target.
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

#[derive(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    binding: Option<BindingToken>,
}

impl Buffer {
    /// Raw handle. Using an unbound buffer is a contract violation.
    pub fn handle(&self) -> vk::Buffer {
        debug_assert!(self.binding.is_some(), "buffer {:?} used before bind", self.handle);
        self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.usage
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn memory_requirements(&self, device: &VulkanDevice) -> vk::MemoryRequirements {
        unsafe { device.device.get_buffer_memory_requirements(self.handle) }
    }

    pub fn bind(
        &mut self,
        device: &VulkanDevice,
        block: &MemoryBlock,
        offset: vk::DeviceSize,
    ) -> GpuResult<()> {
        let requirements = self.memory_requirements(device);
        check_bindable(self.binding.is_some(), &requirements, block, offset);

        unsafe {
            device
                .device
                .bind_buffer_memory(self.handle, block.handle(), offset)
                .check("vkBindBufferMemory")?;
        }
        self.binding = Some(block.attach(offset));
        Ok(())
    }

    /// Release the handle. The bound memory stays allocated.
    pub fn destroy(self, device: &VulkanDevice) {
        unsafe { device.device.destroy_buffer(self.handle, None) };
    }
}

#[derive(Debug)]
pub struct Image {
    handle: vk::Image,
    extent: vk::Extent2D,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    binding: Option<BindingToken>,
}

impl Image {
    pub fn handle(&self) -> vk::Image {
        debug_assert!(self.binding.is_some(), "image {:?} used before bind", self.handle);
        self.handle
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn usage(&self) -> vk::ImageUsageFlags {
        self.usage
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn memory_requirements(&self, device: &VulkanDevice) -> vk::MemoryRequirements {
        unsafe { device.device.get_image_memory_requirements(self.handle) }
    }

    pub fn bind(
        &mut self,
        device: &VulkanDevice,
        block: &MemoryBlock,
        offset: vk::DeviceSize,
    ) -> GpuResult<()> {
        let requirements = self.memory_requirements(device);
        check_bindable(self.binding.is_some(), &requirements, block, offset);

        unsafe {
            device
                .device
                .bind_image_memory(self.handle, block.handle(), offset)
                .check("vkBindImageMemory")?;
        }
        self.binding = Some(block.attach(offset));
        Ok(())
    }

    pub fn destroy(self, device: &VulkanDevice) {
        unsafe { device.device.destroy_image(self.handle, None) };
    }
}

/// Debug-only checks shared by buffer and image binding.
fn check_bindable(
    already_bound: bool,
    requirements: &vk::MemoryRequirements,
    block: &MemoryBlock,
    offset: vk::DeviceSize,
) {
    debug_assert!(!already_bound, "resource bound to memory twice");
    debug_assert!(
        requirements.memory_type_bits & (1 << block.memory_type_index()) != 0,
        "memory type {} not allowed for this resource",
        block.memory_type_index()
    );
    debug_assert!(
        requirements.alignment == 0 || offset % requirements.alignment == 0,
        "bind offset {} breaks alignment {}",
        offset,
        requirements.alignment
    );
    debug_assert!(
        offset + requirements.size <= block.size(),
        "resource of {} bytes at offset {} overruns a {}-byte block",
        requirements.size,
        offset,
        block.size()
    );
}

/// A buffer together with the memory block it owns.
///
/// Used for staging buffers and long-lived SSBOs.
#[derive(Debug)]
pub struct AllocatedBuffer {
    pub buffer: Buffer,
    pub memory: MemoryBlock,
}

impl AllocatedBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.buffer.handle()
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.buffer.size()
    }

    /// Destroy the buffer first, then free its memory.
    pub fn destroy(self, device: &VulkanDevice) {
        let Self { buffer, memory } = self;
        buffer.destroy(device);
        device.allocator.free(&device.device, memory);
    }
}

impl VulkanDevice {
    pub fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> GpuResult<Buffer> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle = unsafe { self.device.create_buffer(&buffer_info, None) }
            .check("vkCreateBuffer")?;

        Ok(Buffer {
            handle,
            size,
            usage,
            binding: None,
        })
    }

    pub fn create_image_2d(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> GpuResult<Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let handle =
            unsafe { self.device.create_image(&image_info, None) }.check("vkCreateImage")?;

        Ok(Image {
            handle,
            extent,
            format,
            usage,
            binding: None,
        })
    }

    pub fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect_mask: vk::ImageAspectFlags,
    ) -> GpuResult<vk::ImageView> {
        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping {
                r: vk::ComponentSwizzle::IDENTITY,
                g: vk::ComponentSwizzle::IDENTITY,
                b: vk::ComponentSwizzle::IDENTITY,
                a: vk::ComponentSwizzle::IDENTITY,
            })
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        unsafe { self.device.create_image_view(&view_info, None) }.check("vkCreateImageView")
    }

    pub fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    /// Create a buffer, allocate memory for it and bind the two.
    pub fn create_allocated_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_usage: MemoryUsage,
    ) -> GpuResult<AllocatedBuffer> {
        let mut buffer = self.create_buffer(size, usage)?;
        let requirements = buffer.memory_requirements(self);

        let memory = match self
            .allocator
            .allocate_for(&self.device, requirements, memory_usage)
        {
            Ok(memory) => memory,
            Err(e) => {
                buffer.destroy(self);
                return Err(e);
            }
        };

        if let Err(e) = buffer.bind(self, &memory, 0) {
            buffer.destroy(self);
            self.allocator.free(&self.device, memory);
            return Err(e);
        }

        Ok(AllocatedBuffer { buffer, memory })
    }
}

/// Depth image, its memory and its view.
#[derive(Debug)]
pub struct DepthTarget {
    pub image: Image,
    pub memory: MemoryBlock,
    pub view: vk::ImageView,
}

impl DepthTarget {
    pub fn new(device: &VulkanDevice, extent: vk::Extent2D) -> GpuResult<Self> {
        let mut image = device.create_image_2d(
            extent,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let requirements = image.memory_requirements(device);
        let memory = match device
            .allocator
            .allocate_for(&device.device, requirements, MemoryUsage::GpuOnly)
        {
            Ok(memory) => memory,
            Err(e) => {
                image.destroy(device);
                return Err(e);
            }
        };

        let view = image
            .bind(device, &memory, 0)
            .and_then(|()| {
                device.create_image_view(image.handle(), DEPTH_FORMAT, vk::ImageAspectFlags::DEPTH)
            });
        let view = match view {
            Ok(view) => view,
            Err(e) => {
                image.destroy(device);
                device.allocator.free(&device.device, memory);
                return Err(e);
            }
        };

        Ok(Self {
            image,
            memory,
            view,
        })
    }

    /// View, then image, then memory.
    pub fn destroy(self, device: &VulkanDevice) {
        let Self {
            image,
            memory,
            view,
        } = self;
        device.destroy_image_view(view);
        image.destroy(device);
        device.allocator.free(&device.device, memory);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn unbound_buffer() -> Buffer {
        Buffer {
            handle: vk::Buffer::from_raw(7),
            size: 256,
            usage: vk::BufferUsageFlags::STORAGE_BUFFER,
            binding: None,
        }
    }

    #[test]
    fn new_buffers_start_unbound() {
        let buffer = unbound_buffer();
        assert!(!buffer.is_bound());
        assert_eq!(buffer.size(), 256);
        assert_eq!(buffer.usage(), vk::BufferUsageFlags::STORAGE_BUFFER);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "used before bind")]
    fn using_an_unbound_buffer_traps() {
        let buffer = unbound_buffer();
        let _ = buffer.handle();
    }
}
