// Device memory allocator
//
// One call, one vkAllocateMemory. No pooling, no suballocation: callers that
// want either build it on top. Memory is a first-class object; buffers and
// images only bind to it, so freeing it is a separate, explicit step.

use ash::vk;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{GpuError, GpuResult, VkResultExt};

/// How an allocation will be accessed by CPU and GPU.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Not CPU-mappable.
    GpuOnly,
    /// CPU-written, GPU-read. Staging and uploads.
    CpuToGpu,
    /// GPU-written, CPU-read. Readback.
    GpuToCpu,
}

impl MemoryUsage {
    pub fn required_properties(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryUsage::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryUsage::CpuToGpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryUsage::GpuToCpu => vk::MemoryPropertyFlags::HOST_VISIBLE,
        }
    }
}

/// A single device memory allocation.
///
/// Not `Clone`: exactly one owner, and [`MemoryAllocator::free`] consumes it.
#[derive(Debug)]
pub struct MemoryBlock {
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    memory_type_index: u32,
    properties: vk::MemoryPropertyFlags,
    bindings: Arc<AtomicUsize>,
}

/// Keeps a [`MemoryBlock`] marked as bound until the resource drops it.
#[derive(Debug)]
pub struct BindingToken {
    memory: vk::DeviceMemory,
    offset: vk::DeviceSize,
    bindings: Arc<AtomicUsize>,
}

impl BindingToken {
    pub fn memory(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn offset(&self) -> vk::DeviceSize {
        self.offset
    }
}

impl Drop for BindingToken {
    fn drop(&mut self) {
        self.bindings.fetch_sub(1, Ordering::Relaxed);
    }
}

impl MemoryBlock {
    pub fn handle(&self) -> vk::DeviceMemory {
        self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_type_index(&self) -> u32 {
        self.memory_type_index
    }

    pub fn properties(&self) -> vk::MemoryPropertyFlags {
        self.properties
    }

    pub fn is_host_visible(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    fn is_host_coherent(&self) -> bool {
        self.properties
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    /// Number of resources currently bound to this block.
    pub fn outstanding_bindings(&self) -> usize {
        self.bindings.load(Ordering::Relaxed)
    }

    pub(crate) fn attach(&self, offset: vk::DeviceSize) -> BindingToken {
        self.bindings.fetch_add(1, Ordering::Relaxed);
        BindingToken {
            memory: self.memory,
            offset,
            bindings: Arc::clone(&self.bindings),
        }
    }

    fn ensure_unbound(&self) {
        let live = self.outstanding_bindings();
        assert_eq!(
            live, 0,
            "freeing memory block {:?} still bound to {} resource(s)",
            self.memory, live
        );
    }

    /// Copy `data` to the start of the block through a temporary mapping.
    pub fn write(&self, device: &ash::Device, data: &[u8]) -> GpuResult<()> {
        debug_assert!(self.is_host_visible(), "mapping device-local memory");
        debug_assert!(data.len() as vk::DeviceSize <= self.size);

        unsafe {
            let ptr = device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .check("vkMapMemory")?;
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u8>(), data.len());

            let flushed = if self.is_host_coherent() {
                Ok(())
            } else {
                device
                    .flush_mapped_memory_ranges(&[self.whole_range()])
                    .check("vkFlushMappedMemoryRanges")
            };
            device.unmap_memory(self.memory);
            flushed
        }
    }

    /// Read the first `len` bytes of the block through a temporary mapping.
    pub fn read(&self, device: &ash::Device, len: usize) -> GpuResult<Vec<u8>> {
        debug_assert!(self.is_host_visible(), "mapping device-local memory");
        debug_assert!(len as vk::DeviceSize <= self.size);

        let mut out = vec![0u8; len];
        unsafe {
            let ptr = device
                .map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
                .check("vkMapMemory")?;
            if !self.is_host_coherent() {
                if let Err(e) = device
                    .invalidate_mapped_memory_ranges(&[self.whole_range()])
                    .check("vkInvalidateMappedMemoryRanges")
                {
                    device.unmap_memory(self.memory);
                    return Err(e);
                }
            }
            std::ptr::copy_nonoverlapping(ptr.cast::<u8>(), out.as_mut_ptr(), len);
            device.unmap_memory(self.memory);
        }
        Ok(out)
    }

    fn whole_range(&self) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

/// Memory type indices allowed by `type_bits` whose flags contain `desired`,
/// in table order.
pub fn eligible_memory_types(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    desired: vk::MemoryPropertyFlags,
) -> impl Iterator<Item = u32> + '_ {
    (0..properties.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).filter(move |&i| {
        type_bits & (1 << i) != 0
            && properties.memory_types[i as usize]
                .property_flags
                .contains(desired)
    })
}

/// Try each candidate type in order, skipping types that are out of memory.
pub fn allocate_first_fit<T>(
    candidates: impl IntoIterator<Item = u32>,
    requirements: &vk::MemoryRequirements,
    desired: vk::MemoryPropertyFlags,
    mut try_allocate: impl FnMut(u32) -> GpuResult<T>,
) -> GpuResult<(u32, T)> {
    let mut tried = 0;
    for index in candidates {
        tried += 1;
        match try_allocate(index) {
            Ok(value) => return Ok((index, value)),
            Err(e) if e.is_out_of_memory() => {
                log::warn!("Memory type {} exhausted, trying the next one", index);
            }
            Err(e) => return Err(e),
        }
    }

    if tried == 0 {
        Err(GpuError::NoSuitableMemoryType {
            type_bits: requirements.memory_type_bits,
            properties: desired,
        })
    } else {
        Err(GpuError::OutOfDeviceMemory {
            size: requirements.size,
        })
    }
}

/// Linear-scan allocator over the physical device's memory type table.
#[derive(Debug)]
pub struct MemoryAllocator {
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    live_blocks: AtomicUsize,
}

impl MemoryAllocator {
    pub fn new(memory_properties: vk::PhysicalDeviceMemoryProperties) -> Self {
        Self {
            memory_properties,
            live_blocks: AtomicUsize::new(0),
        }
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn live_blocks(&self) -> usize {
        self.live_blocks.load(Ordering::Relaxed)
    }

    pub fn allocate(
        &self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        desired: vk::MemoryPropertyFlags,
    ) -> GpuResult<MemoryBlock> {
        let candidates =
            eligible_memory_types(&self.memory_properties, requirements.memory_type_bits, desired);

        let (memory_type_index, memory) =
            allocate_first_fit(candidates, &requirements, desired, |index| {
                let alloc_info = vk::MemoryAllocateInfo::default()
                    .allocation_size(requirements.size)
                    .memory_type_index(index);
                unsafe { device.allocate_memory(&alloc_info, None) }.check("vkAllocateMemory")
            })?;

        self.live_blocks.fetch_add(1, Ordering::Relaxed);
        log::trace!(
            "Allocated {} bytes from memory type {}",
            requirements.size,
            memory_type_index
        );

        Ok(MemoryBlock {
            memory,
            size: requirements.size,
            memory_type_index,
            properties: self.memory_properties.memory_types[memory_type_index as usize]
                .property_flags,
            bindings: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn allocate_for(
        &self,
        device: &ash::Device,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> GpuResult<MemoryBlock> {
        self.allocate(device, requirements, usage.required_properties())
    }

    /// Free a block. Traps if a resource is still bound to it.
    pub fn free(&self, device: &ash::Device, block: MemoryBlock) {
        block.ensure_unbound();
        unsafe { device.free_memory(block.memory, None) };
        self.live_blocks.fetch_sub(1, Ordering::Relaxed);
    }
}
