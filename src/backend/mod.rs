// Backend module - Vulkan abstraction layer
//
// Design: Thin wrapper around ash, explicit ownership
// Every object is destroyed by an explicit call, in reverse creation order

pub mod buffer;
pub mod device;
pub mod enumerate;
pub mod lifecycle;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod staging;
pub mod swapchain;
pub mod sync;

pub use buffer::{AllocatedBuffer, Buffer, DepthTarget, Image, DEPTH_FORMAT};
pub use device::{DeviceDesc, SurfaceTarget, VulkanDevice};
pub use lifecycle::BootStage;
pub use memory::{MemoryAllocator, MemoryBlock, MemoryUsage};
pub use swapchain::{AcquiredImage, Swapchain};
pub use sync::{
    FenceWait, FrameQueue, FrameSynchronizer, DEFAULT_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT,
};
