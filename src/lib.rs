//! etna - a thin, explicit Vulkan layer.
//!
//! Bootstraps a device, keeps a swapchain sized to the window, runs the
//! per-frame fence/command-buffer protocol and moves data into device-local
//! memory through staging buffers. Everything hangs off an explicitly passed
//! [`GpuContext`].

pub mod backend;
pub mod config;
pub mod context;
pub mod error;

pub use ash::vk;
pub use backend::{
    AllocatedBuffer, BootStage, FenceWait, MemoryUsage, Swapchain, VulkanDevice,
    DEFAULT_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT,
};
pub use config::Config;
pub use context::{ContextDesc, FrameInfo, GpuContext};
pub use error::{GpuError, GpuResult};
