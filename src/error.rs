// Error types for the device layer
//
// Every Vulkan result funnels through `VkResultExt::check`, which tags the
// failing call and logs it once. Nothing is recovered locally except the
// incomplete-enumeration retry inside ash's enumerate wrappers.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GpuError {
    #[error("Vulkan call `{call}` failed: {result:?}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("Failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Required instance extension {0} is not available")]
    MissingExtension(String),

    #[error("No physical device exposes a queue family with graphics and present support")]
    NoSuitableDevice,

    #[error("No memory type matches type bits {type_bits:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Every eligible memory type is exhausted ({size} bytes requested)")]
    OutOfDeviceMemory { size: vk::DeviceSize },

    #[error("Upload of {len} bytes does not fit a {capacity}-byte buffer")]
    UploadTooLarge {
        len: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("Readback of {len} bytes exceeds the {capacity}-byte source buffer")]
    ReadBackTooLarge {
        len: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },

    #[error("A frame submission failed earlier; the context has to be shut down")]
    FrameSyncFailed,

    #[error("Invalid SPIR-V shader: {0}")]
    InvalidShader(#[source] std::io::Error),

    #[error("Window handle unavailable: {0}")]
    WindowHandle(#[from] raw_window_handle::HandleError),

    #[error("Operation requires a presentation surface but the context is headless")]
    SurfaceUnavailable,
}

impl GpuError {
    /// True for the two allocation failures the memory allocator may skip past.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            GpuError::Vulkan {
                result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY
                    | vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                ..
            }
        )
    }
}

pub type GpuResult<T> = Result<T, GpuError>;

/// Check-and-tag helper for raw `ash` results.
pub trait VkResultExt<T> {
    fn check(self, call: &'static str) -> GpuResult<T>;
}

impl<T> VkResultExt<T> for ash::prelude::VkResult<T> {
    fn check(self, call: &'static str) -> GpuResult<T> {
        self.map_err(|result| {
            log::error!("[Vulkan] {} failed: {:?}", call, result);
            GpuError::Vulkan { call, result }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_tags_the_failing_call() {
        let result: ash::prelude::VkResult<()> = Err(vk::Result::ERROR_DEVICE_LOST);
        let err = result.check("vkQueueSubmit").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Vulkan call `vkQueueSubmit` failed: ERROR_DEVICE_LOST"
        );
    }

    #[test]
    fn only_allocation_failures_count_as_out_of_memory() {
        let oom = GpuError::Vulkan {
            call: "vkAllocateMemory",
            result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
        };
        let lost = GpuError::Vulkan {
            call: "vkAllocateMemory",
            result: vk::Result::ERROR_DEVICE_LOST,
        };
        assert!(oom.is_out_of_memory());
        assert!(!lost.is_out_of_memory());
        assert!(!GpuError::NoSuitableDevice.is_out_of_memory());
    }
}
