// Shader module loading
//
// SPIR-V arrives as bytes (embedded or read from disk). `ash::util::read_spv`
// handles alignment and rejects lengths that are not a multiple of 4.

use ash::vk;
use std::io::Cursor;

use super::VulkanDevice;
use crate::error::{GpuError, GpuResult, VkResultExt};

/// Decode SPIR-V bytes into words.
pub fn spirv_words(bytes: &[u8]) -> GpuResult<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(GpuError::InvalidShader)
}

/// Load SPIR-V shader from bytes and create a shader module
pub fn create_shader_module(device: &VulkanDevice, bytes: &[u8]) -> GpuResult<vk::ShaderModule> {
    let code = spirv_words(bytes)?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    unsafe { device.device.create_shader_module(&create_info, None) }
        .check("vkCreateShaderModule")
}

pub fn destroy_shader_module(device: &VulkanDevice, module: vk::ShaderModule) {
    unsafe { device.device.destroy_shader_module(module, None) };
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn decodes_little_endian_words() {
        let mut bytes = SPIRV_MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());
        assert_eq!(spirv_words(&bytes).unwrap(), vec![SPIRV_MAGIC, 0x0001_0000]);
    }

    #[test]
    fn truncated_bytecode_is_rejected() {
        let bytes = [0x03, 0x02, 0x23, 0x07, 0x00];
        assert!(matches!(
            spirv_words(&bytes),
            Err(GpuError::InvalidShader(_))
        ));
    }
}
