// Render pass, framebuffers and layout objects
//
// Shader authoring and descriptor conventions are the caller's business;
// this module only wraps object creation.

use ash::vk;

use super::buffer::DEPTH_FORMAT;
use super::VulkanDevice;
use crate::error::{GpuResult, VkResultExt};

/// External -> subpass 0 dependencies: one for color writes, one for depth.
///
/// Both order the first writes of the frame after whatever touched the
/// attachment before the render pass began.
pub fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    let color = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        );

    let fragment_tests = vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
        | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
    let depth = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(fragment_tests)
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_stage_mask(fragment_tests)
        .dst_access_mask(
            vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        );

    [color, depth]
}

/// Create a render pass for color + depth rendering
pub fn create_render_pass(device: &VulkanDevice, format: vk::Format) -> GpuResult<vk::RenderPass> {
    // Color attachment (the swapchain image)
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    // Depth attachment
    let depth_attachment = vk::AttachmentDescription::default()
        .format(DEPTH_FORMAT)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let color_attachment_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    let depth_attachment_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments)
        .depth_stencil_attachment(&depth_attachment_ref);

    let attachments = [color_attachment, depth_attachment];
    let subpasses = [subpass];
    let dependencies = subpass_dependencies();

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.device.create_render_pass(&render_pass_info, None) }
        .check("vkCreateRenderPass")
}

/// One framebuffer per swapchain image, all sharing the depth view.
pub fn create_framebuffers(
    device: &VulkanDevice,
    image_views: &[vk::ImageView],
    depth_image_view: vk::ImageView,
    render_pass: vk::RenderPass,
    extent: vk::Extent2D,
) -> GpuResult<Vec<vk::Framebuffer>> {
    let mut framebuffers = Vec::with_capacity(image_views.len());
    for &image_view in image_views {
        let attachments = [image_view, depth_image_view];
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        match unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
            .check("vkCreateFramebuffer")
        {
            Ok(framebuffer) => framebuffers.push(framebuffer),
            Err(e) => {
                destroy_framebuffers(device, &mut framebuffers);
                return Err(e);
            }
        }
    }
    Ok(framebuffers)
}

pub fn destroy_framebuffers(device: &VulkanDevice, framebuffers: &mut Vec<vk::Framebuffer>) {
    for framebuffer in framebuffers.drain(..) {
        unsafe { device.device.destroy_framebuffer(framebuffer, None) };
    }
}

pub fn create_descriptor_set_layout(
    device: &VulkanDevice,
    bindings: &[vk::DescriptorSetLayoutBinding<'_>],
) -> GpuResult<vk::DescriptorSetLayout> {
    let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);
    unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
        .check("vkCreateDescriptorSetLayout")
}

pub fn destroy_descriptor_set_layout(device: &VulkanDevice, layout: vk::DescriptorSetLayout) {
    unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
}

pub fn create_pipeline_layout(
    device: &VulkanDevice,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_ranges: &[vk::PushConstantRange],
) -> GpuResult<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::default()
        .set_layouts(set_layouts)
        .push_constant_ranges(push_constant_ranges);
    unsafe { device.device.create_pipeline_layout(&layout_info, None) }
        .check("vkCreatePipelineLayout")
}

pub fn destroy_pipeline_layout(device: &VulkanDevice, layout: vk::PipelineLayout) {
    unsafe { device.device.destroy_pipeline_layout(layout, None) };
}
