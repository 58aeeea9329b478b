// Staging uploads and readback
//
// Device-local buffers are never mapped. Data goes CPU -> host-visible
// staging buffer -> recorded copy -> device-local target, and the submit
// blocks so the staging buffer can be destroyed before returning.
//
// The copy is recorded into the frame synchronizer's current slot and the
// cursor is left where it was.

use ash::vk;

use super::buffer::AllocatedBuffer;
use super::memory::MemoryUsage;
use super::sync::{FenceWait, FrameSynchronizer};
use super::VulkanDevice;
use crate::error::{GpuError, GpuResult};

/// Copy region for `len` bytes into a buffer of `capacity` bytes.
///
/// `None` means there is nothing to copy.
pub fn plan_upload(
    capacity: vk::DeviceSize,
    len: vk::DeviceSize,
) -> GpuResult<Option<vk::BufferCopy>> {
    if len > capacity {
        return Err(GpuError::UploadTooLarge { len, capacity });
    }
    Ok(copy_region(len))
}

/// Copy region for reading `len` bytes out of a buffer of `capacity` bytes.
pub fn plan_read_back(
    capacity: vk::DeviceSize,
    len: vk::DeviceSize,
) -> GpuResult<Option<vk::BufferCopy>> {
    if len > capacity {
        return Err(GpuError::ReadBackTooLarge { len, capacity });
    }
    Ok(copy_region(len))
}

fn copy_region(len: vk::DeviceSize) -> Option<vk::BufferCopy> {
    (len > 0).then_some(vk::BufferCopy {
        src_offset: 0,
        dst_offset: 0,
        size: len,
    })
}

/// Upload `data` to the start of a device-local buffer and wait for the copy.
pub fn upload_to_device_local(
    device: &VulkanDevice,
    frames: &mut FrameSynchronizer,
    target: &AllocatedBuffer,
    data: &[u8],
) -> GpuResult<()> {
    let Some(region) = plan_upload(target.size(), data.len() as vk::DeviceSize)? else {
        log::trace!("Skipping empty upload");
        return Ok(());
    };

    let staging = device.create_allocated_buffer(
        target.size(),
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUsage::CpuToGpu,
    )?;

    let result = staging
        .memory
        .write(&device.device, data)
        .and_then(|()| {
            record_and_wait(device, frames, |cmd| unsafe {
                device
                    .device
                    .cmd_copy_buffer(cmd, staging.handle(), target.handle(), &[region]);

                // Order the copy before any later transfer touching the target.
                let barrier = buffer_barrier(
                    target.handle(),
                    region.size,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
                );
                device.device.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[barrier],
                    &[],
                );
            })
        });

    staging.destroy(device);
    if result.is_ok() {
        log::debug!("Uploaded {} bytes to buffer {:?}", data.len(), target.handle());
    }
    result
}

/// Typed convenience over [`upload_to_device_local`].
pub fn upload_slice<T: bytemuck::Pod>(
    device: &VulkanDevice,
    frames: &mut FrameSynchronizer,
    target: &AllocatedBuffer,
    items: &[T],
) -> GpuResult<()> {
    upload_to_device_local(device, frames, target, bytemuck::cast_slice(items))
}

/// Copy the first `len` bytes of a buffer back to the CPU.
///
/// The source needs `TRANSFER_SRC` usage.
pub fn read_back(
    device: &VulkanDevice,
    frames: &mut FrameSynchronizer,
    source: &AllocatedBuffer,
    len: usize,
) -> GpuResult<Vec<u8>> {
    let Some(region) = plan_read_back(source.size(), len as vk::DeviceSize)? else {
        return Ok(Vec::new());
    };

    let staging = device.create_allocated_buffer(
        region.size,
        vk::BufferUsageFlags::TRANSFER_DST,
        MemoryUsage::GpuToCpu,
    )?;

    let result = record_and_wait(device, frames, |cmd| unsafe {
        device
            .device
            .cmd_copy_buffer(cmd, source.handle(), staging.handle(), &[region]);

        // Make the copy visible to host reads of the staging memory.
        let barrier = buffer_barrier(
            staging.handle(),
            region.size,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::HOST_READ,
        );
        device.device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::HOST,
            vk::DependencyFlags::empty(),
            &[],
            &[barrier],
            &[],
        );
    })
    .and_then(|()| staging.memory.read(&device.device, len));

    staging.destroy(device);
    result
}

/// Begin the current slot, record, submit and block until the GPU is done.
fn record_and_wait(
    device: &VulkanDevice,
    frames: &mut FrameSynchronizer,
    record: impl FnOnce(vk::CommandBuffer),
) -> GpuResult<()> {
    let cmd = frames.begin_frame(device)?;
    record(cmd);
    frames.submit_cmds(device, FenceWait::Block)
}

fn buffer_barrier(
    buffer: vk::Buffer,
    size: vk::DeviceSize,
    src_access_mask: vk::AccessFlags,
    dst_access_mask: vk::AccessFlags,
) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(src_access_mask)
        .dst_access_mask(dst_access_mask)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn empty_upload_is_a_no_op() {
        assert!(plan_upload(256, 0).unwrap().is_none());
        assert!(plan_upload(0, 0).unwrap().is_none());
    }

    #[rstest]
    #[case(256, 1)]
    #[case(256, 255)]
    #[case(256, 256)]
    fn fitting_uploads_copy_exactly_the_data(
        #[case] capacity: vk::DeviceSize,
        #[case] len: vk::DeviceSize,
    ) {
        let region = plan_upload(capacity, len).unwrap().unwrap();
        assert_eq!(region.size, len);
        assert_eq!(region.src_offset, 0);
        assert_eq!(region.dst_offset, 0);
    }

    #[test]
    fn oversized_upload_is_rejected() {
        let err = plan_upload(256, 257).unwrap_err();
        assert!(matches!(
            err,
            GpuError::UploadTooLarge {
                len: 257,
                capacity: 256
            }
        ));
    }

    #[test]
    fn oversized_read_back_reports_a_read_error() {
        let err = plan_read_back(64, 65).unwrap_err();
        assert!(matches!(
            err,
            GpuError::ReadBackTooLarge {
                len: 65,
                capacity: 64
            }
        ));
        assert!(plan_read_back(64, 0).unwrap().is_none());
        assert_eq!(plan_read_back(64, 64).unwrap().unwrap().size, 64);
    }

    #[test]
    fn barrier_covers_the_copied_range() {
        let barrier = buffer_barrier(
            vk::Buffer::null(),
            64,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::HOST_READ,
        );
        assert_eq!(barrier.offset, 0);
        assert_eq!(barrier.size, 64);
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.dst_access_mask, vk::AccessFlags::HOST_READ);
    }
}
