// Synchronization primitives and the per-frame protocol
//
// N frame slots, each {command buffer, fence, image-available semaphore}.
// A slot's command buffer is only reset after its fence has been waited on,
// so the GPU is provably done with the previous submission that used it.
//
// begin_frame -> record -> submit_cmds / submit_for_present -> advance_frame
//
// Advancing the cursor is its own call: one-shot uploads submit on the
// current slot and keep using it. A failed submit poisons the synchronizer:
// the slot's fence was already reset and will never signal.

use ash::vk;

use super::lifecycle::Dependent;
use super::VulkanDevice;
use crate::error::{GpuError, GpuResult, VkResultExt};

/// Upper bound on configurable frames in flight.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;
pub const DEFAULT_FRAMES_IN_FLIGHT: usize = 2;

/// Clamp a requested slot count into `1..=MAX_FRAMES_IN_FLIGHT`.
pub fn clamp_frames_in_flight(requested: usize) -> usize {
    requested.clamp(1, MAX_FRAMES_IN_FLIGHT)
}

/// Whether a submit blocks until the GPU has finished it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    /// Wait on the slot's fence before returning.
    Block,
    /// Return immediately; the next `begin_frame` on this slot waits instead.
    Detach,
}

/// Semaphores attached to a submit.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubmitSemaphores {
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
}

/// The queue/fence/command-buffer calls the frame protocol is made of.
pub trait FrameQueue {
    fn wait_for_fence(&self, fence: vk::Fence) -> GpuResult<()>;
    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()>;
    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
        semaphores: SubmitSemaphores,
    ) -> GpuResult<()>;
}

impl FrameQueue for VulkanDevice {
    fn wait_for_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) }
            .check("vkWaitForFences")
    }

    fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }.check("vkResetFences")
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
        }
        .check("vkResetCommandBuffer")
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(cmd, &begin_info) }
            .check("vkBeginCommandBuffer")
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
        unsafe { self.device.end_command_buffer(cmd) }.check("vkEndCommandBuffer")
    }

    fn submit(
        &self,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
        semaphores: SubmitSemaphores,
    ) -> GpuResult<()> {
        let command_buffers = [cmd];
        let (wait_semaphores, wait_stages): (Vec<_>, Vec<_>) = semaphores.wait.into_iter().unzip();
        let signal_semaphores: Vec<_> = semaphores.signal.into_iter().collect();

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, std::slice::from_ref(&submit_info), fence)
        }
        .check("vkQueueSubmit")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Nothing recorded since the last submit (or ever).
    Idle,
    Recording,
}

/// Frame synchronization - one per frame in flight
#[derive(Debug)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub in_flight_fence: vk::Fence,
    pub image_available: vk::Semaphore,
    state: SlotState,
}

impl FrameSlot {
    fn new(device: &VulkanDevice, command_buffer: vk::CommandBuffer) -> GpuResult<Self> {
        let mut slot = Self {
            command_buffer,
            in_flight_fence: vk::Fence::null(),
            image_available: vk::Semaphore::null(),
            state: SlotState::Idle,
        };
        if let Err(e) = slot.create_sync_objects(&device.device) {
            // Destroying null handles is a no-op.
            slot.destroy(&device.device);
            return Err(e);
        }
        Ok(slot)
    }

    fn create_sync_objects(&mut self, device: &ash::Device) -> GpuResult<()> {
        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first begin_frame does not block.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        unsafe {
            self.in_flight_fence = device
                .create_fence(&fence_info, None)
                .check("vkCreateFence")?;
            self.image_available = device
                .create_semaphore(&semaphore_info, None)
                .check("vkCreateSemaphore")?;
        }
        Ok(())
    }

    fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_semaphore(self.image_available, None);
            device.destroy_fence(self.in_flight_fence, None);
        }
    }
}

/// Owns the frame slots, their command pool and the current-frame cursor.
#[derive(Debug)]
pub struct FrameSynchronizer {
    command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    current: usize,
    failed: bool,
}

impl FrameSynchronizer {
    /// `frames_in_flight` is clamped into `1..=MAX_FRAMES_IN_FLIGHT`.
    pub fn new(device: &VulkanDevice, frames_in_flight: usize) -> GpuResult<Self> {
        let requested = frames_in_flight;
        let frames_in_flight = clamp_frames_in_flight(requested);
        if frames_in_flight != requested {
            log::warn!(
                "{} frames in flight requested, using {}",
                requested,
                frames_in_flight
            );
        }

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(device.graphics_queue_family)
            // RESET: Allow individual buffer reset
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .check("vkCreateCommandPool")?;

        let mut this = Self {
            command_pool,
            slots: Vec::with_capacity(frames_in_flight),
            current: 0,
            failed: false,
        };
        device.lifecycle().attach(Dependent::FrameSync);

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(frames_in_flight as u32);

        let built = unsafe { device.device.allocate_command_buffers(&alloc_info) }
            .check("vkAllocateCommandBuffers")
            .and_then(|command_buffers| {
                for cmd in command_buffers {
                    this.slots.push(FrameSlot::new(device, cmd)?);
                }
                Ok(())
            });
        if let Err(e) = built {
            this.destroy(device);
            return Err(e);
        }

        log::info!("Created {} frame slots", frames_in_flight);
        Ok(this)
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_slot(&self) -> &FrameSlot {
        &self.slots[self.current]
    }

    /// True once a submit has failed. Only `destroy` is allowed afterwards.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    fn ensure_usable(&self) -> GpuResult<()> {
        if self.failed {
            return Err(GpuError::FrameSyncFailed);
        }
        Ok(())
    }

    pub fn is_recording(&self) -> bool {
        self.slots
            .get(self.current)
            .is_some_and(|slot| slot.state == SlotState::Recording)
    }

    /// The open command buffer of the current slot.
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        debug_assert!(self.is_recording(), "no frame is being recorded");
        self.current_slot().command_buffer
    }

    /// Block until the current slot's last submission has finished.
    ///
    /// Lets the caller reuse the slot's semaphores (swapchain acquire) before
    /// opening the command buffer.
    pub fn wait_current(&self, queue: &impl FrameQueue) -> GpuResult<()> {
        self.ensure_usable()?;
        queue.wait_for_fence(self.current_slot().in_flight_fence)
    }

    /// Wait for the slot's previous submission, reset and open its command buffer.
    pub fn begin_frame(&mut self, queue: &impl FrameQueue) -> GpuResult<vk::CommandBuffer> {
        self.ensure_usable()?;
        let slot = &mut self.slots[self.current];
        debug_assert_eq!(slot.state, SlotState::Idle, "begin_frame while already recording");

        queue.wait_for_fence(slot.in_flight_fence)?;
        queue.reset_command_buffer(slot.command_buffer)?;
        queue.begin_command_buffer(slot.command_buffer)?;
        slot.state = SlotState::Recording;
        Ok(slot.command_buffer)
    }

    /// End recording and submit the current slot.
    pub fn submit_cmds(&mut self, queue: &impl FrameQueue, wait: FenceWait) -> GpuResult<()> {
        self.submit(queue, wait, SubmitSemaphores::default())
    }

    /// Submit for presentation: wait on the slot's image-available semaphore,
    /// signal `render_finished`.
    ///
    /// `render_finished` belongs to the acquired swapchain image, not to the
    /// slot: only re-acquiring that image proves present has consumed it.
    pub fn submit_for_present(
        &mut self,
        queue: &impl FrameQueue,
        render_finished: vk::Semaphore,
    ) -> GpuResult<()> {
        let semaphores = SubmitSemaphores {
            wait: Some((
                self.current_slot().image_available,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            )),
            signal: Some(render_finished),
        };
        self.submit(queue, FenceWait::Detach, semaphores)
    }

    fn submit(
        &mut self,
        queue: &impl FrameQueue,
        wait: FenceWait,
        semaphores: SubmitSemaphores,
    ) -> GpuResult<()> {
        self.ensure_usable()?;
        let slot = &mut self.slots[self.current];
        debug_assert_eq!(slot.state, SlotState::Recording, "submit without begin_frame");
        slot.state = SlotState::Idle;

        let result = Self::end_and_submit(queue, slot, wait, semaphores);
        if result.is_err() {
            log::error!("Frame slot {} submit failed, synchronizer unusable", self.current);
            self.failed = true;
        }
        result
    }

    fn end_and_submit(
        queue: &impl FrameQueue,
        slot: &FrameSlot,
        wait: FenceWait,
        semaphores: SubmitSemaphores,
    ) -> GpuResult<()> {
        queue.end_command_buffer(slot.command_buffer)?;
        queue.reset_fence(slot.in_flight_fence)?;
        queue.submit(slot.command_buffer, slot.in_flight_fence, semaphores)?;

        if wait == FenceWait::Block {
            queue.wait_for_fence(slot.in_flight_fence)?;
        }
        Ok(())
    }

    /// Move the cursor to the next slot.
    pub fn advance_frame(&mut self) {
        debug_assert!(!self.is_recording(), "advance_frame with an open command buffer");
        self.current = (self.current + 1) % self.slots.len();
    }

    pub fn is_destroyed(&self) -> bool {
        self.command_pool == vk::CommandPool::null()
    }

    /// Destroys sync objects and the pool (which frees the command buffers).
    /// The caller makes sure the GPU is idle first.
    pub fn destroy(&mut self, device: &VulkanDevice) {
        if self.is_destroyed() {
            return;
        }
        for slot in self.slots.drain(..) {
            slot.destroy(&device.device);
        }
        unsafe { device.device.destroy_command_pool(self.command_pool, None) };
        self.command_pool = vk::CommandPool::null();
        device.lifecycle().detach(Dependent::FrameSync);
    }
}

impl Drop for FrameSynchronizer {
    fn drop(&mut self) {
        if !self.is_destroyed() && !std::thread::panicking() {
            log::error!("FrameSynchronizer dropped without destroy(), leaking it");
            debug_assert!(false, "FrameSynchronizer dropped without destroy()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use rstest::rstest;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Call {
        Wait(u64),
        ResetFence(u64),
        ResetCmd(u64),
        Begin(u64),
        End(u64),
        Submit { cmd: u64, fence: u64 },
    }

    /// Records every call and simulates fences that signal when waited on.
    #[derive(Default)]
    struct RecordingQueue {
        calls: RefCell<Vec<Call>>,
        signaled: RefCell<HashMap<u64, bool>>,
        semaphores: RefCell<Vec<SubmitSemaphores>>,
        fail_submit: Cell<bool>,
    }

    impl RecordingQueue {
        fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }
    }

    impl FrameQueue for RecordingQueue {
        fn wait_for_fence(&self, fence: vk::Fence) -> GpuResult<()> {
            self.calls.borrow_mut().push(Call::Wait(fence.as_raw()));
            self.signaled.borrow_mut().insert(fence.as_raw(), true);
            Ok(())
        }

        fn reset_fence(&self, fence: vk::Fence) -> GpuResult<()> {
            self.calls.borrow_mut().push(Call::ResetFence(fence.as_raw()));
            self.signaled.borrow_mut().insert(fence.as_raw(), false);
            Ok(())
        }

        fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
            self.calls.borrow_mut().push(Call::ResetCmd(cmd.as_raw()));
            Ok(())
        }

        fn begin_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
            self.calls.borrow_mut().push(Call::Begin(cmd.as_raw()));
            Ok(())
        }

        fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> GpuResult<()> {
            self.calls.borrow_mut().push(Call::End(cmd.as_raw()));
            Ok(())
        }

        fn submit(
            &self,
            cmd: vk::CommandBuffer,
            fence: vk::Fence,
            semaphores: SubmitSemaphores,
        ) -> GpuResult<()> {
            if self.fail_submit.get() {
                return Err(GpuError::Vulkan {
                    call: "vkQueueSubmit",
                    result: vk::Result::ERROR_DEVICE_LOST,
                });
            }
            self.calls.borrow_mut().push(Call::Submit {
                cmd: cmd.as_raw(),
                fence: fence.as_raw(),
            });
            self.semaphores.borrow_mut().push(semaphores);
            Ok(())
        }
    }

    /// Slot i gets command buffer 100 + i and fence 200 + i.
    fn synchronizer(frames: usize) -> FrameSynchronizer {
        let slots = (0..frames as u64)
            .map(|i| FrameSlot {
                command_buffer: vk::CommandBuffer::from_raw(100 + i),
                in_flight_fence: vk::Fence::from_raw(200 + i),
                image_available: vk::Semaphore::from_raw(300 + i),
                state: SlotState::Idle,
            })
            .collect();
        FrameSynchronizer {
            // Null pool marks it destroyed, so Drop stays quiet.
            command_pool: vk::CommandPool::null(),
            slots,
            current: 0,
            failed: false,
        }
    }

    /// Stand-in for the acquired swapchain image's render-finished semaphore.
    fn present_semaphore(image_index: u64) -> vk::Semaphore {
        vk::Semaphore::from_raw(400 + image_index)
    }

    /// Every reset of a command buffer must follow a wait on its slot's fence
    /// issued after that slot's most recent submit.
    fn assert_reuse_invariant(calls: &[Call]) {
        let mut waited_since_submit: HashMap<u64, bool> = HashMap::new();
        for call in calls {
            match *call {
                Call::Submit { fence, .. } => {
                    waited_since_submit.insert(fence, false);
                }
                Call::Wait(fence) => {
                    waited_since_submit.insert(fence, true);
                }
                Call::ResetCmd(cmd) => {
                    let fence = cmd - 100 + 200;
                    assert!(
                        *waited_since_submit.get(&fence).unwrap_or(&false),
                        "command buffer {} reset before fence {} was waited on",
                        cmd,
                        fence
                    );
                }
                _ => {}
            }
        }
    }

    #[test]
    fn begin_waits_then_resets_then_begins() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        let cmd = frames.begin_frame(&queue).unwrap();
        assert_eq!(cmd.as_raw(), 100);
        assert!(frames.is_recording());
        assert_eq!(
            queue.calls(),
            vec![Call::Wait(200), Call::ResetCmd(100), Call::Begin(100)]
        );
    }

    #[test]
    fn blocking_submit_waits_on_the_fence_it_signals() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        frames.begin_frame(&queue).unwrap();
        frames.submit_cmds(&queue, FenceWait::Block).unwrap();

        assert_eq!(
            queue.calls()[3..],
            [
                Call::End(100),
                Call::ResetFence(200),
                Call::Submit {
                    cmd: 100,
                    fence: 200
                },
                Call::Wait(200),
            ]
        );
        assert!(!frames.is_recording());
        assert_eq!(queue.signaled.borrow()[&200u64], true);
    }

    #[test]
    fn detached_submit_returns_without_waiting() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        frames.begin_frame(&queue).unwrap();
        frames.submit_cmds(&queue, FenceWait::Detach).unwrap();

        assert_eq!(
            queue.calls().last(),
            Some(&Call::Submit {
                cmd: 100,
                fence: 200
            })
        );
        assert_eq!(queue.signaled.borrow()[&200u64], false);
    }

    #[test]
    fn submitting_does_not_advance_the_cursor() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        for _ in 0..3 {
            frames.begin_frame(&queue).unwrap();
            frames.submit_cmds(&queue, FenceWait::Block).unwrap();
            assert_eq!(frames.current_index(), 0);
        }

        frames.advance_frame();
        assert_eq!(frames.current_index(), 1);
        frames.advance_frame();
        assert_eq!(frames.current_index(), 0);
    }

    #[test]
    fn steady_state_render_loop_never_reuses_an_unfinished_slot() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        for frame in 0..10 {
            frames.begin_frame(&queue).unwrap();
            // Interleave a synchronous upload every third frame.
            if frame % 3 == 0 {
                frames.submit_cmds(&queue, FenceWait::Block).unwrap();
                frames.begin_frame(&queue).unwrap();
            }
            frames.submit_for_present(&queue, present_semaphore(frame % 3)).unwrap();
            frames.advance_frame();
        }

        assert_reuse_invariant(&queue.calls());
    }

    #[test]
    fn waiting_ahead_of_begin_keeps_the_protocol_intact() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        for frame in 0..4 {
            frames.wait_current(&queue).unwrap();
            frames.begin_frame(&queue).unwrap();
            frames.submit_for_present(&queue, present_semaphore(frame)).unwrap();
            frames.advance_frame();
        }
        assert_eq!(queue.calls()[0], Call::Wait(200));
        assert_reuse_invariant(&queue.calls());
    }

    #[test]
    fn single_slot_configuration_still_waits_every_frame() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(1);

        for _ in 0..4 {
            frames.begin_frame(&queue).unwrap();
            frames.submit_cmds(&queue, FenceWait::Detach).unwrap();
            frames.advance_frame();
        }
        assert_eq!(frames.current_index(), 0);
        assert_reuse_invariant(&queue.calls());
    }

    #[test]
    fn present_submit_signals_the_image_semaphore_not_a_slot_one() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        // Three swapchain images cycled through two slots.
        for image in [0, 1, 2, 0] {
            frames.begin_frame(&queue).unwrap();
            frames.submit_for_present(&queue, present_semaphore(image)).unwrap();
            frames.advance_frame();
        }

        let used: Vec<_> = queue
            .semaphores
            .borrow()
            .iter()
            .map(|s| (s.wait.map(|(sem, _)| sem.as_raw()), s.signal.map(|s| s.as_raw())))
            .collect();
        assert_eq!(
            used,
            vec![
                (Some(300), Some(400)),
                (Some(301), Some(401)),
                (Some(300), Some(402)),
                (Some(301), Some(400)),
            ]
        );
    }

    #[test]
    fn failed_submit_makes_the_synchronizer_unusable() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);

        frames.begin_frame(&queue).unwrap();
        queue.fail_submit.set(true);
        let err = frames.submit_cmds(&queue, FenceWait::Detach).unwrap_err();
        assert!(matches!(err, GpuError::Vulkan { .. }));
        assert!(frames.has_failed());
        assert!(!frames.is_recording());
        // The fence was reset and nothing will signal it.
        assert_eq!(queue.signaled.borrow()[&200u64], false);

        queue.fail_submit.set(false);
        let calls_before = queue.calls().len();
        assert!(matches!(
            frames.begin_frame(&queue),
            Err(GpuError::FrameSyncFailed)
        ));
        assert!(matches!(
            frames.wait_current(&queue),
            Err(GpuError::FrameSyncFailed)
        ));
        assert!(matches!(
            frames.submit_cmds(&queue, FenceWait::Block),
            Err(GpuError::FrameSyncFailed)
        ));
        // Nothing reached the queue, in particular no wait on the dead fence.
        assert_eq!(queue.calls().len(), calls_before);
    }

    #[rstest]
    #[case(0, 1)]
    #[case(1, 1)]
    #[case(2, 2)]
    #[case(MAX_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT)]
    #[case(64, MAX_FRAMES_IN_FLIGHT)]
    fn slot_count_is_clamped(#[case] requested: usize, #[case] expected: usize) {
        assert_eq!(clamp_frames_in_flight(requested), expected);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "submit without begin_frame")]
    fn submit_without_begin_traps() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);
        let _ = frames.submit_cmds(&queue, FenceWait::Block);
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "open command buffer")]
    fn advancing_mid_recording_traps() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);
        frames.begin_frame(&queue).unwrap();
        frames.advance_frame();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "already recording")]
    fn double_begin_traps() {
        let queue = RecordingQueue::default();
        let mut frames = synchronizer(2);
        frames.begin_frame(&queue).unwrap();
        let _ = frames.begin_frame(&queue);
    }
}
