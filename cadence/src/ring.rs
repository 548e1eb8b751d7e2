//! The ring of in-flight frame resources.
use std::time::Duration;

use ash::{prelude::VkResult, vk};
use tracing::debug;

use crate::{context::GpuQueue, sync::SemaphoreState};

/// One set of per-frame resources, owned exclusively by the ring.
///
/// `target` is the timeline value proving the slot's previous submission has completed; it is
/// bumped by `frames_in_flight` every cycle, so slot `i`'s n-th submission signals
/// `i + n * frames_in_flight`.
struct FrameSlot {
    pool: vk::CommandPool,
    cmd: vk::CommandBuffer,
    target: u64,
    recording: bool,
}

/// A fixed ring of `frames_in_flight` frame slots coordinated through one timeline semaphore.
///
/// Provides a fresh, safe-to-record command buffer for the current frame: a slot's command pool
/// is only reset once the timeline has been observed at the slot's target value, which proves
/// the GPU finished the slot's previous submission. The timeline starts at
/// `frames_in_flight - 1` so the first `frames_in_flight` cycles proceed without blocking.
pub struct FrameRing<Q: GpuQueue> {
    queue: Q,
    timeline: vk::Semaphore,
    slots: Vec<FrameSlot>,
    cursor: usize,
}

impl<Q: GpuQueue> FrameRing<Q> {
    /// Creates the ring. `frames_in_flight` must be at least 2; the design depends on
    /// double/triple buffering semantics.
    pub fn new(queue: Q, frames_in_flight: usize) -> FrameRing<Q> {
        assert!(frames_in_flight >= 2, "frames_in_flight must be at least 2");
        let timeline = queue.create_timeline_semaphore(frames_in_flight as u64 - 1);
        let slots = (0..frames_in_flight)
            .map(|i| {
                let (pool, cmd) = queue.create_frame_commands();
                FrameSlot {
                    pool,
                    cmd,
                    target: i as u64,
                    recording: false,
                }
            })
            .collect();
        FrameRing {
            queue,
            timeline,
            slots,
            cursor: 0,
        }
    }

    pub fn queue(&self) -> &Q {
        &self.queue
    }

    pub fn timeline(&self) -> vk::Semaphore {
        self.timeline
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// The timeline value the given slot's previous submission signals.
    pub fn target(&self, slot: usize) -> u64 {
        self.slots[slot].target
    }

    /// The current slot's command buffer. Valid between `begin_recording` and the submit.
    pub fn current_command_buffer(&self) -> vk::CommandBuffer {
        self.slots[self.cursor].cmd
    }

    /// Blocks until the GPU has completed the current slot's previous submission.
    ///
    /// This is what bounds in-flight frames to `frames_in_flight`.
    pub fn wait_current(&self, timeout: Option<Duration>) -> VkResult<bool> {
        let target = self.slots[self.cursor].target;
        self.queue.wait_timeline(self.timeline, target, timeout)
    }

    /// Resets the current slot's command pool and begins recording into its command buffer.
    ///
    /// The caller must have observed `wait_current` return true for this cursor in the current
    /// cycle; recording into a slot twice without submitting is a programmer error.
    pub fn begin_recording(&mut self) -> VkResult<vk::CommandBuffer> {
        let cursor = self.cursor;
        assert!(!self.slots[cursor].recording, "slot {} is already recording", cursor);
        self.queue.reset_commands(self.slots[cursor].pool)?;
        self.queue.begin_commands(self.slots[cursor].cmd)?;
        self.slots[cursor].recording = true;
        Ok(self.slots[cursor].cmd)
    }

    /// Ends recording of the current slot's command buffer.
    pub fn end_recording(&mut self) -> VkResult<()> {
        let cursor = self.cursor;
        assert!(self.slots[cursor].recording, "slot {} is not recording", cursor);
        self.queue.end_commands(self.slots[cursor].cmd)?;
        self.slots[cursor].recording = false;
        Ok(())
    }

    /// Advances the current slot's target by `frames_in_flight` and returns it: the value this
    /// cycle's submission must signal on the timeline.
    pub fn bump_target(&mut self) -> u64 {
        let frames_in_flight = self.slots.len() as u64;
        let slot = &mut self.slots[self.cursor];
        slot.target += frames_in_flight;
        slot.target
    }

    /// A fixed [`SemaphoreState`] at the current slot's target, for handing to other subsystems
    /// that want to observe this slot's completion from any thread.
    ///
    /// Valid once the slot has a submission target, that is after the cycle's `bump_target`.
    pub fn completion_state(&self) -> SemaphoreState {
        SemaphoreState::fixed(self.timeline, self.slots[self.cursor].target)
    }

    /// Moves the cursor to the next slot, modulo `frames_in_flight`.
    pub fn advance(&mut self) {
        self.cursor = (self.cursor + 1) % self.slots.len();
    }

    /// Destroys the ring's command pools and timeline semaphore. The caller must have waited
    /// for the queue to go idle.
    pub fn destroy(&mut self) {
        debug!("destroying frame ring ({} slots)", self.slots.len());
        for slot in self.slots.drain(..) {
            self.queue.destroy_frame_commands(slot.pool);
        }
        if self.timeline != vk::Semaphore::null() {
            self.queue.destroy_semaphore(self.timeline);
            self.timeline = vk::Semaphore::null();
        }
    }
}
