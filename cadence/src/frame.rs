//! The per-frame orchestration loop.
use std::time::Duration;

use ash::{prelude::VkResult, vk};
use tracing::debug;

use crate::{
    context::GpuQueue,
    free_queue::FreeQueue,
    pacer::FramePacer,
    ring::FrameRing,
    swapchain::{Acquire, AcquiredImage, PresentTarget},
    sync::{SemaphoreSignal, SemaphoreState, SemaphoreWait, SemaphoreWaitKind, Submission},
};

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Transient per-frame lists of semaphore operations and command buffers, cleared at the start
/// of each frame and populated both by the loop itself and by element callbacks. Command buffers
/// pushed by callbacks execute before the frame's own command buffer.
#[derive(Default)]
pub struct SubmissionBundle {
    pub waits: Vec<SemaphoreWait>,
    pub signals: Vec<SemaphoreSignal>,
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl SubmissionBundle {
    fn clear(&mut self) {
        self.waits.clear();
        self.signals.clear();
        self.command_buffers.clear();
    }
}

/// Everything a render callback may touch during one frame.
pub struct FrameContext<'a> {
    /// The current slot's command buffer, in the recording state.
    pub cmd: vk::CommandBuffer,
    /// Current ring slot index.
    pub cursor: usize,
    /// Frames submitted so far.
    pub frame_number: u64,
    pub frames_in_flight: usize,
    pub extent: vk::Extent2D,
    /// The acquired swapchain image. `None` in headless mode.
    pub swapchain_image: Option<AcquiredImage>,
    /// Extra waits, signals and command buffers for this frame's submission.
    pub bundle: &'a mut SubmissionBundle,
    /// Deferred-release queue; submit against `cursor`.
    pub free_queue: &'a FreeQueue,
    /// Completion state of this frame's submission; assigned at submit time. Clone it to let
    /// other subsystems wait on this frame from any thread.
    pub signal: SemaphoreState,
}

/// A per-frame application element (scene renderer, UI layer, camera update, ...).
///
/// Elements are notified in attach order; the order is significant and preserved. All hooks
/// default to no-ops.
pub trait AppElement {
    fn on_attach(&mut self) {}
    fn on_detach(&mut self) {}
    /// Invoked only when the viewport size changed since the previous frame.
    fn on_resize(&mut self, _extent: vk::Extent2D) {}
    fn on_ui_menu(&mut self) {}
    fn on_ui_render(&mut self) {}
    fn on_pre_render(&mut self) {}
    fn on_render(&mut self, _frame: &mut FrameContext<'_>) {}
    /// Headless mode only: invoked once, after the final submission's GPU work completed.
    fn on_last_frame(&mut self) {}
}

/// Outcome of one windowed frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameOutcome {
    Rendered,
    /// The frame was skipped (acquire failed) or presented suboptimally; rebuild the present
    /// target before the next frame.
    NeedsRebuild,
}

#[derive(Clone, Debug)]
pub struct FrameLoopCreateInfo {
    /// Number of ring slots. At least 2.
    pub frames_in_flight: usize,
    /// Target refresh rate for [`FrameLoop::pace`], in Hz. `None` disables pacing.
    pub pacing: Option<f32>,
}

impl Default for FrameLoopCreateInfo {
    fn default() -> Self {
        FrameLoopCreateInfo {
            frames_in_flight: 3,
            pacing: None,
        }
    }
}

impl FrameLoopCreateInfo {
    /// The headless configuration: two slots are enough to overlap CPU and GPU when there is
    /// no display stage to pipeline against.
    pub fn headless() -> Self {
        FrameLoopCreateInfo {
            frames_in_flight: 2,
            pacing: None,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Sequences one frame end to end: acquire, wait on the ring slot, drain its free queue,
/// record, submit with semaphores, present, advance.
pub struct FrameLoop<Q: GpuQueue> {
    ring: FrameRing<Q>,
    free_queue: FreeQueue,
    elements: Vec<Box<dyn AppElement>>,
    bundle: SubmissionBundle,
    pacer: FramePacer,
    pacing: Option<f32>,
    frame_number: u64,
    viewport: vk::Extent2D,
}

impl<Q: GpuQueue> FrameLoop<Q> {
    pub fn new(queue: Q, create_info: &FrameLoopCreateInfo) -> FrameLoop<Q> {
        let ring = FrameRing::new(queue, create_info.frames_in_flight);
        let free_queue = FreeQueue::new();
        free_queue.resize(create_info.frames_in_flight);
        FrameLoop {
            ring,
            free_queue,
            elements: vec![],
            bundle: Default::default(),
            pacer: FramePacer::new(),
            pacing: create_info.pacing,
            frame_number: 0,
            viewport: Default::default(),
        }
    }

    /// Appends an element and invokes its `on_attach`. Elements receive per-frame hooks in
    /// attach order.
    pub fn add_element(&mut self, mut element: Box<dyn AppElement>) {
        element.on_attach();
        self.elements.push(element);
    }

    /// Handle to the deferred-release queue, shared with all clones.
    pub fn free_queue(&self) -> FreeQueue {
        self.free_queue.clone()
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn frames_in_flight(&self) -> usize {
        self.ring.frames_in_flight()
    }

    pub fn queue(&self) -> &Q {
        self.ring.queue()
    }

    pub fn set_pacing(&mut self, pacing: Option<f32>) {
        self.pacing = pacing;
    }

    /// Sleeps towards the configured refresh cadence. Call once per loop iteration, before
    /// polling platform events.
    pub fn pace(&mut self) {
        if let Some(refresh_rate) = self.pacing {
            self.pacer.pace(refresh_rate);
        }
    }

    /// Runs one windowed frame against the given present target.
    ///
    /// On [`FrameOutcome::NeedsRebuild`] from a failed acquire the frame is skipped entirely
    /// (nothing waited, recorded or submitted); the caller rebuilds the target and tries again
    /// next iteration.
    pub fn frame(&mut self, target: &mut dyn PresentTarget) -> VkResult<FrameOutcome> {
        let acquired = match target.acquire(Duration::from_secs(1))? {
            Acquire::Ready(acquired) => acquired,
            Acquire::NeedsRebuild => {
                debug!("skipping frame {}: present target needs rebuild", self.frame_number);
                return Ok(FrameOutcome::NeedsRebuild);
            }
        };

        if acquired.extent != self.viewport {
            self.viewport = acquired.extent;
            for element in self.elements.iter_mut() {
                element.on_resize(acquired.extent);
            }
        }

        self.ring.wait_current(None)?;
        self.free_queue.drain(self.ring.cursor());
        let signal_value = self.ring.bump_target();
        let cmd = self.ring.begin_recording()?;

        let signal = SemaphoreState::dynamic(self.ring.timeline());
        self.bundle.clear();
        {
            let Self {
                ref mut elements,
                ref mut bundle,
                ref free_queue,
                ref ring,
                frame_number,
                ..
            } = *self;
            for element in elements.iter_mut() {
                element.on_ui_menu();
            }
            for element in elements.iter_mut() {
                element.on_ui_render();
            }
            for element in elements.iter_mut() {
                element.on_pre_render();
            }
            let mut frame = FrameContext {
                cmd,
                cursor: ring.cursor(),
                frame_number,
                frames_in_flight: ring.frames_in_flight(),
                extent: acquired.extent,
                swapchain_image: Some(acquired),
                bundle,
                free_queue,
                signal: signal.clone(),
            };
            for element in elements.iter_mut() {
                element.on_render(&mut frame);
            }
        }
        self.ring.end_recording()?;

        // The swapchain's binary semaphores and the timeline signal close the submission.
        self.bundle.waits.push(SemaphoreWait {
            kind: SemaphoreWaitKind::Binary {
                semaphore: target.image_available(),
            },
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        });
        self.bundle.signals.push(SemaphoreSignal::Binary {
            semaphore: target.render_finished(),
        });
        signal.set_dynamic_value(signal_value);
        self.bundle.signals.push(SemaphoreSignal::Timeline {
            semaphore: self.ring.timeline(),
            value: signal_value,
        });
        self.bundle.command_buffers.push(cmd);

        self.ring.queue().submit(&Submission {
            waits: &self.bundle.waits,
            signals: &self.bundle.signals,
            command_buffers: &self.bundle.command_buffers,
        })?;

        let suboptimal = target.present(acquired.index)?;

        self.ring.advance();
        self.frame_number += 1;

        if suboptimal {
            Ok(FrameOutcome::NeedsRebuild)
        } else {
            Ok(FrameOutcome::Rendered)
        }
    }

    /// Runs `frames` frames without a present target, then waits for the final submission to
    /// complete on the GPU and invokes `on_last_frame` on every element, once.
    ///
    /// The per-frame hooks are reduced to `on_pre_render` and `on_render`; there is no acquire,
    /// no present and no UI pass.
    pub fn run_headless(&mut self, frames: u64) -> VkResult<()> {
        let mut last_signaled = None;
        for _ in 0..frames {
            self.ring.wait_current(None)?;
            self.free_queue.drain(self.ring.cursor());
            let signal_value = self.ring.bump_target();
            let cmd = self.ring.begin_recording()?;

            let signal = SemaphoreState::dynamic(self.ring.timeline());
            self.bundle.clear();
            {
                let Self {
                    ref mut elements,
                    ref mut bundle,
                    ref free_queue,
                    ref ring,
                    frame_number,
                    ..
                } = *self;
                for element in elements.iter_mut() {
                    element.on_pre_render();
                }
                let mut frame = FrameContext {
                    cmd,
                    cursor: ring.cursor(),
                    frame_number,
                    frames_in_flight: ring.frames_in_flight(),
                    extent: Default::default(),
                    swapchain_image: None,
                    bundle,
                    free_queue,
                    signal: signal.clone(),
                };
                for element in elements.iter_mut() {
                    element.on_render(&mut frame);
                }
            }
            self.ring.end_recording()?;

            signal.set_dynamic_value(signal_value);
            self.bundle.signals.push(SemaphoreSignal::Timeline {
                semaphore: self.ring.timeline(),
                value: signal_value,
            });
            self.bundle.command_buffers.push(cmd);

            self.ring.queue().submit(&Submission {
                waits: &self.bundle.waits,
                signals: &self.bundle.signals,
                command_buffers: &self.bundle.command_buffers,
            })?;

            self.ring.advance();
            self.frame_number += 1;
            last_signaled = Some(signal_value);
        }

        if let Some(value) = last_signaled {
            self.ring.queue().wait_timeline(self.ring.timeline(), value, None)?;
        }
        for element in self.elements.iter_mut() {
            element.on_last_frame();
        }
        Ok(())
    }

    /// Drains to a safe point and destroys the ring: waits for device idle, detaches elements,
    /// runs every pending deferred release, then destroys the per-frame objects.
    pub fn shutdown(&mut self) -> VkResult<()> {
        self.ring.queue().wait_idle()?;
        for element in self.elements.iter_mut() {
            element.on_detach();
        }
        self.free_queue.resize(0);
        self.ring.destroy();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, FakeGpu, FakePresentTarget, Journal};
    use std::sync::{Arc, Mutex};

    /// Counts hook invocations and mirrors them into the shared journal.
    struct Probe {
        journal: Journal,
        renders: Arc<Mutex<u64>>,
        resizes: Arc<Mutex<u64>>,
        last_frames: Arc<Mutex<u64>>,
    }

    impl Probe {
        fn new(journal: Journal) -> Probe {
            Probe {
                journal,
                renders: Default::default(),
                resizes: Default::default(),
                last_frames: Default::default(),
            }
        }
    }

    impl AppElement for Probe {
        fn on_resize(&mut self, _extent: vk::Extent2D) {
            *self.resizes.lock().unwrap() += 1;
        }

        fn on_render(&mut self, _frame: &mut FrameContext<'_>) {
            *self.renders.lock().unwrap() += 1;
            record(&self.journal, "render");
        }

        fn on_last_frame(&mut self) {
            *self.last_frames.lock().unwrap() += 1;
            record(&self.journal, "last_frame");
        }
    }

    fn position(journal: &[String], entry: &str) -> usize {
        journal
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("{:?} not found in {:?}", entry, journal))
    }

    #[test]
    fn headless_runs_exact_frame_count_and_fires_last_frame_once() {
        let gpu = FakeGpu::new(true);
        let mut frame_loop = FrameLoop::new(gpu.clone(), &FrameLoopCreateInfo::headless());
        let probe = Probe::new(gpu.journal());
        let renders = probe.renders.clone();
        let last_frames = probe.last_frames.clone();
        frame_loop.add_element(Box::new(probe));

        frame_loop.run_headless(5).unwrap();

        assert_eq!(*renders.lock().unwrap(), 5);
        assert_eq!(*last_frames.lock().unwrap(), 1);

        // `on_last_frame` must come after the wait on the final submission's timeline value.
        // With 2 slots the 5th frame signals 6 (slot 0's targets are 0, 2, 4, 6).
        let journal = gpu.journal();
        let journal = journal.lock().unwrap();
        assert!(position(&journal, "last_frame") > position(&journal, "wait(6)"));
    }

    #[test]
    fn deferred_free_runs_when_the_slot_comes_around_again() {
        let gpu = FakeGpu::new(true);
        let mut frame_loop = FrameLoop::new(gpu.clone(), &FrameLoopCreateInfo::headless());

        struct FreeOnFirstFrame {
            journal: Journal,
        }
        impl AppElement for FreeOnFirstFrame {
            fn on_render(&mut self, frame: &mut FrameContext<'_>) {
                if frame.frame_number == 0 {
                    let journal = self.journal.clone();
                    frame.free_queue.submit_free(frame.cursor, move || record(&journal, "free"));
                }
            }
        }
        frame_loop.add_element(Box::new(FreeOnFirstFrame { journal: gpu.journal() }));

        frame_loop.run_headless(5).unwrap();

        // Frame 0 ran on slot 0 and signaled 2; slot 0 comes around again on frame 2, whose
        // wait(2) proves the GPU is done. The release must land between that wait and the
        // slot's re-recording.
        let journal = gpu.journal();
        let journal = journal.lock().unwrap();
        let free = position(&journal, "free");
        let wait = position(&journal, "wait(2)");
        assert!(free > wait, "released before the proving wait: {:?}", *journal);
        let next_begin = journal[free..]
            .iter()
            .position(|e| e.starts_with("begin("))
            .map(|offset| free + offset)
            .expect("no begin after the release");
        assert!(
            journal[wait..next_begin].iter().any(|e| e == "free"),
            "release did not happen before the slot was re-recorded: {:?}",
            *journal
        );
    }

    #[test]
    fn windowed_frame_sequences_acquire_wait_record_submit_present() {
        let gpu = FakeGpu::new(true);
        let mut frame_loop = FrameLoop::new(gpu.clone(), &FrameLoopCreateInfo::default());
        let probe = Probe::new(gpu.journal());
        let renders = probe.renders.clone();
        frame_loop.add_element(Box::new(probe));
        let mut target = FakePresentTarget::new(gpu.journal());

        for _ in 0..3 {
            assert_eq!(frame_loop.frame(&mut target), Ok(FrameOutcome::Rendered));
        }
        assert_eq!(*renders.lock().unwrap(), 3);
        assert_eq!(frame_loop.frame_number(), 3);

        let journal = gpu.journal();
        let journal = journal.lock().unwrap();
        // First frame: acquire precedes the slot wait, recording precedes submit, submit
        // precedes present.
        let acquire = position(&journal, "acquire(0)");
        let wait = position(&journal, "wait(0)");
        let render = position(&journal, "render");
        // 1 binary wait, 1 binary + 1 timeline signal, signaling value 3 on slot 0.
        let submit = position(&journal, "submit(waits=1,signals=2,timeline=[3])");
        let present = position(&journal, "present(0)");
        assert!(acquire < wait && wait < render && render < submit && submit < present);
    }

    #[test]
    fn failed_acquire_skips_the_frame_and_requests_rebuild() {
        let gpu = FakeGpu::new(true);
        let mut frame_loop = FrameLoop::new(gpu.clone(), &FrameLoopCreateInfo::default());
        let probe = Probe::new(gpu.journal());
        let renders = probe.renders.clone();
        frame_loop.add_element(Box::new(probe));
        let mut target = FakePresentTarget::new(gpu.journal());
        target.rebuild = true;

        assert_eq!(frame_loop.frame(&mut target), Ok(FrameOutcome::NeedsRebuild));
        assert_eq!(*renders.lock().unwrap(), 0);
        assert_eq!(frame_loop.frame_number(), 0);
        let journal = gpu.journal();
        assert!(
            !journal.lock().unwrap().iter().any(|e| e.starts_with("submit(")),
            "a skipped frame must not submit"
        );

        // Rebuilt: the next frame renders normally.
        target.rebuild = false;
        assert_eq!(frame_loop.frame(&mut target), Ok(FrameOutcome::Rendered));
        assert_eq!(*renders.lock().unwrap(), 1);
    }

    #[test]
    fn resize_hook_fires_only_on_viewport_change() {
        let gpu = FakeGpu::new(true);
        let mut frame_loop = FrameLoop::new(gpu.clone(), &FrameLoopCreateInfo::default());
        let probe = Probe::new(gpu.journal());
        let resizes = probe.resizes.clone();
        frame_loop.add_element(Box::new(probe));
        let mut target = FakePresentTarget::new(gpu.journal());

        frame_loop.frame(&mut target).unwrap();
        frame_loop.frame(&mut target).unwrap();
        assert_eq!(*resizes.lock().unwrap(), 1, "initial size change only");

        target.extent = vk::Extent2D {
            width: 1280,
            height: 720,
        };
        frame_loop.frame(&mut target).unwrap();
        assert_eq!(*resizes.lock().unwrap(), 2);
    }

    #[test]
    fn shutdown_drains_the_free_queue_after_idle() {
        let gpu = FakeGpu::new(true);
        let mut frame_loop = FrameLoop::new(gpu.clone(), &FrameLoopCreateInfo::headless());
        frame_loop.run_headless(1).unwrap();

        let journal = gpu.journal();
        {
            let journal = journal.clone();
            frame_loop
                .free_queue()
                .submit_free(1, move || record(&journal, "late free"));
        }
        frame_loop.shutdown().unwrap();

        let journal = journal.lock().unwrap();
        let idle = position(&journal, "wait_idle");
        let free = position(&journal, "late free");
        assert!(idle < free, "teardown released before device idle: {:?}", *journal);
        assert_eq!(position(&journal, "destroy_timeline"), journal.len() - 1);

        // After teardown the queue is gone; further submissions release immediately.
        assert!(frame_loop.free_queue().is_empty());
    }
}
