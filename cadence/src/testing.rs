//! Instrumented doubles for exercising the frame loop without a device.
//!
//! `FakeGpu` implements [`GpuQueue`] over an atomic counter standing in for the timeline
//! semaphore, and appends every call to a shared journal so tests can assert call ordering.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use ash::{
    prelude::VkResult,
    vk::{self, Handle},
};

use crate::{
    context::GpuQueue,
    swapchain::{Acquire, AcquiredImage, PresentTarget},
    sync::{SemaphoreSignal, Submission},
};

pub(crate) type Journal = Arc<Mutex<Vec<String>>>;

pub(crate) fn record(journal: &Journal, entry: impl Into<String>) {
    journal.lock().unwrap().push(entry.into());
}

struct FakeGpuInner {
    /// Completed timeline value, the stand-in for the GPU-side counter.
    completed: AtomicU64,
    next_slot: AtomicU64,
    /// When set, submissions complete their timeline signals instantly and waits never block.
    auto_complete: bool,
    journal: Journal,
}

#[derive(Clone)]
pub(crate) struct FakeGpu {
    inner: Arc<FakeGpuInner>,
}

impl FakeGpu {
    pub(crate) fn new(auto_complete: bool) -> FakeGpu {
        FakeGpu {
            inner: Arc::new(FakeGpuInner {
                completed: AtomicU64::new(0),
                next_slot: AtomicU64::new(0),
                auto_complete,
                journal: Default::default(),
            }),
        }
    }

    pub(crate) fn journal(&self) -> Journal {
        self.inner.journal.clone()
    }

    /// Simulates the GPU completing work up to `value`.
    pub(crate) fn signal(&self, value: u64) {
        self.inner.completed.fetch_max(value, Ordering::SeqCst);
    }

    pub(crate) fn completed(&self) -> u64 {
        self.inner.completed.load(Ordering::SeqCst)
    }
}

impl GpuQueue for FakeGpu {
    fn create_timeline_semaphore(&self, initial_value: u64) -> vk::Semaphore {
        self.inner.completed.store(initial_value, Ordering::SeqCst);
        record(&self.inner.journal, format!("timeline(init={})", initial_value));
        vk::Semaphore::from_raw(1)
    }

    fn create_frame_commands(&self) -> (vk::CommandPool, vk::CommandBuffer) {
        let slot = self.inner.next_slot.fetch_add(1, Ordering::SeqCst);
        (
            vk::CommandPool::from_raw(slot + 1),
            vk::CommandBuffer::from_raw(slot + 1),
        )
    }

    fn wait_timeline(&self, _semaphore: vk::Semaphore, value: u64, timeout: Option<Duration>) -> VkResult<bool> {
        let mut ready = self.completed() >= value;
        if !ready && self.inner.auto_complete {
            self.signal(value);
            ready = true;
        }
        record(
            &self.inner.journal,
            if ready {
                format!("wait({})", value)
            } else {
                format!("poll({})", value)
            },
        );
        if !ready && timeout.is_none() {
            panic!("wait_timeline(value = {}) would block forever", value);
        }
        Ok(ready)
    }

    fn reset_commands(&self, pool: vk::CommandPool) -> VkResult<()> {
        record(&self.inner.journal, format!("reset(p{})", pool.as_raw()));
        Ok(())
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        record(&self.inner.journal, format!("begin(c{})", cmd.as_raw()));
        Ok(())
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        record(&self.inner.journal, format!("end(c{})", cmd.as_raw()));
        Ok(())
    }

    fn submit(&self, submission: &Submission<'_>) -> VkResult<()> {
        let mut timeline_values = Vec::new();
        for signal in submission.signals {
            if let SemaphoreSignal::Timeline { value, .. } = signal {
                timeline_values.push(*value);
            }
        }
        record(
            &self.inner.journal,
            format!(
                "submit(waits={},signals={},timeline={:?})",
                submission.waits.len(),
                submission.signals.len(),
                timeline_values
            ),
        );
        if self.inner.auto_complete {
            for value in timeline_values {
                self.signal(value);
            }
        }
        Ok(())
    }

    fn wait_idle(&self) -> VkResult<()> {
        record(&self.inner.journal, "wait_idle");
        Ok(())
    }

    fn destroy_frame_commands(&self, pool: vk::CommandPool) {
        record(&self.inner.journal, format!("destroy_pool(p{})", pool.as_raw()));
    }

    fn destroy_semaphore(&self, _semaphore: vk::Semaphore) {
        record(&self.inner.journal, "destroy_timeline");
    }
}

/// A present target that never talks to a device: acquire always hands out image 0, or reports
/// a rebuild while `rebuild` is set.
pub(crate) struct FakePresentTarget {
    pub(crate) journal: Journal,
    pub(crate) rebuild: bool,
    pub(crate) extent: vk::Extent2D,
}

impl FakePresentTarget {
    pub(crate) fn new(journal: Journal) -> FakePresentTarget {
        FakePresentTarget {
            journal,
            rebuild: false,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
        }
    }
}

impl PresentTarget for FakePresentTarget {
    fn acquire(&mut self, _timeout: Duration) -> VkResult<Acquire> {
        if self.rebuild {
            record(&self.journal, "acquire->rebuild");
            return Ok(Acquire::NeedsRebuild);
        }
        record(&self.journal, "acquire(0)");
        Ok(Acquire::Ready(AcquiredImage {
            index: 0,
            image: vk::Image::from_raw(900),
            extent: self.extent,
            format: vk::Format::B8G8R8A8_SRGB,
        }))
    }

    fn image_available(&self) -> vk::Semaphore {
        vk::Semaphore::from_raw(101)
    }

    fn render_finished(&self) -> vk::Semaphore {
        vk::Semaphore::from_raw(102)
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn present(&mut self, image_index: u32) -> VkResult<bool> {
        record(&self.journal, format!("present({})", image_index));
        Ok(false)
    }
}
