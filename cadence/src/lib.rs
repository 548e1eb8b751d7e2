//! Per-frame CPU/GPU synchronization for Vulkan applications.
//!
//! The crate coordinates a fixed ring of frames in flight over a single timeline semaphore:
//! [`FrameRing`] owns the per-slot command pools and the timeline, [`FrameLoop`] sequences a
//! frame end to end (acquire, slot wait, deferred releases, recording, batched submit, present),
//! [`FreeQueue`] delays resource destruction until the ring proves the GPU is done, and
//! [`SemaphoreState`] makes "this frame's work completed" a cheap, clonable, waitable fact.
//!
//! Device and instance creation stay with the caller; hand them over through
//! [`ContextCreateInfo`].
pub mod context;
pub mod error;
pub mod frame;
pub mod free_queue;
pub mod pacer;
pub mod ring;
pub mod screenshot;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
mod testing;

pub use ash::{self, vk};

pub use context::{Context, ContextCreateInfo, GpuQueue};
pub use error::Error;
pub use frame::{AppElement, FrameContext, FrameLoop, FrameLoopCreateInfo, FrameOutcome, SubmissionBundle};
pub use free_queue::FreeQueue;
pub use pacer::{slowest_refresh_rate, FramePacer, FALLBACK_REFRESH_RATE};
pub use ring::FrameRing;
pub use screenshot::{ScreenshotElement, ScreenshotRequest};
pub use swapchain::{Acquire, AcquiredImage, PresentTarget, Swapchain, SwapchainCreateInfo};
pub use sync::{SemaphoreSignal, SemaphoreState, SemaphoreWait, SemaphoreWaitKind, Submission};
