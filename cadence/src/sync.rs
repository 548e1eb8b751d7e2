//! Timeline semaphore states and submission descriptions.
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use ash::{prelude::VkResult, vk};

////////////////////////////////////////////////////////////////////////////////////////////////////

#[derive(Clone, Debug)]
enum SemaphoreValue {
    /// The completion value is already known.
    Fixed(u64),
    /// The completion value will be assigned by a future submission, exactly once.
    /// Zero means "not assigned yet"; clones share the cell and observe the assignment.
    Dynamic(Arc<AtomicU64>),
}

/// A completion point on a timeline semaphore.
///
/// Represents "the timeline has reached value V" as a testable/waitable fact, without requiring
/// the holder to know V up front: a *dynamic* state is handed out before the submission that will
/// signal it has been built, and the orchestrator fills in the value at submit time. States are
/// cheap to clone and can be waited on from any thread.
#[derive(Clone, Debug)]
pub struct SemaphoreState {
    semaphore: vk::Semaphore,
    value: SemaphoreValue,
}

impl SemaphoreState {
    /// Creates a state whose completion value is already known. `value` must be nonzero.
    pub fn fixed(semaphore: vk::Semaphore, value: u64) -> SemaphoreState {
        assert_ne!(value, 0, "fixed semaphore value must be nonzero");
        SemaphoreState {
            semaphore,
            value: SemaphoreValue::Fixed(value),
        }
    }

    /// Creates a state whose completion value will be supplied later via `set_dynamic_value`.
    pub fn dynamic(semaphore: vk::Semaphore) -> SemaphoreState {
        SemaphoreState {
            semaphore,
            value: SemaphoreValue::Dynamic(Arc::new(AtomicU64::new(0))),
        }
    }

    /// The underlying timeline semaphore.
    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    /// Assigns the completion value of a dynamic state.
    ///
    /// Legal exactly once, on a dynamic state, with a nonzero value; anything else is a
    /// programmer error and panics. All clones of the state observe the assignment.
    pub fn set_dynamic_value(&self, value: u64) {
        assert_ne!(value, 0, "dynamic semaphore value must be nonzero");
        match &self.value {
            SemaphoreValue::Dynamic(cell) => {
                cell.compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
                    .expect("dynamic semaphore value assigned twice");
            }
            SemaphoreValue::Fixed(_) => panic!("cannot assign a value to a fixed semaphore state"),
        }
    }

    /// Returns the completion value, or `None` if the state is dynamic and not assigned yet.
    pub fn value(&self) -> Option<u64> {
        match &self.value {
            SemaphoreValue::Fixed(value) => Some(*value),
            SemaphoreValue::Dynamic(cell) => match cell.load(Ordering::Acquire) {
                0 => None,
                value => Some(value),
            },
        }
    }

    /// Blocks until the semaphore reaches the completion value.
    ///
    /// Returns `Ok(false)` without blocking if the state has no value yet, or if `timeout`
    /// expired first. `timeout = None` waits forever.
    pub fn wait(&self, device: &ash::Device, timeout: Option<Duration>) -> VkResult<bool> {
        let value = match self.value() {
            Some(value) => value,
            None => return Ok(false),
        };
        let wait_info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: &self.semaphore,
            p_values: &value,
            ..Default::default()
        };
        let timeout_ns = timeout.map(|t| t.as_nanos() as u64).unwrap_or(u64::MAX);
        match unsafe { device.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Non-blocking poll. Returns `false` if the state has no value yet.
    pub fn is_signaled(&self, device: &ash::Device) -> VkResult<bool> {
        let value = match self.value() {
            Some(value) => value,
            None => return Ok(false),
        };
        let current = unsafe { device.get_semaphore_counter_value(self.semaphore)? };
        Ok(current >= value)
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Describes the kind of semaphore wait operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemaphoreWaitKind {
    /// Binary semaphore wait.
    Binary { semaphore: vk::Semaphore },
    /// Timeline semaphore wait.
    Timeline { semaphore: vk::Semaphore, value: u64 },
}

/// Represents a semaphore wait operation.
#[derive(Copy, Clone, Debug)]
pub struct SemaphoreWait {
    /// The kind of wait operation.
    pub kind: SemaphoreWaitKind,
    /// Destination stage
    pub dst_stage: vk::PipelineStageFlags,
}

/// Describes the kind of semaphore signal operation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SemaphoreSignal {
    /// Binary semaphore signal.
    Binary { semaphore: vk::Semaphore },
    /// Timeline semaphore signal.
    Timeline { semaphore: vk::Semaphore, value: u64 },
}

/// Everything handed to `vkQueueSubmit` as one batched submission.
#[derive(Copy, Clone, Debug)]
pub struct Submission<'a> {
    pub waits: &'a [SemaphoreWait],
    pub signals: &'a [SemaphoreSignal],
    pub command_buffers: &'a [vk::CommandBuffer],
}
