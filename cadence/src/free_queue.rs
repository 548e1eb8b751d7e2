//! Deferred resource release.
use std::{
    mem,
    sync::{Arc, Mutex},
};

use tracing::debug;

type FreeCallback = Box<dyn FnOnce() + Send>;

/// Per-ring-slot lists of release callbacks.
///
/// Any subsystem may hand over ownership of a GPU resource for deletion at a point guaranteed
/// safe: a callback submitted while ring slot `i` is current runs only when slot `i` next comes
/// around, after the frame loop has waited on that slot's timeline target and therefore proven
/// the GPU is done with everything submitted during the slot's previous use.
///
/// The handle is cheap to clone; all clones share the same sub-queues. Captured resources must
/// be *moved* into the callback, the queue is their sole owner between submission and execution.
#[derive(Clone, Default)]
pub struct FreeQueue {
    slots: Arc<Mutex<Vec<Vec<FreeCallback>>>>,
}

impl FreeQueue {
    pub fn new() -> FreeQueue {
        Default::default()
    }

    /// Number of sub-queues (= frames in flight, or 0 after teardown).
    pub fn len(&self) -> usize {
        self.slots.lock().expect("failed to lock free queue").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `callback` to sub-queue `cursor`.
    ///
    /// If `cursor` is out of range (the queue was resized to zero at teardown), the callback is
    /// invoked immediately instead of queued.
    pub fn submit_free(&self, cursor: usize, callback: impl FnOnce() + Send + 'static) {
        let mut slots = self.slots.lock().expect("failed to lock free queue");
        match slots.get_mut(cursor) {
            Some(slot) => slot.push(Box::new(callback)),
            None => {
                // Teardown fallback: nothing is in flight anymore, release right away.
                drop(slots);
                callback();
            }
        }
    }

    /// Invokes and removes every callback of sub-queue `cursor`, in insertion order.
    ///
    /// Called exactly once per frame, for the cursor about to be reused, strictly after the
    /// timeline wait for that same cursor. Panics if `cursor` is out of range.
    pub fn drain(&self, cursor: usize) {
        let pending = {
            let mut slots = self.slots.lock().expect("failed to lock free queue");
            mem::take(&mut slots[cursor])
        };
        if !pending.is_empty() {
            debug!("releasing {} deferred resources for slot {}", pending.len(), cursor);
        }
        // Run outside the lock so a callback may submit further frees.
        for callback in pending {
            callback();
        }
    }

    /// Changes the number of sub-queues.
    ///
    /// Used both to initialize (length = frames in flight) and to tear down (length = 0).
    /// Shrinking runs every pending callback of the dropped sub-queues; the caller must have
    /// waited for device idle first.
    pub fn resize(&self, new_len: usize) {
        let dropped: Vec<FreeCallback> = {
            let mut slots = self.slots.lock().expect("failed to lock free queue");
            if new_len < slots.len() {
                slots.drain(new_len..).flatten().collect()
            } else {
                slots.resize_with(new_len, Vec::new);
                Vec::new()
            }
        };
        if !dropped.is_empty() {
            debug!("releasing {} deferred resources at teardown", dropped.len());
        }
        for callback in dropped {
            callback();
        }
    }
}
