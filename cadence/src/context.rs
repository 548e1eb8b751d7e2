//! Access to the externally created device and queue.
use std::{
    fmt,
    os::raw::c_void,
    sync::{Arc, Mutex},
    time::Duration,
};

use ash::{extensions::khr, prelude::VkResult, vk};

use crate::sync::{SemaphoreSignal, SemaphoreWaitKind, Submission};

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Device and queue operations performed by the frame loop and the resource ring.
///
/// The production implementation is [`Context`], over ash. Tests implement it with an
/// instrumented double that records call ordering instead of talking to a device.
///
/// Creation and destruction never fail observably: an error from the underlying calls has no
/// sensible recovery and aborts with the failing call named. Per-frame operations return
/// `VkResult` so the loop can propagate device loss.
pub trait GpuQueue {
    /// Creates a timeline semaphore starting at `initial_value`.
    fn create_timeline_semaphore(&self, initial_value: u64) -> vk::Semaphore;

    /// Creates one ring slot's command pool and its single primary command buffer.
    fn create_frame_commands(&self) -> (vk::CommandPool, vk::CommandBuffer);

    /// Blocks until the timeline reaches `value`, or `timeout` expires (`None` = forever).
    /// Returns whether the value was reached.
    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout: Option<Duration>) -> VkResult<bool>;

    /// Resets a slot's command pool, recycling the recorded commands of its buffer.
    fn reset_commands(&self, pool: vk::CommandPool) -> VkResult<()>;

    /// Begins recording a slot's command buffer (one-time submit).
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    /// Ends recording a slot's command buffer.
    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()>;

    /// Submits all accumulated command buffers and semaphore operations as one batch.
    fn submit(&self, submission: &Submission<'_>) -> VkResult<()>;

    /// Waits until the device is idle. Teardown only.
    fn wait_idle(&self) -> VkResult<()>;

    fn destroy_frame_commands(&self, pool: vk::CommandPool);

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// Everything the consuming layer hands over. This crate does not select or create the
/// physical/logical device; the caller keeps ownership of instance and device and destroys
/// them after [`Context`] is dropped.
pub struct ContextCreateInfo {
    pub entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    pub queue: vk::Queue,
    pub queue_family_index: u32,
}

pub(crate) struct ContextInner {
    pub(crate) device: ash::Device,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) queue: vk::Queue,
    pub(crate) queue_family_index: u32,
    pub(crate) vk_khr_swapchain: khr::Swapchain,
    pub(crate) vk_khr_surface: khr::Surface,
    pub(crate) allocator: Mutex<gpu_allocator::vulkan::Allocator>,
}

/// Wrapper around the externally created vulkan device and the queue driving the frame loop.
///
/// Cheap to clone; clones share the device. `Send + Sync` so that deferred release closures
/// capturing a `Context` may be submitted from other threads.
#[derive(Clone)]
pub struct Context {
    pub(crate) inner: Arc<ContextInner>,
}

impl Context {
    pub fn new(create_info: ContextCreateInfo) -> Context {
        let allocator_create_desc = gpu_allocator::vulkan::AllocatorCreateDesc {
            physical_device: create_info.physical_device,
            debug_settings: Default::default(),
            device: create_info.device.clone(),     // not cheap!
            instance: create_info.instance.clone(), // not cheap!
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        };
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&allocator_create_desc).expect("failed to create GPU allocator");

        let vk_khr_swapchain = khr::Swapchain::new(&create_info.instance, &create_info.device);
        let vk_khr_surface = khr::Surface::new(&create_info.entry, &create_info.instance);

        Context {
            inner: Arc::new(ContextInner {
                device: create_info.device,
                physical_device: create_info.physical_device,
                queue: create_info.queue,
                queue_family_index: create_info.queue_family_index,
                vk_khr_swapchain,
                vk_khr_surface,
                allocator: Mutex::new(allocator),
            }),
        }
    }

    pub fn raw(&self) -> &ash::Device {
        &self.inner.device
    }

    pub fn queue(&self) -> vk::Queue {
        self.inner.queue
    }

    pub fn queue_family_index(&self) -> u32 {
        self.inner.queue_family_index
    }

    pub fn khr_swapchain(&self) -> &khr::Swapchain {
        &self.inner.vk_khr_swapchain
    }

    pub fn khr_surface(&self) -> &khr::Surface {
        &self.inner.vk_khr_surface
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context").finish()
    }
}

impl GpuQueue for Context {
    fn create_timeline_semaphore(&self, initial_value: u64) -> vk::Semaphore {
        let timeline_create_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value,
            ..Default::default()
        };
        let semaphore_create_info = vk::SemaphoreCreateInfo {
            p_next: &timeline_create_info as *const _ as *const c_void,
            ..Default::default()
        };
        unsafe {
            self.raw()
                .create_semaphore(&semaphore_create_info, None)
                .expect("vkCreateSemaphore failed")
        }
    }

    fn create_frame_commands(&self) -> (vk::CommandPool, vk::CommandBuffer) {
        let pool_create_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: self.inner.queue_family_index,
            ..Default::default()
        };
        let pool = unsafe {
            self.raw()
                .create_command_pool(&pool_create_info, None)
                .expect("vkCreateCommandPool failed")
        };
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe {
            self.raw()
                .allocate_command_buffers(&allocate_info)
                .expect("vkAllocateCommandBuffers failed")
        };
        (pool, buffers[0])
    }

    fn wait_timeline(&self, semaphore: vk::Semaphore, value: u64, timeout: Option<Duration>) -> VkResult<bool> {
        let wait_info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: &semaphore,
            p_values: &value,
            ..Default::default()
        };
        let timeout_ns = timeout.map(|t| t.as_nanos() as u64).unwrap_or(u64::MAX);
        match unsafe { self.raw().wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn reset_commands(&self, pool: vk::CommandPool) -> VkResult<()> {
        unsafe { self.raw().reset_command_pool(pool, vk::CommandPoolResetFlags::empty()) }
    }

    fn begin_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.raw().begin_command_buffer(
                cmd,
                &vk::CommandBufferBeginInfo {
                    flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
                    ..Default::default()
                },
            )
        }
    }

    fn end_commands(&self, cmd: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.raw().end_command_buffer(cmd) }
    }

    fn submit(&self, submission: &Submission<'_>) -> VkResult<()> {
        let mut wait_semaphores = Vec::new();
        let mut wait_semaphore_values = Vec::new();
        let mut wait_semaphore_dst_stages = Vec::new();
        for wait in submission.waits {
            wait_semaphore_dst_stages.push(wait.dst_stage);
            match wait.kind {
                SemaphoreWaitKind::Binary { semaphore } => {
                    wait_semaphores.push(semaphore);
                    wait_semaphore_values.push(0);
                }
                SemaphoreWaitKind::Timeline { semaphore, value } => {
                    wait_semaphores.push(semaphore);
                    wait_semaphore_values.push(value);
                }
            }
        }

        let mut signal_semaphores = Vec::new();
        let mut signal_semaphore_values = Vec::new();
        for signal in submission.signals {
            match *signal {
                SemaphoreSignal::Binary { semaphore } => {
                    signal_semaphores.push(semaphore);
                    signal_semaphore_values.push(0);
                }
                SemaphoreSignal::Timeline { semaphore, value } => {
                    signal_semaphores.push(semaphore);
                    signal_semaphore_values.push(value);
                }
            }
        }

        let timeline_submit_info = vk::TimelineSemaphoreSubmitInfo {
            wait_semaphore_value_count: wait_semaphore_values.len() as u32,
            p_wait_semaphore_values: wait_semaphore_values.as_ptr(),
            signal_semaphore_value_count: signal_semaphore_values.len() as u32,
            p_signal_semaphore_values: signal_semaphore_values.as_ptr(),
            ..Default::default()
        };
        let submit_info = vk::SubmitInfo {
            p_next: &timeline_submit_info as *const _ as *const c_void,
            wait_semaphore_count: wait_semaphores.len() as u32,
            p_wait_semaphores: wait_semaphores.as_ptr(),
            p_wait_dst_stage_mask: wait_semaphore_dst_stages.as_ptr(),
            command_buffer_count: submission.command_buffers.len() as u32,
            p_command_buffers: submission.command_buffers.as_ptr(),
            signal_semaphore_count: signal_semaphores.len() as u32,
            p_signal_semaphores: signal_semaphores.as_ptr(),
            ..Default::default()
        };

        unsafe { self.raw().queue_submit(self.inner.queue, &[submit_info], vk::Fence::null()) }
    }

    fn wait_idle(&self) -> VkResult<()> {
        unsafe { self.raw().device_wait_idle() }
    }

    fn destroy_frame_commands(&self, pool: vk::CommandPool) {
        unsafe { self.raw().destroy_command_pool(pool, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.raw().destroy_semaphore(semaphore, None) }
    }
}
