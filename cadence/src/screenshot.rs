//! Swapchain image readback.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme},
    MemoryLocation,
};
use tracing::{debug, error};

use crate::{
    context::Context,
    error::Error,
    frame::{AppElement, FrameContext},
    swapchain::AcquiredImage,
};

struct Pending {
    path: PathBuf,
    /// Frame number at which the capture is honored; armed on the first frame that sees the
    /// request, one full ring cycle later.
    due: Option<u64>,
}

/// Clonable handle used to ask for a screenshot from anywhere.
#[derive(Clone, Default)]
pub struct ScreenshotRequest {
    pending: Arc<Mutex<Option<Pending>>>,
}

impl ScreenshotRequest {
    /// Requests that an upcoming frame be written to `path` (format chosen by extension,
    /// typically PNG).
    ///
    /// The capture is honored only after a full ring cycle has elapsed, so transient state from
    /// the request itself (a file dialog, a menu) is not in the captured image. A request made
    /// while one is pending replaces it.
    pub fn capture(&self, path: impl Into<PathBuf>) {
        let mut pending = self.pending.lock().expect("failed to lock screenshot request");
        *pending = Some(Pending {
            path: path.into(),
            due: None,
        });
    }

    pub fn is_pending(&self) -> bool {
        self.pending.lock().expect("failed to lock screenshot request").is_some()
    }
}

/// Frame loop element that records swapchain readbacks for pending [`ScreenshotRequest`]s.
///
/// Attach it after the element that finishes the frame: it expects the swapchain image to be in
/// `PRESENT_SRC_KHR` layout when its `on_render` runs, and returns it to that layout.
pub struct ScreenshotElement {
    context: Context,
    request: ScreenshotRequest,
}

impl ScreenshotElement {
    pub fn new(context: Context) -> (ScreenshotElement, ScreenshotRequest) {
        let request = ScreenshotRequest::default();
        (
            ScreenshotElement {
                context,
                request: request.clone(),
            },
            request,
        )
    }
}

impl AppElement for ScreenshotElement {
    fn on_render(&mut self, frame: &mut FrameContext<'_>) {
        let image = match frame.swapchain_image {
            Some(image) => image,
            None => return,
        };

        let path = {
            let mut pending = self.request.pending.lock().expect("failed to lock screenshot request");
            match pending.as_mut() {
                None => return,
                Some(entry) => match entry.due {
                    None => {
                        entry.due = Some(frame.frame_number + frame.frames_in_flight as u64);
                        return;
                    }
                    Some(due) if frame.frame_number < due => return,
                    Some(_) => pending.take().expect("pending screenshot vanished").path,
                },
            }
        };

        debug!("recording screenshot readback on frame {}", frame.frame_number);
        let readback = record_readback(&self.context, frame.cmd, &image);

        // The free queue runs this only once the GPU has finished the copy: the same wait that
        // makes the slot reusable proves the readback buffer contents are complete.
        frame.free_queue.submit_free(frame.cursor, move || {
            if let Err(err) = readback.finish(&path) {
                error!("failed to write screenshot to {:?}: {}", path, err);
            }
        });
    }
}

////////////////////////////////////////////////////////////////////////////////////////////////////

/// A host-visible buffer holding one copied swapchain image.
struct ReadbackBuffer {
    context: Context,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    width: u32,
    height: u32,
    swizzle_bgra: bool,
}

const COLOR_SUBRESOURCE_RANGE: vk::ImageSubresourceRange = vk::ImageSubresourceRange {
    aspect_mask: vk::ImageAspectFlags::COLOR,
    base_mip_level: 0,
    level_count: 1,
    base_array_layer: 0,
    layer_count: 1,
};

/// Records a copy of `image` into a fresh host-visible buffer on `cmd`, transitioning the image
/// out of and back to `PRESENT_SRC_KHR`.
fn record_readback(context: &Context, cmd: vk::CommandBuffer, image: &AcquiredImage) -> ReadbackBuffer {
    let width = image.extent.width;
    let height = image.extent.height;
    let byte_size = width as u64 * height as u64 * 4;
    let device = context.raw();

    let buffer_create_info = vk::BufferCreateInfo {
        size: byte_size,
        usage: vk::BufferUsageFlags::TRANSFER_DST,
        sharing_mode: vk::SharingMode::EXCLUSIVE,
        ..Default::default()
    };
    let buffer = unsafe {
        device
            .create_buffer(&buffer_create_info, None)
            .expect("failed to create readback buffer")
    };
    let mem_req = unsafe { device.get_buffer_memory_requirements(buffer) };
    let allocation = context
        .inner
        .allocator
        .lock()
        .expect("failed to lock allocator")
        .allocate(&AllocationCreateDesc {
            name: "screenshot readback",
            requirements: mem_req,
            location: MemoryLocation::GpuToCpu,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
        .expect("failed to allocate readback memory");
    unsafe {
        device
            .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
            .expect("vkBindBufferMemory failed");
    }

    unsafe {
        let to_transfer = vk::ImageMemoryBarrier2 {
            src_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            src_access_mask: vk::AccessFlags2::MEMORY_WRITE,
            dst_stage_mask: vk::PipelineStageFlags2::COPY,
            dst_access_mask: vk::AccessFlags2::TRANSFER_READ,
            old_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: image.image,
            subresource_range: COLOR_SUBRESOURCE_RANGE,
            ..Default::default()
        };
        device.cmd_pipeline_barrier2(
            cmd,
            &vk::DependencyInfo {
                image_memory_barrier_count: 1,
                p_image_memory_barriers: &to_transfer,
                ..Default::default()
            },
        );

        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: Default::default(),
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        device.cmd_copy_image_to_buffer(cmd, image.image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, buffer, &[region]);

        let to_present = vk::ImageMemoryBarrier2 {
            src_stage_mask: vk::PipelineStageFlags2::COPY,
            src_access_mask: vk::AccessFlags2::TRANSFER_READ,
            dst_stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            dst_access_mask: vk::AccessFlags2::MEMORY_READ,
            old_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            image: image.image,
            subresource_range: COLOR_SUBRESOURCE_RANGE,
            ..Default::default()
        };
        device.cmd_pipeline_barrier2(
            cmd,
            &vk::DependencyInfo {
                image_memory_barrier_count: 1,
                p_image_memory_barriers: &to_present,
                ..Default::default()
            },
        );
    }

    ReadbackBuffer {
        context: context.clone(),
        buffer,
        allocation: Some(allocation),
        width,
        height,
        swizzle_bgra: matches!(
            image.format,
            vk::Format::B8G8R8A8_SRGB | vk::Format::B8G8R8A8_UNORM
        ),
    }
}

impl ReadbackBuffer {
    /// Copies the pixels out, releases the buffer, and encodes to `path`. Call only after the
    /// GPU has finished the recorded copy.
    fn finish(mut self, path: &Path) -> Result<(), Error> {
        let byte_size = self.width as usize * self.height as usize * 4;
        let mut pixels = {
            let allocation = self.allocation.as_ref().expect("readback buffer already released");
            let mapped = allocation.mapped_slice().expect("readback buffer is not host visible");
            mapped[..byte_size].to_vec()
        };
        self.release();

        if self.swizzle_bgra {
            for pixel in pixels.chunks_exact_mut(4) {
                pixel.swap(0, 2);
            }
        }
        image::save_buffer(path, &pixels, self.width, self.height, image::ColorType::Rgba8)?;
        debug!("wrote screenshot to {:?}", path);
        Ok(())
    }

    fn release(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            unsafe {
                self.context.raw().destroy_buffer(self.buffer, None);
            }
            self.context
                .inner
                .allocator
                .lock()
                .expect("failed to lock allocator")
                .free(allocation)
                .expect("failed to free readback memory");
        }
    }
}

impl Drop for ReadbackBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_replaces_pending_capture() {
        let request = ScreenshotRequest::default();
        assert!(!request.is_pending());
        request.capture("a.png");
        request.capture("b.png");
        assert!(request.is_pending());
        let pending = request.pending.lock().unwrap().take().unwrap();
        assert_eq!(pending.path, PathBuf::from("b.png"));
        assert_eq!(pending.due, None);
    }
}
