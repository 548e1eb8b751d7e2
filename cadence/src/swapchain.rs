//! The acquire/present boundary.
use std::{ptr, time::Duration};

use ash::{prelude::VkResult, vk};
use tracing::{debug, warn};

use crate::context::Context;

////////////////////////////////////////////////////////////////////////////////////////////////////

/// An image handed out by [`PresentTarget::acquire`], valid for the current frame only.
#[derive(Copy, Clone, Debug)]
pub struct AcquiredImage {
    /// Index of the image in the target's image list.
    pub index: u32,
    pub image: vk::Image,
    pub extent: vk::Extent2D,
    pub format: vk::Format,
}

/// Outcome of an acquire attempt.
#[derive(Copy, Clone, Debug)]
pub enum Acquire {
    Ready(AcquiredImage),
    /// The target is out of date; skip this frame and rebuild before the next one.
    NeedsRebuild,
}

/// The opaque presentation boundary the frame loop drives: acquire an image, present it, and
/// expose the binary semaphores the submission must hook up.
pub trait PresentTarget {
    fn acquire(&mut self, timeout: Duration) -> VkResult<Acquire>;

    /// Binary semaphore signaled when the acquired image is ready to be rendered to.
    fn image_available(&self) -> vk::Semaphore;

    /// Binary semaphore the frame's submission signals and the present waits on.
    fn render_finished(&self) -> vk::Semaphore;

    fn extent(&self) -> vk::Extent2D;

    /// Presents the image. Returns true if the target should be rebuilt (suboptimal or
    /// out of date).
    fn present(&mut self, image_index: u32) -> VkResult<bool>;
}

////////////////////////////////////////////////////////////////////////////////////////////////////

pub struct SwapchainCreateInfo {
    /// The surface to present to. Owned by the caller; destroyed by the caller after the
    /// swapchain.
    pub surface: vk::SurfaceKHR,
    pub size: (u32, u32),
    /// Number of image-available/render-finished semaphore pairs, cycled per presented frame.
    /// Use the ring's frames-in-flight count.
    pub frames_in_flight: usize,
}

struct FrameSemaphores {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
}

/// Represents a swap chain.
pub struct Swapchain {
    context: Context,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    sync: Vec<FrameSemaphores>,
    sync_index: usize,
}

/// Chooses a swapchain surface format among a list of supported formats.
fn get_preferred_surface_format(surface_formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    surface_formats
        .iter()
        .copied()
        .find(|fmt| fmt.format == vk::Format::B8G8R8A8_SRGB && fmt.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR)
        .unwrap_or(surface_formats[0])
}

fn get_preferred_present_mode(present_modes: &[vk::PresentModeKHR]) -> vk::PresentModeKHR {
    if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        // Always available.
        vk::PresentModeKHR::FIFO
    }
}

fn get_preferred_swap_extent(size: (u32, u32), capabilities: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: size.0.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: size.1.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

impl Swapchain {
    /// Creates a swapchain object and its per-frame semaphore pairs.
    pub fn new(context: Context, create_info: &SwapchainCreateInfo) -> Swapchain {
        let surface_formats = unsafe {
            context
                .khr_surface()
                .get_physical_device_surface_formats(context.inner.physical_device, create_info.surface)
                .expect("vkGetPhysicalDeviceSurfaceFormatsKHR failed")
        };
        let format = get_preferred_surface_format(&surface_formats);

        let sync = (0..create_info.frames_in_flight)
            .map(|_| {
                let semaphore_create_info = vk::SemaphoreCreateInfo { ..Default::default() };
                unsafe {
                    FrameSemaphores {
                        image_available: context
                            .raw()
                            .create_semaphore(&semaphore_create_info, None)
                            .expect("vkCreateSemaphore failed"),
                        render_finished: context
                            .raw()
                            .create_semaphore(&semaphore_create_info, None)
                            .expect("vkCreateSemaphore failed"),
                    }
                }
            })
            .collect();

        let mut swapchain = Swapchain {
            context,
            surface: create_info.surface,
            handle: vk::SwapchainKHR::null(),
            format,
            extent: Default::default(),
            images: vec![],
            sync,
            sync_index: 0,
        };
        swapchain.rebuild(create_info.size);
        swapchain
    }

    /// (Re)creates the swapchain for the given window size, chaining `old_swapchain`.
    pub fn rebuild(&mut self, size: (u32, u32)) {
        let phy = self.context.inner.physical_device;
        let capabilities = unsafe {
            self.context
                .khr_surface()
                .get_physical_device_surface_capabilities(phy, self.surface)
                .expect("vkGetPhysicalDeviceSurfaceCapabilitiesKHR failed")
        };
        let present_modes = unsafe {
            self.context
                .khr_surface()
                .get_physical_device_surface_present_modes(phy, self.surface)
                .expect("vkGetPhysicalDeviceSurfacePresentModesKHR failed")
        };

        let present_mode = get_preferred_present_mode(&present_modes);
        let image_extent = get_preferred_swap_extent(size, &capabilities);
        let image_count =
            if capabilities.max_image_count > 0 && capabilities.min_image_count + 1 > capabilities.max_image_count {
                capabilities.max_image_count
            } else {
                capabilities.min_image_count + 1
            };

        let create_info = vk::SwapchainCreateInfoKHR {
            flags: Default::default(),
            surface: self.surface,
            min_image_count: image_count,
            image_format: self.format.format,
            image_color_space: self.format.color_space,
            image_extent,
            image_array_layers: 1,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            queue_family_index_count: 0,
            p_queue_family_indices: ptr::null(),
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain: self.handle,
            ..Default::default()
        };

        unsafe {
            let new_handle = self
                .context
                .khr_swapchain()
                .create_swapchain(&create_info, None)
                .expect("vkCreateSwapchainKHR failed");
            if self.handle != vk::SwapchainKHR::null() {
                self.context.khr_swapchain().destroy_swapchain(self.handle, None);
            }
            self.handle = new_handle;
            self.images = self
                .context
                .khr_swapchain()
                .get_swapchain_images(self.handle)
                .expect("vkGetSwapchainImagesKHR failed");
        }
        self.extent = image_extent;
        debug!(
            "swapchain rebuilt: {}x{}, {} images",
            image_extent.width,
            image_extent.height,
            self.images.len()
        );
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Destroys the swapchain and its semaphores. The surface stays with the caller. The queue
    /// must be idle.
    pub fn destroy(&mut self) {
        unsafe {
            for sync in self.sync.drain(..) {
                self.context.raw().destroy_semaphore(sync.image_available, None);
                self.context.raw().destroy_semaphore(sync.render_finished, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                self.context.khr_swapchain().destroy_swapchain(self.handle, None);
                self.handle = vk::SwapchainKHR::null();
            }
        }
    }
}

impl PresentTarget for Swapchain {
    fn acquire(&mut self, timeout: Duration) -> VkResult<Acquire> {
        let image_available = self.sync[self.sync_index].image_available;
        match unsafe {
            self.context.khr_swapchain().acquire_next_image(
                self.handle,
                timeout.as_nanos() as u64,
                image_available,
                vk::Fence::null(),
            )
        } {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    debug!("acquired suboptimal swapchain image {}", index);
                }
                Ok(Acquire::Ready(AcquiredImage {
                    index,
                    image: self.images[index as usize],
                    extent: self.extent,
                    format: self.format.format,
                }))
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) | Err(vk::Result::TIMEOUT) => Ok(Acquire::NeedsRebuild),
            Err(err) => Err(err),
        }
    }

    fn image_available(&self) -> vk::Semaphore {
        self.sync[self.sync_index].image_available
    }

    fn render_finished(&self) -> vk::Semaphore {
        self.sync[self.sync_index].render_finished
    }

    fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    fn present(&mut self, image_index: u32) -> VkResult<bool> {
        let render_finished = self.sync[self.sync_index].render_finished;
        let present_info = vk::PresentInfoKHR {
            wait_semaphore_count: 1,
            p_wait_semaphores: &render_finished,
            swapchain_count: 1,
            p_swapchains: &self.handle,
            p_image_indices: &image_index,
            p_results: ptr::null_mut(),
            ..Default::default()
        };
        let result = unsafe {
            self.context
                .khr_swapchain()
                .queue_present(self.context.queue(), &present_info)
        };
        // The pair was consumed by this frame's submission and present.
        self.sync_index = (self.sync_index + 1) % self.sync.len();
        match result {
            Ok(suboptimal) => {
                if suboptimal {
                    warn!("suboptimal present, requesting swapchain rebuild");
                }
                Ok(suboptimal)
            }
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(err) => Err(err),
        }
    }
}
