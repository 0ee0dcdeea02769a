// Swapchain - Window presentation
//
// Owns the chain of presentable images, their views and a matching depth
// buffer. Never patched in place: a resize or an incompatible surface means
// destroy everything and create again.

use ash::vk;
use log::{debug, info, warn};

use super::gpu::{Gpu, SwapchainDesc};
use crate::error::{RenderError, RenderResult};
use crate::frame::MAX_FRAMES_IN_FLIGHT;

/// What we would like the surface to give us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapchainPreferences {
    pub format: vk::Format,
    pub color_space: vk::ColorSpaceKHR,
    pub present_mode: vk::PresentModeKHR,
    /// Tried in order; the first one the device supports is used.
    pub depth_formats: Vec<vk::Format>,
}

impl Default for SwapchainPreferences {
    fn default() -> Self {
        Self {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            present_mode: vk::PresentModeKHR::MAILBOX,
            depth_formats: vec![
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
        }
    }
}

/// Depth attachment shared by every swapchain image.
#[derive(Debug, Clone, Copy)]
pub struct DepthBuffer {
    pub format: vk::Format,
    pub image: vk::Image,
    pub view: vk::ImageView,
}

impl DepthBuffer {
    pub fn aspect(&self) -> vk::ImageAspectFlags {
        depth_aspect(self.format)
    }
}

fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

pub struct Swapchain {
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    depth: DepthBuffer,
    max_frames_in_flight: usize,
    preferences: SwapchainPreferences,
}

impl Swapchain {
    pub fn create<G: Gpu>(
        gpu: &G,
        width: u32,
        height: u32,
        preferences: SwapchainPreferences,
    ) -> RenderResult<Self> {
        // Negotiate everything before creating anything
        let caps = gpu.surface_capabilities()?;
        let format = choose_surface_format(&gpu.surface_formats()?, &preferences)?;
        let present_mode =
            choose_present_mode(&gpu.surface_present_modes()?, preferences.present_mode);
        let extent = choose_extent(&caps, width, height);
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::InvalidSize {
                width: extent.width,
                height: extent.height,
            });
        }
        let image_count = choose_image_count(&caps);
        let depth_format = choose_depth_format(gpu, &preferences.depth_formats)?;

        info!(
            "Creating swapchain: {}x{} (requested {}x{}), {:?}, {:?}, {} images",
            extent.width, extent.height, width, height, format.format, present_mode, image_count
        );

        let mut swapchain = Self {
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            image_views: Vec::new(),
            format,
            present_mode,
            extent,
            depth: DepthBuffer {
                format: depth_format,
                image: vk::Image::null(),
                view: vk::ImageView::null(),
            },
            max_frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            preferences,
        };

        let desc = SwapchainDesc {
            image_count,
            format,
            extent,
            present_mode,
            pre_transform: caps.current_transform,
        };
        if let Err(e) = swapchain.allocate(gpu, &desc) {
            warn!("Swapchain creation failed, releasing partial resources: {}", e);
            swapchain.release(gpu);
            return Err(e);
        }

        debug!("Swapchain ready with {} images", swapchain.images.len());
        Ok(swapchain)
    }

    fn allocate<G: Gpu>(&mut self, gpu: &G, desc: &SwapchainDesc) -> RenderResult<()> {
        self.handle = gpu.create_swapchain(desc)?;
        self.images = gpu.swapchain_images(self.handle)?;

        for &image in &self.images {
            let view =
                gpu.create_image_view(image, self.format.format, vk::ImageAspectFlags::COLOR)?;
            self.image_views.push(view);
        }

        self.depth.image = gpu.create_depth_image(self.extent, self.depth.format)?;
        self.depth.view = gpu.create_image_view(
            self.depth.image,
            self.depth.format,
            // Views used as depth attachments only carry the depth aspect
            vk::ImageAspectFlags::DEPTH,
        )?;
        Ok(())
    }

    /// Tears the swapchain down and builds a new one for the given size.
    ///
    /// Waits for the device to go idle first: images may still be referenced
    /// by command buffers in flight. On failure the swapchain is left
    /// destroyed and a later call builds it from scratch.
    pub fn recreate<G: Gpu>(&mut self, gpu: &G, width: u32, height: u32) -> RenderResult<()> {
        gpu.wait_idle()?;
        if !self.is_destroyed() {
            self.destroy(gpu);
        }
        *self = Self::create(gpu, width, height, self.preferences.clone())?;
        Ok(())
    }

    /// Releases every owned object. Calling it again is a no-op.
    pub fn destroy<G: Gpu>(&mut self, gpu: &G) {
        if self.is_destroyed() {
            warn!("Swapchain already destroyed");
            return;
        }
        self.release(gpu);
    }

    /// Destroys whatever is non-null; safe on partially built swapchains.
    fn release<G: Gpu>(&mut self, gpu: &G) {
        if self.depth.view != vk::ImageView::null() {
            gpu.destroy_image_view(self.depth.view);
            self.depth.view = vk::ImageView::null();
        }
        if self.depth.image != vk::Image::null() {
            gpu.destroy_depth_image(self.depth.image);
            self.depth.image = vk::Image::null();
        }
        for view in self.image_views.drain(..) {
            gpu.destroy_image_view(view);
        }
        // Presentable images belong to the swapchain handle
        self.images.clear();
        if self.handle != vk::SwapchainKHR::null() {
            gpu.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.handle == vk::SwapchainKHR::null()
            && self.image_views.is_empty()
            && self.depth.image == vk::Image::null()
            && self.depth.view == vk::ImageView::null()
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn image(&self, index: u32) -> vk::Image {
        self.images[index as usize]
    }

    pub fn image_view(&self, index: u32) -> vk::ImageView {
        self.image_views[index as usize]
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn depth(&self) -> &DepthBuffer {
        &self.depth
    }

    pub fn max_frames_in_flight(&self) -> usize {
        self.max_frames_in_flight
    }
}

/// Preferred format if offered, else whatever the surface lists first.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferences: &SwapchainPreferences,
) -> RenderResult<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| f.format == preferences.format && f.color_space == preferences.color_space)
        .or_else(|| formats.first())
        .copied()
        .ok_or(RenderError::NoSurfaceFormat)
}

/// Preferred mode if offered, else FIFO (always supported).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// The surface's current extent when it dictates one, otherwise the requested
/// size clamped into the allowed range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: width.clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: height.clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

pub fn choose_depth_format<G: Gpu>(gpu: &G, candidates: &[vk::Format]) -> RenderResult<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| gpu.supports_depth_format(format))
        .ok_or(RenderError::NoDepthFormat)
}
