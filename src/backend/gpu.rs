// GPU operations used by the frame core
//
// The swapchain manager, the synchronizer and the frame driver only talk to
// the device through this trait. `VulkanDevice` implements it with ash; tests
// use a mock that checks the synchronization protocol.

use ash::vk;

use crate::error::RenderResult;

/// Result of waiting on a fence with a timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceWait {
    Signaled,
    TimedOut,
}

/// Result of asking the presentation engine for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// `image_available` will be signaled once the image is ready.
    Acquired { index: u32, suboptimal: bool },
    /// The surface changed; the swapchain must be rebuilt.
    OutOfDate,
    /// Timeout expired before an image was available.
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    /// Presented, but the swapchain no longer matches the surface exactly.
    Suboptimal,
    /// Not presented; the swapchain must be rebuilt.
    OutOfDate,
}

/// Parameters negotiated for a new swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub present_mode: vk::PresentModeKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

/// One image layout transition inside a pipeline barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTransition {
    pub image: vk::Image,
    pub aspect: vk::ImageAspectFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
}

impl ImageTransition {
    /// Freshly acquired swapchain image -> color attachment.
    /// Old contents are discarded.
    pub fn color_to_attachment(image: vk::Image) -> Self {
        Self {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        }
    }

    pub fn depth_to_attachment(image: vk::Image, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            image,
            aspect,
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            src_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            src_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        }
    }

    pub fn color_to_present(image: vk::Image) -> Self {
        Self {
            image,
            aspect: vk::ImageAspectFlags::COLOR,
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::PRESENT_SRC_KHR,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::empty(),
        }
    }
}

/// Attachments for one dynamic-rendering pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderTargets {
    pub color_view: vk::ImageView,
    pub depth_view: vk::ImageView,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
    pub clear_depth: f32,
}

/// Everything one frame's queue submission needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSubmission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// Device operations the frame core is built on.
///
/// Destroy methods must only be called with live, non-null handles; the
/// callers keep track of what they own.
pub trait Gpu {
    // Surface queries
    fn surface_capabilities(&self) -> RenderResult<vk::SurfaceCapabilitiesKHR>;
    fn surface_formats(&self) -> RenderResult<Vec<vk::SurfaceFormatKHR>>;
    fn surface_present_modes(&self) -> RenderResult<Vec<vk::PresentModeKHR>>;
    fn supports_depth_format(&self, format: vk::Format) -> bool;

    // Swapchain and attachments
    fn create_swapchain(&self, desc: &SwapchainDesc) -> RenderResult<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> RenderResult<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> RenderResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Creates a device-local depth image with its memory bound.
    fn create_depth_image(&self, extent: vk::Extent2D, format: vk::Format)
        -> RenderResult<vk::Image>;
    /// Destroys the image and releases its memory.
    fn destroy_depth_image(&self, image: vk::Image);

    // Synchronization
    fn create_semaphore(&self) -> RenderResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_fence(&self, signaled: bool) -> RenderResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> RenderResult<FenceWait>;
    fn reset_fence(&self, fence: vk::Fence) -> RenderResult<()>;
    /// Blocks until every queue is idle.
    fn wait_idle(&self) -> RenderResult<()>;

    // Command recording (graphics queue)
    fn allocate_command_buffers(&self, count: u32) -> RenderResult<Vec<vk::CommandBuffer>>;
    fn free_command_buffers(&self, buffers: &[vk::CommandBuffer]);
    /// Resets `cmd` and starts a one-time-submit recording.
    fn begin_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn end_commands(&self, cmd: vk::CommandBuffer) -> RenderResult<()>;
    fn cmd_set_viewport_scissor(&self, cmd: vk::CommandBuffer, extent: vk::Extent2D);
    fn cmd_transition_images(&self, cmd: vk::CommandBuffer, transitions: &[ImageTransition]);
    fn cmd_begin_rendering(&self, cmd: vk::CommandBuffer, targets: &RenderTargets);
    fn cmd_end_rendering(&self, cmd: vk::CommandBuffer);

    // Frame flow
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        signal: vk::Semaphore,
    ) -> RenderResult<AcquireOutcome>;
    /// Submits on the graphics queue.
    fn submit_frame(&self, submission: &FrameSubmission) -> RenderResult<()>;
    /// Presents on the present queue.
    fn present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<PresentOutcome>;
}
