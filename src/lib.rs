//! Vulkan frame core: device selection, swapchain management and a frame
//! loop with bounded frames in flight.

pub mod backend;
pub mod config;
pub mod error;
pub mod frame;

pub use backend::{Gpu, VulkanDevice};
pub use config::Config;
pub use error::{ErrorKind, RenderError, RenderResult};
pub use frame::{FrameSettings, FrameStats, RenderContext, MAX_FRAMES_IN_FLIGHT};
