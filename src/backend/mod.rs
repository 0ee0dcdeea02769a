// Backend module - Vulkan abstraction layer
//
// Design: the frame core only sees the `Gpu` trait; `VulkanDevice` is the
// ash implementation. Selection policy stays free of Vulkan calls.

pub mod device;
pub mod gpu;
pub mod queues;
pub mod swapchain;
pub mod sync;

#[cfg(test)]
pub(crate) mod mock;

pub use device::VulkanDevice;
pub use gpu::Gpu;
pub use queues::{DeviceRequirements, QueueAssignment, QueueRole};
pub use swapchain::{Swapchain, SwapchainPreferences};
pub use sync::FrameSync;
