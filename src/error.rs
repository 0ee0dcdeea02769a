// Error taxonomy for the frame core
//
// Capability errors stop initialization, resource errors stop the current
// call, contract errors come from misuse, device loss ends the render loop.
// Out-of-date surfaces never show up here: they are recovered inside the
// frame driver and reported as skipped frames.

use ash::vk;
use thiserror::Error;

use crate::backend::queues::QueueRole;

/// Broad class of a [`RenderError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The hardware or surface cannot do what we need.
    Capability,
    /// Object creation or allocation failed.
    Resource,
    /// The caller broke the API contract.
    Contract,
    /// The GPU is gone; nothing here can recover.
    DeviceLost,
}

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Vulkan error: {0}")]
    Vulkan(vk::Result),

    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Allocator error: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),

    #[error("No suitable GPU found")]
    NoSuitableDevice,

    #[error("Device has no queue family usable for {0:?}")]
    MissingQueueSupport(QueueRole),

    #[error("Surface reports no formats")]
    NoSurfaceFormat,

    #[error("No supported depth format among the candidates")]
    NoDepthFormat,

    #[error("Invalid surface size {width}x{height}")]
    InvalidSize { width: u32, height: u32 },

    #[error("GPU device lost")]
    DeviceLost,

    #[error("Surface error: {0}")]
    Surface(String),

    #[error("Render context is not initialized")]
    NotInitialized,
}

impl From<vk::Result> for RenderError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => Self::DeviceLost,
            other => Self::Vulkan(other),
        }
    }
}

impl RenderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoSuitableDevice
            | Self::MissingQueueSupport(_)
            | Self::NoSurfaceFormat
            | Self::NoDepthFormat
            | Self::Loading(_)
            | Self::Surface(_) => ErrorKind::Capability,
            Self::Vulkan(_) | Self::Allocator(_) => ErrorKind::Resource,
            Self::InvalidSize { .. } | Self::NotInitialized => ErrorKind::Contract,
            Self::DeviceLost => ErrorKind::DeviceLost,
        }
    }
}

pub type RenderResult<T> = std::result::Result<T, RenderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_lost_result_maps_to_device_lost() {
        let err: RenderError = vk::Result::ERROR_DEVICE_LOST.into();
        assert!(matches!(err, RenderError::DeviceLost));
        assert_eq!(err.kind(), ErrorKind::DeviceLost);
    }

    #[test]
    fn other_results_stay_resource_errors() {
        let err: RenderError = vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into();
        assert!(matches!(
            err,
            RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        ));
        assert_eq!(err.kind(), ErrorKind::Resource);
    }

    #[test]
    fn selection_failures_are_capability_errors() {
        assert_eq!(RenderError::NoSuitableDevice.kind(), ErrorKind::Capability);
        assert_eq!(
            RenderError::MissingQueueSupport(QueueRole::Compute).kind(),
            ErrorKind::Capability
        );
        assert_eq!(
            RenderError::InvalidSize { width: 0, height: 10 }.kind(),
            ErrorKind::Contract
        );
    }
}
